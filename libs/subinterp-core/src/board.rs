//! Slot-array mailbox: atomic claim, post, and fetch of pickled items
//! backed by `SharedBuffer`s (spec §4.6).
//!
//! A `LockableBoard` is a fixed array of [`Slot`]s inside one `SharedBuffer`,
//! plus an anchor map keeping each posted item's payload buffer alive for
//! as long as its slot needs it.
//!
//! **Anchor ownership (resolves spec §9 Open Question (a)).** The Python
//! original stores each poster's anchors in that poster's own
//! interpreter-local dict, which only the board's original creator ever
//! sweeps — any payload anchored by a non-origin poster is never reclaimed
//! by `collect()`. Since this workspace's "interpreters" are OS threads
//! sharing one process (see `subinterp::host`), there is no reason to
//! split the anchor map by poster: it is a single `Arc<Mutex<_>>` shared by
//! every attachment of a board, written by whichever side calls
//! [`new_item`](LockableBoard::new_item) and swept only by the board's true
//! origin via [`collect`](LockableBoard::collect), matching the slot
//! invariant that `GARBAGE -> NOT_INIT` is an origin-only transition.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::byte_lock;
use crate::error::{CoreError, CoreResult};
use crate::shared_buffer::{SharedBuffer, SharedBufferHandle, DEFAULT_TTL};
use crate::struct_view;

const SLOT_STATE_OFF: usize = 0;
const SLOT_LOCK_OFF: usize = 1;
const SLOT_OWNER_OFF: usize = 4;
const SLOT_CONTENT_TYPE_OFF: usize = 8;
const SLOT_CONTENT_ADDR_OFF: usize = 16;
const SLOT_CONTENT_LEN_OFF: usize = 24;
/// `state(1) + lock(1) + pad(2) + owner(4) + content_type(1) + pad(7) +
/// content_address(8) + content_length(8)`, 8-byte aligned throughout.
pub const SLOT_SIZE: usize = 32;

pub const DEFAULT_CAPACITY: usize = 2048;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SlotState {
    NotInit = 0,
    Building = 1,
    Ready = 2,
    Locked = 3,
    Garbage = 4,
}

impl SlotState {
    fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(SlotState::NotInit),
            1 => Some(SlotState::Building),
            2 => Some(SlotState::Ready),
            3 => Some(SlotState::Locked),
            4 => Some(SlotState::Garbage),
            _ => None,
        }
    }
}

/// Wire form of a [`LockableBoard`]: the slot array's `SharedBuffer` handle
/// plus the shared anchor map and owner-gone counter every attachment needs
/// to see the same state.
#[derive(Clone)]
pub struct LockableBoardHandle {
    pub buf: SharedBufferHandle,
    pub capacity: usize,
    anchors: Arc<Mutex<HashMap<usize, SharedBuffer>>>,
    gone_counter: Arc<AtomicU64>,
}

/// A shared mailbox: a fixed array of slots, each either empty, mid-post,
/// holding a ready item, claimed by a consumer, or garbage awaiting reuse.
pub struct LockableBoard {
    buf: SharedBuffer,
    capacity: usize,
    anchors: Arc<Mutex<HashMap<usize, SharedBuffer>>>,
    gone_counter: Arc<AtomicU64>,
    is_origin: bool,
}

impl LockableBoard {
    /// Allocates a fresh board of `capacity` slots.
    pub fn create(capacity: usize) -> CoreResult<Self> {
        let mut buf = SharedBuffer::create(capacity * SLOT_SIZE, DEFAULT_TTL);
        buf.start()?;
        Ok(LockableBoard {
            buf,
            capacity,
            anchors: Arc::new(Mutex::new(HashMap::new())),
            gone_counter: Arc::new(AtomicU64::new(0)),
            is_origin: true,
        })
    }

    /// Serializes this board for another interpreter to [`attach`](Self::attach).
    pub fn handle(&mut self) -> CoreResult<LockableBoardHandle> {
        Ok(LockableBoardHandle {
            buf: self.buf.serialize()?,
            capacity: self.capacity,
            anchors: self.anchors.clone(),
            gone_counter: self.gone_counter.clone(),
        })
    }

    /// Attaches to a board described by `handle`, as a non-origin consumer
    /// or an additional poster.
    ///
    /// # Safety
    /// The origin's slot-array `SharedBuffer` must still be live.
    pub unsafe fn attach(handle: LockableBoardHandle) -> CoreResult<Self> {
        // SAFETY: forwarded from this function's contract.
        let mut buf = unsafe { SharedBuffer::attach(handle.buf) };
        buf.start()?;
        Ok(LockableBoard {
            buf,
            capacity: handle.capacity,
            anchors: handle.anchors,
            gone_counter: handle.gone_counter,
            is_origin: false,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of `READY` items that were skipped at fetch time because
    /// their poster is no longer alive; `Queue::get` consumes one signal
    /// byte per count here to keep its pipe and slot counts aligned.
    pub fn owner_gone_count(&self) -> u64 {
        self.gone_counter.load(Ordering::Acquire)
    }

    pub fn take_owner_gone(&self) -> bool {
        self.gone_counter
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
                if v > 0 {
                    Some(v - 1)
                } else {
                    None
                }
            })
            .is_ok()
    }

    fn slot_ptr(&self, index: usize) -> *mut u8 {
        (self.buf.payload_address() + index * SLOT_SIZE) as *mut u8
    }

    fn slot_state(&self, index: usize) -> SlotState {
        // SAFETY: index < capacity is the caller's contract, upheld by every
        // method below via bounded scans.
        let byte = unsafe { struct_view::read_u8(self.slot_ptr(index), SLOT_STATE_OFF) };
        SlotState::from_byte(byte).expect("corrupt slot state byte")
    }

    fn set_slot_state(&self, index: usize, state: SlotState) {
        // SAFETY: see `slot_state`.
        unsafe { struct_view::write_u8(self.slot_ptr(index), SLOT_STATE_OFF, state as u8) };
    }

    /// Posts `payload` (already serialized by the caller) into a free slot,
    /// returning its index. The payload is kept alive in the shared anchor
    /// map for as long as the slot needs it.
    pub fn new_item(&self, payload: &[u8], owner: u32) -> CoreResult<usize> {
        let mut anchor = SharedBuffer::from_payload(payload, DEFAULT_TTL);
        anchor.start()?;
        let content_address = anchor.payload_address() as u64;
        let content_length = payload.len() as u64;

        let index = self.claim_free_slot()?;
        let ptr = self.slot_ptr(index);
        // SAFETY: `index` was just claimed exclusively (its lock byte is 1
        // and only this caller holds it) and is within bounds.
        unsafe {
            struct_view::write_u32(ptr, SLOT_OWNER_OFF, owner);
            struct_view::write_u8(ptr, SLOT_CONTENT_TYPE_OFF, 0);
            struct_view::write_u64(ptr, SLOT_CONTENT_ADDR_OFF, content_address);
            struct_view::write_u64(ptr, SLOT_CONTENT_LEN_OFF, content_length);
            struct_view::write_u8(ptr, SLOT_STATE_OFF, SlotState::Ready as u8);
        }
        self.anchors
            .lock()
            .expect("anchor map poisoned")
            .insert(index, anchor);
        // SAFETY: releases the lock byte claimed by `claim_free_slot`.
        unsafe { byte_lock::release(ptr.add(SLOT_LOCK_OFF)) };
        tracing::trace!(index, owner, "board: posted item");
        Ok(index)
    }

    /// Linear scan for a reusable slot (`NOT_INIT` or `GARBAGE`, lock byte
    /// free), CAS-claiming its lock and marking it `BUILDING`. No fairness:
    /// first successful CAS wins (spec §9 Open Question (b)).
    fn claim_free_slot(&self) -> CoreResult<usize> {
        for index in 0..self.capacity {
            let ptr = self.slot_ptr(index);
            let state = self.slot_state(index);
            if !matches!(state, SlotState::NotInit | SlotState::Garbage) {
                continue;
            }
            // SAFETY: slot lock byte is live for the board's lifetime.
            if unsafe { byte_lock::try_acquire(ptr.add(SLOT_LOCK_OFF)) } {
                if state == SlotState::Garbage {
                    self.anchors.lock().expect("anchor map poisoned").remove(&index);
                }
                self.set_slot_state(index, SlotState::Building);
                return Ok(index);
            }
        }
        Err(CoreError::InvalidState("board full, no free slot to claim"))
    }

    /// Atomically claims and reads the oldest `READY` item whose poster is
    /// still alive, marking its slot `GARBAGE`. `is_alive` answers whether a
    /// given interpreter handle (the slot's `owner`) is still live; a slot
    /// whose owner has died is marked `GARBAGE` without being returned, and
    /// bumps the owner-gone counter consumers use to keep their signal pipe
    /// in sync (spec §4.6/§4.8).
    pub fn fetch_item(&self, is_alive: impl Fn(u32) -> bool) -> CoreResult<Option<(usize, Vec<u8>)>> {
        for index in 0..self.capacity {
            if self.slot_state(index) != SlotState::Ready {
                continue;
            }
            let ptr = self.slot_ptr(index);
            // SAFETY: slot lock byte is live for the board's lifetime.
            if !unsafe { byte_lock::try_acquire(ptr.add(SLOT_LOCK_OFF)) } {
                continue;
            }
            // SAFETY: see `slot_state`.
            let owner = unsafe { struct_view::read_u32(ptr, SLOT_OWNER_OFF) };
            if !is_alive(owner) {
                self.set_slot_state(index, SlotState::Garbage);
                self.gone_counter.fetch_add(1, Ordering::AcqRel);
                // SAFETY: releases the lock just claimed above.
                unsafe { byte_lock::release(ptr.add(SLOT_LOCK_OFF)) };
                tracing::debug!(index, owner, "board: skipped item from a dead interpreter");
                continue;
            }
            self.set_slot_state(index, SlotState::Locked);
            // SAFETY: releases the lock just claimed above; the `Locked`
            // state itself now marks this slot as claimed.
            unsafe { byte_lock::release(ptr.add(SLOT_LOCK_OFF)) };

            // SAFETY: see `slot_state`.
            let (content_address, content_length) = unsafe {
                (
                    struct_view::read_u64(ptr, SLOT_CONTENT_ADDR_OFF),
                    struct_view::read_u64(ptr, SLOT_CONTENT_LEN_OFF),
                )
            };
            // SAFETY: the anchor SharedBuffer for this slot is still alive
            // (it is only dropped by `collect()`, which never runs on a
            // `LOCKED` slot), so this address/length still names live bytes.
            let bytes = unsafe {
                struct_view::read_bytes(content_address as *mut u8, 0, content_length as usize)
            };
            self.set_slot_state(index, SlotState::Garbage);
            tracing::trace!(index, owner, "board: fetched item");
            return Ok(Some((index, bytes)));
        }
        Ok(None)
    }

    /// Reclaims every `GARBAGE` slot into `NOT_INIT`, dropping its anchor.
    /// Origin-only, mirroring the slot invariant that `GARBAGE -> NOT_INIT`
    /// only happens on the board's parent. Returns the number of free
    /// (`NOT_INIT`) slots after the sweep.
    pub fn collect(&self) -> CoreResult<usize> {
        if !self.is_origin {
            return Err(CoreError::InvalidState("collect() is origin-only"));
        }
        let mut free = 0;
        for index in 0..self.capacity {
            match self.slot_state(index) {
                SlotState::Garbage => {
                    let ptr = self.slot_ptr(index);
                    // SAFETY: slot lock byte is live for the board's lifetime.
                    if unsafe { byte_lock::try_acquire(ptr.add(SLOT_LOCK_OFF)) } {
                        self.anchors.lock().expect("anchor map poisoned").remove(&index);
                        // SAFETY: see `slot_state`.
                        unsafe {
                            struct_view::write_u32(ptr, SLOT_OWNER_OFF, 0);
                            struct_view::write_u64(ptr, SLOT_CONTENT_ADDR_OFF, 0);
                            struct_view::write_u64(ptr, SLOT_CONTENT_LEN_OFF, 0);
                        }
                        self.set_slot_state(index, SlotState::NotInit);
                        // SAFETY: releases the lock just claimed above.
                        unsafe { byte_lock::release(ptr.add(SLOT_LOCK_OFF)) };
                        free += 1;
                    }
                }
                SlotState::NotInit => free += 1,
                _ => {}
            }
        }
        Ok(free)
    }

    /// Deletes slot `index`; fails if it is currently `LOCKED`. Origin-only.
    pub fn delete(&self, index: usize) -> CoreResult<()> {
        if !self.is_origin {
            return Err(CoreError::InvalidState("del is origin-only"));
        }
        let ptr = self.slot_ptr(index);
        // SAFETY: slot lock byte is live for the board's lifetime.
        if !unsafe { byte_lock::try_acquire(ptr.add(SLOT_LOCK_OFF)) } {
            return Err(CoreError::ResourceBusy);
        }
        let state = self.slot_state(index);
        if state == SlotState::Locked {
            // SAFETY: releases the lock just claimed above.
            unsafe { byte_lock::release(ptr.add(SLOT_LOCK_OFF)) };
            return Err(CoreError::InvalidState("slot is locked by a consumer"));
        }
        self.anchors.lock().expect("anchor map poisoned").remove(&index);
        // SAFETY: see `slot_state`.
        unsafe {
            struct_view::write_u32(ptr, SLOT_OWNER_OFF, 0);
            struct_view::write_u64(ptr, SLOT_CONTENT_ADDR_OFF, 0);
            struct_view::write_u64(ptr, SLOT_CONTENT_LEN_OFF, 0);
        }
        self.set_slot_state(index, SlotState::NotInit);
        // SAFETY: releases the lock just claimed above.
        unsafe { byte_lock::release(ptr.add(SLOT_LOCK_OFF)) };
        Ok(())
    }

    pub fn close(self) -> CoreResult<()> {
        self.buf.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn post_then_fetch_round_trips_bytes() {
        let board = LockableBoard::create(8).unwrap();
        let idx = board.new_item(b"payload", 1).unwrap();
        assert_eq!(board.slot_state(idx), SlotState::Ready);
        let (got_idx, bytes) = board.fetch_item(|_| true).unwrap().unwrap();
        assert_eq!(got_idx, idx);
        assert_eq!(bytes, b"payload");
        assert_eq!(board.slot_state(idx), SlotState::Garbage);
        board.close().unwrap();
    }

    #[test]
    fn fetch_skips_dead_owner_and_counts_it() {
        let board = LockableBoard::create(4).unwrap();
        board.new_item(b"x", 99).unwrap();
        let result = board.fetch_item(|owner| owner != 99).unwrap();
        assert!(result.is_none());
        assert_eq!(board.owner_gone_count(), 1);
        board.close().unwrap();
    }

    #[test]
    fn collect_reclaims_garbage_slots() {
        let board = LockableBoard::create(4).unwrap();
        let idx = board.new_item(b"x", 1).unwrap();
        board.fetch_item(|_| true).unwrap();
        assert_eq!(board.slot_state(idx), SlotState::Garbage);
        let free = board.collect().unwrap();
        assert_eq!(free, 4);
        assert_eq!(board.slot_state(idx), SlotState::NotInit);
        board.close().unwrap();
    }

    #[test]
    fn delete_rejects_locked_slot() {
        let board = LockableBoard::create(4).unwrap();
        let idx = board.new_item(b"x", 1).unwrap();
        board.set_slot_state(idx, SlotState::Locked);
        assert!(matches!(board.delete(idx), Err(CoreError::InvalidState(_))));
    }

    /// Several threads hammer `new_item`/`fetch_item` with randomly sized
    /// payloads at once; every posted item must be fetched exactly once and
    /// no two posters may ever be handed the same slot index.
    #[test]
    fn concurrent_posts_never_collide_on_a_slot() {
        use rand::Rng;
        use std::sync::{Arc, Mutex as StdMutex};

        let board = Arc::new(LockableBoard::create(256).unwrap());
        let seen_indices = Arc::new(StdMutex::new(std::collections::HashSet::new()));

        std::thread::scope(|scope| {
            for poster in 0..8u32 {
                let board = board.clone();
                let seen_indices = seen_indices.clone();
                scope.spawn(move || {
                    let mut rng = rand::thread_rng();
                    for _ in 0..20 {
                        let len = rng.gen_range(1..64);
                        let payload: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
                        let index = board.new_item(&payload, poster).unwrap();
                        let fresh = seen_indices.lock().unwrap().insert(index);
                        assert!(fresh, "slot {index} claimed twice concurrently");
                    }
                });
            }
        });

        let mut fetched = 0;
        while board.fetch_item(|_| true).unwrap().is_some() {
            fetched += 1;
        }
        assert_eq!(fetched, 8 * 20);
        Arc::try_unwrap(board).ok().unwrap().close().unwrap();
    }
}
