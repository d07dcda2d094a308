//! Reference-counted, TTL-bounded cross-interpreter byte region (spec §4.3).
//!
//! A `SharedBuffer` is `N` payload bytes plus a small header carrying a lock
//! byte and a lifecycle tag. The origin side owns the backing allocation;
//! every other interpreter holds a weak view built from a raw
//! `(address, length)` pair handed across the boundary by [`serialize`].
//! There is deliberately no refcounting at the Rust ownership level here —
//! that is the entire point of the component: correctness comes from the
//! lock-protected lifecycle state machine and the TTL, not from the borrow
//! checker, because the consumer side lives in a different interpreter that
//! the checker cannot see into.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;

use crate::byte_lock::{LockGuard, LockTimeout, ScopedLock};
use crate::error::{CoreError, CoreResult};
use crate::struct_view::{self, RawView};

const LOCK_OFFSET: usize = 0;
const STATE_OFFSET: usize = 1;
// bytes 2..4 are padding so the u24 fields below land on a 4-byte boundary.
const ENTER_COUNT_OFFSET: usize = 4;
const EXIT_COUNT_OFFSET: usize = 8;
/// Total header size: `lock(1) + state(1) + pad(2) + enter_count(4) + exit_count(4)`.
pub const HEADER_SIZE: usize = 12;

pub const DEFAULT_TTL: Duration = Duration::from_secs(3600);

/// Lifecycle tag stored in the header's `state` byte.
///
/// Monotone path `Building -> Ready -> Serialized <-> Received -> Garbage`;
/// see the invariants on [`SharedBuffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BufferState {
    Building = 0,
    Ready = 1,
    Serialized = 2,
    Received = 3,
    Garbage = 4,
}

impl BufferState {
    fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(BufferState::Building),
            1 => Some(BufferState::Ready),
            2 => Some(BufferState::Serialized),
            3 => Some(BufferState::Received),
            4 => Some(BufferState::Garbage),
            _ => None,
        }
    }

    fn is_transferable(self) -> bool {
        matches!(
            self,
            BufferState::Serialized | BufferState::Received | BufferState::Ready
        )
    }
}

/// Whether the local view is usable for byte-level reads/writes right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataState {
    NotReady,
    ReadOnly,
    ReadWrite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BufferMode {
    Origin,
    Remote,
}

/// The wire form of a `SharedBuffer`: everything a different interpreter
/// needs to attach a weak view onto the same memory. Carries only a raw
/// address and length plus the bookkeeping needed to enforce the TTL —
/// there is no reference counting here, by design (see the module docs).
#[derive(Debug, Clone, Copy)]
pub struct SharedBufferHandle {
    address: usize,
    total_len: usize,
    pub ttl: Duration,
    pub timestamp: Instant,
}

/// A contiguous byte region shared across interpreters, with a lock byte
/// and lifecycle tag in its header.
///
/// Invariants enforced by this type's methods (spec §3):
/// - a buffer in `Building` is reachable only through the `SharedBuffer`
///   that created it (never serialized yet);
/// - `Serialized`/`Received` implies at least one handle has left the
///   origin;
/// - a buffer advances to `Garbage` only when `exit_count >= enter_count`
///   and its TTL has elapsed;
/// - once `Garbage`, the payload bytes are never read or written again.
pub struct SharedBuffer {
    view: RawView,
    lock: ScopedLock,
    mode: BufferMode,
    data_state: DataState,
    payload_size: usize,
    ttl: Duration,
    timestamp: Option<Instant>,
    cursor: usize,
}

// Raw pointers inside `view`/`lock` denote memory meant to be shared across
// interpreter/thread boundaries; all mutation through `&self` goes through
// atomic operations, and `&mut self` methods are exclusive per Rust's own
// rules, so both traits are sound despite the raw pointers.
unsafe impl Send for SharedBuffer {}
unsafe impl Sync for SharedBuffer {}

impl SharedBuffer {
    /// Allocate a new, origin-owned buffer of `payload_size` bytes.
    /// Starts life in `Building`, reachable only by the caller.
    pub fn create(payload_size: usize, ttl: Duration) -> Self {
        let view = RawView::owned(HEADER_SIZE + payload_size);
        // SAFETY: `view` was just allocated with exactly this size.
        let lock = unsafe { ScopedLock::new(view.ptr().add(LOCK_OFFSET)) };
        SharedBuffer {
            view,
            lock,
            mode: BufferMode::Origin,
            data_state: DataState::NotReady,
            payload_size,
            ttl,
            timestamp: None,
            cursor: 0,
        }
    }

    /// Allocate an origin-owned buffer pre-filled with `payload`.
    pub fn from_payload(payload: &[u8], ttl: Duration) -> Self {
        let mut buf = Self::create(payload.len(), ttl);
        // SAFETY: `payload.len()` bytes fit exactly in the freshly sized region.
        unsafe {
            struct_view::write_bytes(buf.view.ptr(), HEADER_SIZE, payload);
        }
        buf
    }

    /// Attach a weak, non-origin view onto a region described by `handle`.
    /// The view is unusable for byte access until [`start`](Self::start).
    ///
    /// # Safety
    /// The memory `handle` describes must still be live: the origin
    /// `SharedBuffer` (or a limbo entry keeping it alive) must not have been
    /// dropped.
    pub unsafe fn attach(handle: SharedBufferHandle) -> Self {
        let ptr = handle.address as *mut u8;
        // SAFETY: caller guarantees the region is live for `total_len` bytes.
        let view = unsafe { RawView::attach_at(ptr, handle.total_len, 0, handle.total_len) };
        // SAFETY: the lock byte is the first byte of that same live region.
        let lock = unsafe { ScopedLock::new(ptr.add(LOCK_OFFSET)) };
        SharedBuffer {
            view,
            lock,
            mode: BufferMode::Remote,
            data_state: DataState::NotReady,
            payload_size: handle.total_len - HEADER_SIZE,
            ttl: handle.ttl,
            timestamp: Some(handle.timestamp),
            cursor: 0,
        }
    }

    #[inline]
    fn state(&self) -> BufferState {
        // SAFETY: offset is within the header, which is within `view`.
        let byte = unsafe { struct_view::read_u8(self.view.ptr(), STATE_OFFSET) };
        BufferState::from_byte(byte).expect("corrupt header state byte")
    }

    #[inline]
    fn set_state(&self, state: BufferState) {
        // SAFETY: see `state`.
        unsafe { struct_view::write_u8(self.view.ptr(), STATE_OFFSET, state as u8) };
    }

    #[inline]
    fn enter_count(&self) -> u32 {
        // SAFETY: see `state`.
        unsafe { struct_view::read_u24(self.view.ptr(), ENTER_COUNT_OFFSET) }
    }

    #[inline]
    fn exit_count(&self) -> u32 {
        // SAFETY: see `state`.
        unsafe { struct_view::read_u24(self.view.ptr(), EXIT_COUNT_OFFSET) }
    }

    #[inline]
    fn bump_enter_count(&self) {
        let next = self.enter_count() + 1;
        // SAFETY: see `state`.
        unsafe { struct_view::write_u24(self.view.ptr(), ENTER_COUNT_OFFSET, next) };
    }

    #[inline]
    fn bump_exit_count(&self) {
        let next = self.exit_count() + 1;
        // SAFETY: see `state`.
        unsafe { struct_view::write_u24(self.view.ptr(), EXIT_COUNT_OFFSET, next) };
    }

    /// `true` if the TTL (measured from serialization) has not elapsed.
    /// A buffer never serialized has no TTL clock running yet.
    fn check_ttl(&self) -> bool {
        match self.timestamp {
            None => true,
            Some(ts) => ts.elapsed() <= self.ttl,
        }
    }

    fn acquire_header_lock(&self) -> CoreResult<LockGuard<'_>> {
        self.lock.acquire(LockTimeout::After(crate::byte_lock::DEFAULT_TIMEOUT))
    }

    /// The raw address of the payload region, for code (e.g. `Pipe`,
    /// `LockableBoard`) that needs to embed a pointer to this buffer's data
    /// inside another structure.
    pub fn payload_address(&self) -> usize {
        // SAFETY: `view` spans `HEADER_SIZE + payload_size` live bytes.
        unsafe { self.view.ptr().add(HEADER_SIZE) as usize }
    }

    pub fn payload_len(&self) -> usize {
        self.payload_size
    }

    pub fn is_origin(&self) -> bool {
        self.mode == BufferMode::Origin
    }

    /// Acquire the header lock for the duration of the returned guard, for
    /// callers that need an externally-visible critical section (e.g. a
    /// `Lock`/`RLock` built atop a single-byte buffer).
    pub fn acquire(&self, timeout: LockTimeout) -> CoreResult<LockGuard<'_>> {
        self.lock.acquire(timeout)
    }

    /// On the origin: `Building -> Ready`. On a remote (attached) instance:
    /// verifies the TTL, acquires the header lock, verifies the state is
    /// `Serialized` or `Received`, transitions to `Received`, and bumps
    /// `enter_count`.
    pub fn start(&mut self) -> CoreResult<()> {
        match self.mode {
            BufferMode::Origin => {
                if self.state() != BufferState::Building {
                    return Err(CoreError::InvalidState("buffer already started"));
                }
                self.set_state(BufferState::Ready);
                self.data_state = DataState::ReadWrite;
                Ok(())
            }
            BufferMode::Remote => {
                if !self.check_ttl() {
                    return Err(CoreError::TtlExceeded);
                }
                let guard = self.acquire_header_lock()?;
                if !self.check_ttl() {
                    drop(guard);
                    return Err(CoreError::TtlExceeded);
                }
                let state = self.state();
                if !matches!(state, BufferState::Serialized | BufferState::Received) {
                    return Err(CoreError::InvalidState("buffer not serialized"));
                }
                self.set_state(BufferState::Received);
                self.bump_enter_count();
                drop(guard);
                self.data_state = DataState::ReadWrite;
                Ok(())
            }
        }
    }

    /// Marks this buffer ready to hand across an interpreter boundary:
    /// `Ready -> Serialized` (a no-op if already `Serialized`/`Received`),
    /// stamps a fresh TTL clock, and returns the wire handle.
    pub fn serialize(&mut self) -> CoreResult<SharedBufferHandle> {
        let guard = self.acquire_header_lock()?;
        let state = self.state();
        if !state.is_transferable() {
            return Err(CoreError::InvalidState("buffer not in a transferable state"));
        }
        if state == BufferState::Ready {
            self.set_state(BufferState::Serialized);
        }
        drop(guard);
        let timestamp = Instant::now();
        self.timestamp = Some(timestamp);
        Ok(SharedBufferHandle {
            address: self.view.ptr() as usize,
            total_len: HEADER_SIZE + self.payload_size,
            ttl: self.ttl,
            timestamp,
        })
    }

    /// Reads `n` bytes (or the remainder, if `n` is `None`) from the
    /// current cursor, advancing it.
    pub fn read(&mut self, n: Option<usize>) -> CoreResult<Vec<u8>> {
        let _guard = self.acquire_header_lock()?;
        self.ensure_ready()?;
        let remaining = self.payload_size.saturating_sub(self.cursor);
        let take = n.unwrap_or(remaining).min(remaining);
        let start = self.cursor;
        self.cursor += take;
        // SAFETY: `start + take <= payload_size`, checked above.
        Ok(unsafe { struct_view::read_bytes(self.view.ptr(), HEADER_SIZE + start, take) })
    }

    /// Writes `content` at the current cursor, advancing it.
    pub fn write(&mut self, content: &[u8]) -> CoreResult<()> {
        let _guard = self.acquire_header_lock()?;
        self.ensure_ready()?;
        if self.cursor + content.len() > self.payload_size {
            return Err(CoreError::PayloadTooLarge {
                len: self.cursor + content.len(),
                capacity: self.payload_size,
            });
        }
        // SAFETY: bounds checked above.
        unsafe { struct_view::write_bytes(self.view.ptr(), HEADER_SIZE + self.cursor, content) };
        self.cursor += content.len();
        Ok(())
    }

    pub fn tell(&self) -> usize {
        self.cursor
    }

    pub fn seek(&mut self, pos: usize) {
        self.cursor = pos;
    }

    /// Reads `len` bytes at a fixed payload offset, independent of the cursor.
    pub fn get(&self, offset: usize, len: usize) -> CoreResult<Vec<u8>> {
        self.ensure_ready()?;
        if offset + len > self.payload_size {
            return Err(CoreError::InvalidState("read out of bounds"));
        }
        // SAFETY: bounds checked above.
        Ok(unsafe { struct_view::read_bytes(self.view.ptr(), HEADER_SIZE + offset, len) })
    }

    /// Writes `bytes` at a fixed payload offset, under the header lock.
    pub fn set(&self, offset: usize, bytes: &[u8]) -> CoreResult<()> {
        self.ensure_ready()?;
        if offset + bytes.len() > self.payload_size {
            return Err(CoreError::PayloadTooLarge {
                len: offset + bytes.len(),
                capacity: self.payload_size,
            });
        }
        let _guard = self.acquire_header_lock()?;
        // SAFETY: bounds checked above.
        unsafe { struct_view::write_bytes(self.view.ptr(), HEADER_SIZE + offset, bytes) };
        Ok(())
    }

    fn ensure_ready(&self) -> CoreResult<()> {
        if self.data_state == DataState::ReadWrite {
            Ok(())
        } else {
            Err(CoreError::BufferNotReady)
        }
    }

    /// On a remote instance: bumps `exit_count` and drops the local view.
    /// On the origin: reclaims immediately (`Garbage`) if the buffer was
    /// never serialized, or if the TTL has elapsed and every entry has a
    /// matching exit; otherwise the instance is parked in the process-wide
    /// limbo registry for [`notify_major_collection`] to retry later.
    pub fn close(mut self) -> CoreResult<()> {
        match self.mode {
            BufferMode::Remote => {
                if self.data_state == DataState::NotReady {
                    return Ok(());
                }
                {
                    let _guard = self.acquire_header_lock()?;
                    self.bump_exit_count();
                }
                self.data_state = DataState::NotReady;
                Ok(())
            }
            BufferMode::Origin => {
                {
                    let _guard = self.acquire_header_lock()?;
                    let early = matches!(self.state(), BufferState::Building | BufferState::Ready);
                    if early {
                        self.set_state(BufferState::Garbage);
                    }
                    let ttl_elapsed = !self.check_ttl();
                    if ttl_elapsed && self.exit_count() >= self.enter_count() {
                        self.set_state(BufferState::Garbage);
                    }
                }
                if self.state() == BufferState::Garbage {
                    self.data_state = DataState::NotReady;
                    return Ok(());
                }
                self.data_state = DataState::NotReady;
                push_to_limbo(self);
                Ok(())
            }
        }
    }
}

/// Process-global parking lot for origin buffers whose `close()` couldn't
/// reclaim them yet because consumers hadn't released in time. Swept by
/// [`notify_major_collection`], the stand-in for the runtime's
/// garbage-collection hook named in spec §6.
static LIMBO: Lazy<Mutex<Vec<SharedBuffer>>> = Lazy::new(|| Mutex::new(Vec::new()));

fn push_to_limbo(buffer: SharedBuffer) {
    LIMBO.lock().expect("limbo registry poisoned").push(buffer);
}

/// Retries `close()` on every buffer parked in limbo, dropping (and so
/// freeing) the ones that can now be reclaimed. Intended to be called from
/// a host-runtime hook run on every major collection; nothing breaks if it
/// is simply never called other than buffers staying pinned longer than
/// strictly necessary.
pub fn notify_major_collection() {
    let pending: Vec<SharedBuffer> = {
        let mut guard = LIMBO.lock().expect("limbo registry poisoned");
        std::mem::take(&mut *guard)
    };
    // `close()` re-parks anything still stuck via `push_to_limbo`, so we
    // just need to retry every entry once; no extra bookkeeping here.
    for buffer in pending {
        if let Err(err) = buffer.close() {
            tracing::warn!(%err, "limbo sweep retry failed, buffer stays pinned");
        }
    }
}
