//! Many-producer/many-consumer queue: a [`LockableBoard`] for data plus a
//! [`SimplexPipe`] for wakeups (spec §4.8).
//!
//! `put` posts a pickled item onto the board, then writes one ready byte to
//! the signal pipe; `get` waits for that byte, then claims a ready slot. The
//! two halves can drift out of sync when a producer dies mid-post or a
//! consumer is skipped past a dead-owner slot — [`LockableBoard`]'s
//! owner-gone counter is exactly how `get` re-aligns pipe byte count with
//! slot count in that case (spec's "owner-gone" rule, carried verbatim from
//! `board::LockableBoard::fetch_item`'s docs).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};

use subinterp_core::board::{LockableBoard, LockableBoardHandle, DEFAULT_CAPACITY};
use subinterp_core::pipe::{SimplexPipe, SimplexPipeHandle};

use crate::error::{SubinterpError, SubinterpResult};
use crate::host::{HostRuntime, InterpreterHandle};

/// Wire form of a [`Queue`]: everything another interpreter needs to attach
/// to the same board and signal pipe and see the same length counter.
pub struct QueueHandle {
    board: LockableBoardHandle,
    signal: SimplexPipeHandle,
    origin: InterpreterHandle,
    maxsize: usize,
    len: Arc<AtomicU64>,
}

/// A queue reachable by every interpreter that has unpickled a copy of it,
/// including the one that created it (spec §4.8's "origin can consume its
/// own post" note — the signal pipe's counterpart fd is reachable from the
/// origin exactly like any other attachment).
pub struct Queue<H: HostRuntime> {
    host: Arc<H>,
    board: LockableBoard,
    signal: SimplexPipe,
    origin: InterpreterHandle,
    maxsize: usize,
    len: Arc<AtomicU64>,
    /// Per-attachment FIFO of items already claimed off the board but not
    /// yet handed to a caller. `get` always drains this before touching the
    /// board again, so a caller never loses an item it already paid the
    /// slot-claim cost for.
    fifo: Mutex<VecDeque<Vec<u8>>>,
}

impl<H: HostRuntime> Queue<H> {
    /// Creates a new queue with `DEFAULT_CAPACITY` slots. `maxsize = 0`
    /// means unbounded, matching the Python surface's `Queue(maxsize=0)`.
    pub fn create(host: Arc<H>, maxsize: usize) -> SubinterpResult<Self> {
        Self::create_with_capacity(host, maxsize, DEFAULT_CAPACITY)
    }

    pub fn create_with_capacity(host: Arc<H>, maxsize: usize, capacity: usize) -> SubinterpResult<Self> {
        let board = LockableBoard::create(capacity)?;
        let signal = SimplexPipe::create()?;
        let origin = host.current_interpreter();
        Ok(Queue {
            host,
            board,
            signal,
            origin,
            maxsize,
            len: Arc::new(AtomicU64::new(0)),
            fifo: Mutex::new(VecDeque::new()),
        })
    }

    /// Serializes this queue for another interpreter to [`attach`](Self::attach).
    pub fn handle(&mut self) -> SubinterpResult<QueueHandle> {
        Ok(QueueHandle {
            board: self.board.handle()?,
            signal: self.signal.handle()?,
            origin: self.origin,
            maxsize: self.maxsize,
            len: self.len.clone(),
        })
    }

    /// Attaches to a queue described by `handle`. Usable as a producer, a
    /// consumer, or both.
    ///
    /// # Safety
    /// The origin's board and signal pipe must still be live.
    pub unsafe fn attach(host: Arc<H>, handle: QueueHandle) -> SubinterpResult<Self> {
        // SAFETY: forwarded from this function's contract.
        let board = unsafe { LockableBoard::attach(handle.board)? };
        // SAFETY: see above.
        let signal = unsafe { SimplexPipe::attach(handle.signal)? };
        Ok(Queue {
            host,
            board,
            signal,
            origin: handle.origin,
            maxsize: handle.maxsize,
            len: handle.len,
            fifo: Mutex::new(VecDeque::new()),
        })
    }

    pub fn origin(&self) -> InterpreterHandle {
        self.origin
    }

    /// Approximate current size; like Python's `qsize()`, this is a hint,
    /// not a guarantee against a racing `put`/`get`.
    pub fn qsize(&self) -> usize {
        self.len.load(Ordering::Acquire) as usize
    }

    fn is_full(&self) -> bool {
        self.maxsize > 0 && self.qsize() >= self.maxsize
    }

    /// Posts `item` onto the board, then signals it. On signal-send failure
    /// (e.g. a `BrokenChannel` because every reader has gone away) the
    /// freshly-posted slot is deleted so it doesn't linger as an
    /// unreachable `READY` entry, and the error is returned to the caller.
    pub fn put<T: Serialize>(&self, item: &T, block: bool, timeout: Option<Duration>) -> SubinterpResult<()> {
        let deadline = deadline_for(block, timeout);
        while self.is_full() {
            if Instant::now() >= deadline_or_now(deadline, block) {
                return Err(SubinterpError::Full);
            }
            std::thread::sleep(subinterp_core::byte_lock::TIME_RESOLUTION * 4);
        }

        let payload = bincode::serialize(item)?;
        let owner = self.host.current_interpreter();
        let index = self.board.new_item(&payload, owner)?;

        if let Err(err) = self.signal.send(b"\x01", timeout) {
            let _ = self.board.delete(index);
            return Err(err.into());
        }
        self.len.fetch_add(1, Ordering::AcqRel);
        tracing::trace!(index, owner, "queue: put");
        Ok(())
    }

    pub fn put_nowait<T: Serialize>(&self, item: &T) -> SubinterpResult<()> {
        self.put(item, false, None)
    }

    /// Waits for a signal byte, then claims the oldest live `READY` slot.
    /// When a skipped (owner-gone) slot desynchronizes the pipe/board
    /// counts, consumes one extra signal byte per skip and retries within
    /// the remaining deadline, per spec §4.8.
    pub fn get<T: DeserializeOwned>(&self, block: bool, timeout: Option<Duration>) -> SubinterpResult<T> {
        if let Some(bytes) = self.fifo.lock().pop_front() {
            return Ok(bincode::deserialize(&bytes)?);
        }

        let deadline = deadline_for(block, timeout);
        loop {
            let remaining = remaining_until(deadline);
            if let Some(d) = remaining {
                if d.is_zero() && block {
                    return Err(SubinterpError::Empty);
                }
            }
            if !self.signal.select(remaining) {
                return Err(SubinterpError::Empty);
            }

            let host = &self.host;
            match self.board.fetch_item(|h| host.is_running(h))? {
                Some((index, bytes)) => {
                    let _ = self.signal.read(1, Some(Duration::ZERO));
                    self.len.fetch_sub(1, Ordering::AcqRel);
                    tracing::trace!(index, "queue: got");
                    self.fifo.lock().push_back(bytes);
                    let bytes = self.fifo.lock().pop_front().expect("just pushed");
                    return Ok(bincode::deserialize(&bytes)?);
                }
                None => {
                    if self.board.take_owner_gone() {
                        let _ = self.signal.read(1, Some(Duration::ZERO));
                        self.len.fetch_sub(1, Ordering::AcqRel);
                        tracing::debug!("queue: realigned signal count past a dead producer");
                        continue;
                    }
                    // Spurious wake (another consumer claimed the slot
                    // first): keep waiting out the remaining deadline.
                    continue;
                }
            }
        }
    }

    pub fn get_nowait<T: DeserializeOwned>(&self) -> SubinterpResult<T> {
        self.get(false, None)
    }

    pub fn close(self) -> SubinterpResult<()> {
        self.board.close()?;
        self.signal.close()?;
        Ok(())
    }
}

fn deadline_for(block: bool, timeout: Option<Duration>) -> Option<Instant> {
    if !block {
        Some(Instant::now())
    } else {
        timeout.map(|t| Instant::now() + t)
    }
}

fn deadline_or_now(deadline: Option<Instant>, block: bool) -> Instant {
    match deadline {
        Some(d) => d,
        None if block => Instant::now() + Duration::from_secs(3600 * 24 * 365),
        None => Instant::now(),
    }
}

fn remaining_until(deadline: Option<Instant>) -> Option<Duration> {
    let d = deadline?; // `None` means block forever
    let now = Instant::now();
    Some(if now >= d { Duration::ZERO } else { d - now })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::ThreadHost;

    fn new_host_queue(maxsize: usize) -> Queue<ThreadHost> {
        let host = Arc::new(ThreadHost::new());
        Queue::create(host, maxsize).unwrap()
    }

    #[test]
    fn put_then_get_round_trips_a_tuple() {
        let q = new_host_queue(0);
        q.put(&(1i32, 2i32), true, None).unwrap();
        let got: (i32, i32) = q.get(true, Some(Duration::from_millis(200))).unwrap();
        assert_eq!(got, (1, 2));
        q.close().unwrap();
    }

    #[test]
    fn get_nowait_on_empty_queue_fails_empty() {
        let q = new_host_queue(0);
        let got: SubinterpResult<i32> = q.get_nowait();
        assert!(matches!(got, Err(SubinterpError::Empty)));
        q.close().unwrap();
    }

    #[test]
    fn put_preserves_single_producer_order() {
        let q = new_host_queue(0);
        for i in 0..5 {
            q.put(&i, true, None).unwrap();
        }
        for i in 0..5 {
            let got: i32 = q.get(true, Some(Duration::from_millis(200))).unwrap();
            assert_eq!(got, i);
        }
        q.close().unwrap();
    }

    #[test]
    fn origin_can_consume_its_own_put() {
        let q = new_host_queue(0);
        q.put(&42i32, true, None).unwrap();
        let got: i32 = q.get(true, Some(Duration::from_millis(200))).unwrap();
        assert_eq!(got, 42);
        q.close().unwrap();
    }

    #[test]
    fn dead_producer_item_is_skipped_and_counted() {
        let host = Arc::new(ThreadHost::new());
        let dead_handle = host.create_interpreter().unwrap();
        let mut q = Queue::create(host.clone(), 0).unwrap();

        // forge a post as if the (about-to-die) child had produced it, by
        // attaching a second handle bound to the same board/pipe.
        let h = q.handle().unwrap();
        // SAFETY: `q` stays alive for the whole test.
        let q2 = unsafe { Queue::attach(host.clone(), h).unwrap() };
        // bypass `put`'s `current_interpreter()` owner tag so the posted
        // slot is attributed to `dead_handle` instead of the main thread.
        let payload = bincode::serialize(&7i32).unwrap();
        let idx = q2.board.new_item(&payload, dead_handle).unwrap();
        q2.signal.send(b"\x01", None).unwrap();
        let _ = idx;

        host.destroy_interpreter(dead_handle).unwrap();

        let got: SubinterpResult<i32> = q.get(false, None);
        assert!(matches!(got, Err(SubinterpError::Empty)));
        q.close().unwrap();
    }
}
