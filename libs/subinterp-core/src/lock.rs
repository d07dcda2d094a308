//! Cross-interpreter mutual exclusion built on a single-byte `SharedBuffer`
//! plus the atomic byte lock (spec §4.9).
//!
//! Three flavors, in order of how much reentrance they tolerate:
//! - [`IntRLock`] — reentrant for the same Rust value (`view`), regardless
//!   of which thread calls it; other views (even in the same process) are
//!   blocked out exactly like another interpreter would be.
//! - [`RLock`] — reentrant only within the *same OS thread*; a different
//!   thread sharing the same `RLock` value blocks, matching
//!   `threading.RLock`.
//! - [`Lock`] — never reentrant: a second acquire from the same thread
//!   blocks/times out identically to a contending thread.
//!
//! All three race for the same single shared byte through
//! [`byte_lock::try_acquire`]/[`release`](byte_lock::release); what differs
//! is purely the *local* bookkeeping that decides whether a given acquire
//! call needs to touch that byte at all.

use std::thread::ThreadId;
use std::time::Instant;

use parking_lot::Mutex;

use crate::byte_lock::{self, LockTimeout, TIME_RESOLUTION};
use crate::error::{CoreError, CoreResult};
use crate::shared_buffer::{SharedBuffer, SharedBufferHandle};

const LOCK_BYTE_TTL: std::time::Duration = std::time::Duration::from_secs(3600);

fn spin_for_byte(addr: *mut u8, timeout: LockTimeout) -> CoreResult<()> {
    match timeout {
        LockTimeout::Immediate => {
            // SAFETY: `addr` is a live byte for the caller's buffer lifetime.
            if unsafe { byte_lock::try_acquire(addr) } {
                Ok(())
            } else {
                Err(CoreError::ResourceBusy)
            }
        }
        LockTimeout::Forever => loop {
            // SAFETY: see above.
            if unsafe { byte_lock::try_acquire(addr) } {
                return Ok(());
            }
            std::thread::sleep(TIME_RESOLUTION * 4);
        },
        LockTimeout::After(dur) => {
            let deadline = Instant::now() + dur;
            loop {
                // SAFETY: see above.
                if unsafe { byte_lock::try_acquire(addr) } {
                    return Ok(());
                }
                if Instant::now() >= deadline {
                    return Err(CoreError::Timeout(dur));
                }
                std::thread::sleep(TIME_RESOLUTION * 4);
            }
        }
    }
}

// ---------------------------------------------------------------- IntRLock

/// Cross-interpreter re-entrant lock: nested `acquire` calls on the *same*
/// `IntRLock` value succeed immediately no matter which thread makes them.
pub struct IntRLock {
    buf: SharedBuffer,
    count: Mutex<u32>,
}

#[must_use = "the lock releases when this guard is dropped"]
pub struct IntRLockGuard<'a> {
    lock: &'a IntRLock,
}

impl Drop for IntRLockGuard<'_> {
    fn drop(&mut self) {
        self.lock.release();
    }
}

impl IntRLock {
    pub fn create() -> CoreResult<Self> {
        let mut buf = SharedBuffer::create(1, LOCK_BYTE_TTL);
        buf.start()?;
        Ok(IntRLock {
            buf,
            count: Mutex::new(0),
        })
    }

    pub fn handle(&mut self) -> CoreResult<SharedBufferHandle> {
        self.buf.serialize()
    }

    /// # Safety
    /// The origin's byte buffer must still be live.
    pub unsafe fn attach(handle: SharedBufferHandle) -> CoreResult<Self> {
        // SAFETY: forwarded from this function's contract.
        let mut buf = unsafe { SharedBuffer::attach(handle) };
        buf.start()?;
        Ok(IntRLock {
            buf,
            count: Mutex::new(0),
        })
    }

    fn addr(&self) -> *mut u8 {
        self.buf.payload_address() as *mut u8
    }

    pub fn acquire(&self, timeout: LockTimeout) -> CoreResult<IntRLockGuard<'_>> {
        {
            let mut count = self.count.lock();
            if *count > 0 {
                *count += 1;
                return Ok(IntRLockGuard { lock: self });
            }
        }
        // Spin without holding `count`: a blocking wait here must not starve
        // the thread that needs `release()`'s own `count.lock()` to unwind
        // the outermost acquire that owns the byte right now.
        spin_for_byte(self.addr(), timeout)?;
        *self.count.lock() = 1;
        Ok(IntRLockGuard { lock: self })
    }

    fn release(&self) {
        let mut count = self.count.lock();
        if *count == 0 {
            return; // silent no-op, per spec §4.9
        }
        *count -= 1;
        if *count == 0 {
            // SAFETY: this view held the byte (count was > 0).
            unsafe { byte_lock::release(self.addr()) };
        }
    }

    pub fn locked(&self) -> bool {
        *self.count.lock() > 0
    }

    pub fn close(self) -> CoreResult<()> {
        self.buf.close()
    }
}

// ------------------------------------------------------------------ RLock

struct RLockState {
    holder: Option<ThreadId>,
    count: u32,
}

/// Cross-interpreter lock, reentrant within the same OS thread: a second
/// acquire from a *different* thread — even of the same `RLock` value, even
/// in the same process — blocks exactly like a foreign interpreter would.
pub struct RLock {
    buf: SharedBuffer,
    state: Mutex<RLockState>,
}

#[must_use = "the lock releases when this guard is dropped"]
pub struct RLockGuard<'a> {
    lock: &'a RLock,
}

impl Drop for RLockGuard<'_> {
    fn drop(&mut self) {
        self.lock.release();
    }
}

impl RLock {
    pub fn create() -> CoreResult<Self> {
        let mut buf = SharedBuffer::create(1, LOCK_BYTE_TTL);
        buf.start()?;
        Ok(RLock {
            buf,
            state: Mutex::new(RLockState {
                holder: None,
                count: 0,
            }),
        })
    }

    pub fn handle(&mut self) -> CoreResult<SharedBufferHandle> {
        self.buf.serialize()
    }

    /// # Safety
    /// The origin's byte buffer must still be live.
    pub unsafe fn attach(handle: SharedBufferHandle) -> CoreResult<Self> {
        // SAFETY: forwarded from this function's contract.
        let mut buf = unsafe { SharedBuffer::attach(handle) };
        buf.start()?;
        Ok(RLock {
            buf,
            state: Mutex::new(RLockState {
                holder: None,
                count: 0,
            }),
        })
    }

    fn addr(&self) -> *mut u8 {
        self.buf.payload_address() as *mut u8
    }

    /// Holding `state`'s `MutexGuard` for the whole blocking wait is
    /// deliberate: it is exactly what makes a second thread's `acquire`
    /// block on this thread's, matching the "other threads block even
    /// within the same interpreter" contract.
    pub fn acquire(&self, timeout: LockTimeout) -> CoreResult<RLockGuard<'_>> {
        let tid = std::thread::current().id();
        {
            let mut state = self.state.lock();
            if state.holder == Some(tid) {
                state.count += 1;
                return Ok(RLockGuard { lock: self });
            }
        }
        // Spin without holding `state`: otherwise a blocking waiter here
        // would hold `state`'s mutex for the whole wait and deadlock against
        // the current holder's own `release()`, which needs that same mutex.
        spin_for_byte(self.addr(), timeout)?;
        let mut state = self.state.lock();
        state.holder = Some(tid);
        state.count = 1;
        Ok(RLockGuard { lock: self })
    }

    fn release(&self) {
        let tid = std::thread::current().id();
        let mut state = self.state.lock();
        if state.holder != Some(tid) {
            return; // silent no-op: not held by this thread
        }
        state.count -= 1;
        if state.count == 0 {
            state.holder = None;
            // SAFETY: this thread held the byte (count was > 0).
            unsafe { byte_lock::release(self.addr()) };
        }
    }

    pub fn locked(&self) -> bool {
        self.state.lock().holder.is_some()
    }

    pub fn close(self) -> CoreResult<()> {
        self.buf.close()
    }
}

// ------------------------------------------------------------------- Lock

/// Cross-interpreter, never-reentrant lock: a second `acquire` from the
/// thread that already holds it blocks/fails identically to a contending
/// thread.
pub struct Lock {
    buf: SharedBuffer,
    held: Mutex<bool>,
}

#[must_use = "the lock releases when this guard is dropped"]
pub struct PlainLockGuard<'a> {
    lock: &'a Lock,
}

impl Drop for PlainLockGuard<'_> {
    fn drop(&mut self) {
        self.lock.release();
    }
}

impl Lock {
    pub fn create() -> CoreResult<Self> {
        let mut buf = SharedBuffer::create(1, LOCK_BYTE_TTL);
        buf.start()?;
        Ok(Lock {
            buf,
            held: Mutex::new(false),
        })
    }

    pub fn handle(&mut self) -> CoreResult<SharedBufferHandle> {
        self.buf.serialize()
    }

    /// # Safety
    /// The origin's byte buffer must still be live.
    pub unsafe fn attach(handle: SharedBufferHandle) -> CoreResult<Self> {
        // SAFETY: forwarded from this function's contract.
        let mut buf = unsafe { SharedBuffer::attach(handle) };
        buf.start()?;
        Ok(Lock {
            buf,
            held: Mutex::new(false),
        })
    }

    fn addr(&self) -> *mut u8 {
        self.buf.payload_address() as *mut u8
    }

    pub fn acquire(&self, timeout: LockTimeout) -> CoreResult<PlainLockGuard<'_>> {
        // No local mutex held during the (possibly unbounded) spin: the byte
        // itself already serializes acquirers, including a same-thread
        // second call, which is exactly what makes this lock non-reentrant.
        // Holding `held` here too would block `release()` for the duration.
        spin_for_byte(self.addr(), timeout)?;
        *self.held.lock() = true;
        Ok(PlainLockGuard { lock: self })
    }

    fn release(&self) {
        let mut held = self.held.lock();
        if !*held {
            return; // silent no-op, per spec §4.9
        }
        *held = false;
        // SAFETY: `held` was true, so this side holds the byte.
        unsafe { byte_lock::release(self.addr()) };
    }

    pub fn locked(&self) -> bool {
        *self.held.lock()
    }

    pub fn close(self) -> CoreResult<()> {
        self.buf.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn int_rlock_reenters_same_view_from_any_thread() {
        let lock = IntRLock::create().unwrap();
        let g1 = lock.acquire(LockTimeout::Immediate).unwrap();
        let g2 = lock.acquire(LockTimeout::Immediate).unwrap();
        assert!(lock.locked());
        drop(g2);
        assert!(lock.locked());
        drop(g1);
        assert!(!lock.locked());
    }

    #[test]
    fn rlock_blocks_a_different_thread() {
        let lock = std::sync::Arc::new(RLock::create().unwrap());
        let _g = lock.acquire(LockTimeout::Immediate).unwrap();
        let other = lock.clone();
        let handle = std::thread::spawn(move || {
            other.acquire(LockTimeout::Immediate).is_err()
        });
        assert!(handle.join().unwrap());
    }

    #[test]
    fn rlock_reenters_same_thread() {
        let lock = RLock::create().unwrap();
        let g1 = lock.acquire(LockTimeout::Immediate).unwrap();
        let g2 = lock.acquire(LockTimeout::Immediate).unwrap();
        drop(g2);
        drop(g1);
        assert!(!lock.locked());
    }

    #[test]
    fn lock_is_never_reentrant() {
        let lock = Lock::create().unwrap();
        let _g1 = lock.acquire(LockTimeout::Immediate).unwrap();
        assert!(matches!(
            lock.acquire(LockTimeout::Immediate),
            Err(CoreError::ResourceBusy)
        ));
    }

    #[test]
    fn lock_release_on_unheld_lock_is_a_no_op() {
        let lock = Lock::create().unwrap();
        lock.release();
        assert!(!lock.locked());
    }

    #[test]
    fn forever_timeout_waiter_does_not_starve_the_holders_release() {
        // Regression test: `acquire` must not hold its local bookkeeping
        // mutex across the spin, or this waiter would deadlock the holder's
        // `release()` (same mutex), and this test would hang forever.
        let lock = std::sync::Arc::new(Lock::create().unwrap());
        let g = lock.acquire(LockTimeout::Immediate).unwrap();
        let other = lock.clone();
        let waiter = std::thread::spawn(move || {
            other.acquire(LockTimeout::Forever).unwrap();
        });
        std::thread::sleep(Duration::from_millis(20));
        drop(g);
        waiter.join().unwrap();
    }

    #[test]
    fn cross_attach_exclusion() {
        let mut origin = Lock::create().unwrap();
        let handle = origin.handle().unwrap();
        // SAFETY: `origin` outlives `remote` in this test.
        let remote = unsafe { Lock::attach(handle).unwrap() };
        let _g = origin.acquire(LockTimeout::Immediate).unwrap();
        assert!(matches!(
            remote.acquire(LockTimeout::Immediate),
            Err(CoreError::ResourceBusy)
        ));
        drop(_g);
        assert!(remote.acquire(LockTimeout::Immediate).is_ok());
    }
}
