//! One-byte compare-and-swap spin lock over a raw address (spec §4.1).
//!
//! The byte may live inside any buffer shared across interpreters/threads —
//! `SharedBuffer`'s header, a `Slot`, or a standalone allocation backing a
//! `Lock`/`RLock`. The raw operations here never know or care which.

use std::cell::Cell;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::{Duration, Instant};

use crate::error::{CoreError, CoreResult};

/// ~CPython's default `sys.getswitchinterval()`; used only to size the
/// poll quantum and the default timeout, not for correctness.
pub const TIME_RESOLUTION: Duration = Duration::from_millis(5);
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(250);

/// Atomically attempt to claim the byte at `addr`, 0 -> 1.
///
/// # Safety
/// `addr` must point to a live, writable `u8` for the duration of the call,
/// and no other code may access that byte through anything but an atomic
/// operation for as long as contended access is possible.
pub unsafe fn try_acquire(addr: *mut u8) -> bool {
    // SAFETY: caller guarantees `addr` is live; AtomicU8 has the same
    // layout as u8, so this reference is valid for the atomic RMW below.
    let byte = unsafe { &*(addr as *const AtomicU8) };
    byte.compare_exchange(0, 1, Ordering::Acquire, Ordering::Relaxed)
        .is_ok()
}

/// Atomically release the byte at `addr` back to 0.
///
/// # Safety
/// Same contract as [`try_acquire`].
pub unsafe fn release(addr: *mut u8) {
    let byte = unsafe { &*(addr as *const AtomicU8) };
    byte.store(0, Ordering::Release);
}

/// How long a caller is willing to wait for [`ScopedLock::acquire`].
#[derive(Debug, Clone, Copy)]
pub enum LockTimeout {
    /// Wait forever.
    Forever,
    /// Fail immediately with [`CoreError::ResourceBusy`] on contention.
    Immediate,
    /// Wait up to the given duration, then fail with [`CoreError::Timeout`].
    After(Duration),
}

impl LockTimeout {
    /// Mirrors the Python surface's `(blocking, timeout)` pair: `timeout =
    /// -1` waits forever, `blocking = false` never waits.
    pub fn from_blocking_timeout(blocking: bool, timeout: f64) -> Self {
        if !blocking {
            LockTimeout::Immediate
        } else if timeout < 0.0 {
            LockTimeout::Forever
        } else {
            LockTimeout::After(Duration::from_secs_f64(timeout))
        }
    }
}

/// A re-entrant acquisition point over a single byte at a fixed address.
///
/// Re-entrance is tracked on this struct (a "view"), never in the shared
/// byte itself: nested `acquire` calls from the *same* `ScopedLock` value
/// just bump a counter and only the outermost acquire/release touches the
/// byte. A different `ScopedLock` instance pointed at the same address —
/// even in the same thread — is blocked out exactly like another
/// interpreter would be.
pub struct ScopedLock {
    addr: usize,
    entered: Cell<u32>,
}

// The address denotes memory shared across threads/interpreters by design.
unsafe impl Send for ScopedLock {}
unsafe impl Sync for ScopedLock {}

impl ScopedLock {
    /// # Safety
    /// `addr` must remain a live, writable byte for the lifetime of this
    /// `ScopedLock` and of every [`LockGuard`] it produces.
    pub unsafe fn new(addr: *mut u8) -> Self {
        ScopedLock {
            addr: addr as usize,
            entered: Cell::new(0),
        }
    }

    fn ptr(&self) -> *mut u8 {
        self.addr as *mut u8
    }

    pub fn is_locked(&self) -> bool {
        // SAFETY: see struct contract.
        let byte = unsafe { &*(self.ptr() as *const AtomicU8) };
        byte.load(Ordering::Acquire) != 0
    }

    /// Acquire the lock, blocking per `timeout`. Returns a guard that
    /// releases on drop.
    pub fn acquire(&self, timeout: LockTimeout) -> CoreResult<LockGuard<'_>> {
        if self.entered.get() > 0 {
            self.entered.set(self.entered.get() + 1);
            return Ok(LockGuard { lock: self });
        }

        // SAFETY: see struct contract.
        let acquired = unsafe { try_acquire(self.ptr()) };
        if acquired {
            self.entered.set(1);
            return Ok(LockGuard { lock: self });
        }

        match timeout {
            LockTimeout::Immediate => {
                tracing::trace!("byte lock contended, non-blocking caller backs off");
                Err(CoreError::ResourceBusy)
            }
            LockTimeout::Forever => {
                loop {
                    std::thread::sleep(TIME_RESOLUTION * 4);
                    // SAFETY: see struct contract.
                    if unsafe { try_acquire(self.ptr()) } {
                        self.entered.set(1);
                        return Ok(LockGuard { lock: self });
                    }
                }
            }
            LockTimeout::After(dur) => {
                let deadline = Instant::now() + dur;
                loop {
                    if Instant::now() >= deadline {
                        return Err(CoreError::Timeout(dur));
                    }
                    std::thread::sleep(TIME_RESOLUTION * 4);
                    // SAFETY: see struct contract.
                    if unsafe { try_acquire(self.ptr()) } {
                        self.entered.set(1);
                        return Ok(LockGuard { lock: self });
                    }
                }
            }
        }
    }

    fn release_one(&self) {
        let n = self.entered.get();
        debug_assert!(n > 0, "release without a matching acquire");
        if n <= 1 {
            self.entered.set(0);
            // SAFETY: see struct contract; we hold the outermost acquire.
            unsafe { release(self.ptr()) };
        } else {
            self.entered.set(n - 1);
        }
    }
}

/// RAII guard returned by [`ScopedLock::acquire`]; releases on drop.
#[must_use = "the lock releases when this guard is dropped"]
pub struct LockGuard<'a> {
    lock: &'a ScopedLock,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        self.lock.release_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn try_acquire_then_release() {
        let mut byte: u8 = 0;
        let addr = &mut byte as *mut u8;
        // SAFETY: `byte` is live for the whole test.
        unsafe {
            assert!(try_acquire(addr));
            assert!(!try_acquire(addr));
            release(addr);
            assert!(try_acquire(addr));
        }
    }

    #[test]
    fn scoped_lock_reenters_without_touching_byte_twice() {
        let mut byte: u8 = 0;
        // SAFETY: `byte` outlives `lock`.
        let lock = unsafe { ScopedLock::new(&mut byte as *mut u8) };
        let g1 = lock.acquire(LockTimeout::Immediate).unwrap();
        let g2 = lock.acquire(LockTimeout::Immediate).unwrap();
        assert!(lock.is_locked());
        drop(g2);
        assert!(lock.is_locked(), "still held by outer guard");
        drop(g1);
        assert!(!lock.is_locked());
    }

    #[test]
    fn contended_immediate_fails_busy() {
        let mut byte: u8 = 0;
        let addr = &mut byte as *mut u8;
        // SAFETY: `byte` is live for the whole test.
        unsafe { assert!(try_acquire(addr)) };
        // SAFETY: same byte, different "view".
        let other = unsafe { ScopedLock::new(addr) };
        assert!(matches!(
            other.acquire(LockTimeout::Immediate),
            Err(CoreError::ResourceBusy)
        ));
    }

    #[test]
    fn contended_timeout_fails_after_deadline() {
        let mut byte: u8 = 0;
        let addr = &mut byte as *mut u8;
        // SAFETY: `byte` is live for the whole test.
        unsafe { assert!(try_acquire(addr)) };
        let other = unsafe { ScopedLock::new(addr) };
        let started = Instant::now();
        let res = other.acquire(LockTimeout::After(Duration::from_millis(30)));
        assert!(matches!(res, Err(CoreError::Timeout(_))));
        assert!(started.elapsed() >= Duration::from_millis(30));
    }
}
