//! Per-interpreter unified readiness multiplexer with callback fan-out
//! (spec §4.4).
//!
//! "Per interpreter" here means per OS thread (see `subinterp::host` for
//! why an OS thread stands in for a subinterpreter in this workspace): the
//! selector is a thread-local singleton, lazily built on first use, exactly
//! like the teacher's mmap/pipe primitives are each built once per owning
//! side rather than shared through a lock. [`Pipe`](crate::pipe) and
//! [`LockableBoard`](crate::board)'s signal path both register callbacks
//! here rather than polling file descriptors directly.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::time::{Duration, Instant};

use nix::poll::{poll, PollFd, PollFlags};

/// Which direction(s) of readiness a registration cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Readable,
    Writable,
}

impl Interest {
    fn poll_flags(self) -> PollFlags {
        match self {
            Interest::Readable => PollFlags::POLLIN,
            Interest::Writable => PollFlags::POLLOUT,
        }
    }
}

/// What fired, handed to a callback on dispatch.
#[derive(Debug, Clone, Copy)]
pub struct ReadyEvent {
    pub fd: RawFd,
    pub readable: bool,
    pub writable: bool,
}

type Callback = Box<dyn FnMut(ReadyEvent)>;

struct Registration {
    id: u64,
    interest: Interest,
    callback: Rc<RefCell<Callback>>,
}

/// A per-thread readiness multiplexer. Multiple callbacks may attach to the
/// same `(fd, interest)` pair; on readiness they fire in registration order,
/// and a panicking/erroring callback is caught and logged so it cannot
/// starve the others (spec §4.4's "wrapping exceptions into warnings").
#[derive(Default)]
pub struct Selector {
    registrations: RefCell<HashMap<RawFd, Vec<Registration>>>,
    next_id: RefCell<u64>,
    depth: RefCell<u32>,
    entered: RefCell<HashSet<u64>>,
}

thread_local! {
    static CURRENT: Selector = Selector::default();
}

/// Runs `f` against this thread's selector singleton.
pub fn with_current<R>(f: impl FnOnce(&Selector) -> R) -> R {
    CURRENT.with(f)
}

impl Selector {
    /// Registers `callback` for `interest` on `fd`. Returns an id that can
    /// later be used to drop just this one callback; [`unregister`] drops
    /// every callback on the fd at once, matching the Python original's
    /// "close this pipe end" use.
    pub fn register(
        &self,
        fd: RawFd,
        interest: Interest,
        callback: impl FnMut(ReadyEvent) + 'static,
    ) -> u64 {
        let id = {
            let mut next = self.next_id.borrow_mut();
            let id = *next;
            *next += 1;
            id
        };
        self.registrations
            .borrow_mut()
            .entry(fd)
            .or_default()
            .push(Registration {
                id,
                interest,
                callback: Rc::new(RefCell::new(Box::new(callback))),
            });
        id
    }

    /// Drops every registration on `fd`.
    pub fn unregister(&self, fd: RawFd) {
        self.registrations.borrow_mut().remove(&fd);
    }

    /// Drops only the registration `id` previously returned by [`register`],
    /// leaving any other callbacks on the same fd untouched.
    pub fn unregister_id(&self, fd: RawFd, id: u64) {
        let mut regs = self.registrations.borrow_mut();
        if let Some(v) = regs.get_mut(&fd) {
            v.retain(|r| r.id != id);
            if v.is_empty() {
                regs.remove(&fd);
            }
        }
    }

    /// Waits up to `timeout` for readiness on any registered fd (or, if
    /// `target_fd` is given, specifically for that one), dispatching
    /// callbacks as events fire. Returns whether the event of interest
    /// fired before the deadline.
    ///
    /// Re-entrant: a callback that itself calls `select()` will not have
    /// its own still-on-the-stack callback re-invoked by the nested call,
    /// exactly mirroring the Python original's `entered_callbacks` guard —
    /// only the outermost call resets that set.
    pub fn select(&self, timeout: Option<Duration>, target_fd: Option<RawFd>) -> bool {
        {
            let mut depth = self.depth.borrow_mut();
            *depth += 1;
            if *depth == 1 {
                self.entered.borrow_mut().clear();
            }
        }
        let result = self.select_inner(timeout, target_fd);
        *self.depth.borrow_mut() -= 1;
        result
    }

    fn select_inner(&self, timeout: Option<Duration>, target_fd: Option<RawFd>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let fds: Vec<RawFd> = self.registrations.borrow().keys().copied().collect();
            if fds.is_empty() {
                return false;
            }

            let remaining = match deadline {
                Some(d) => match d.checked_duration_since(Instant::now()) {
                    Some(r) => Some(r),
                    None => return false,
                },
                None => None,
            };
            // nix 0.26's `poll` timeout is plain milliseconds, -1 = block forever.
            let timeout_ms: i32 = match remaining {
                Some(d) => d.as_millis().min(i32::MAX as u128) as i32,
                None => -1,
            };

            let mut poll_fds: Vec<PollFd> = Vec::with_capacity(fds.len());
            {
                let regs = self.registrations.borrow();
                for &fd in &fds {
                    let mut mask = PollFlags::empty();
                    for reg in &regs[&fd] {
                        mask |= reg.interest.poll_flags();
                    }
                    poll_fds.push(PollFd::new(fd, mask));
                }
            }

            let n = match poll(&mut poll_fds, timeout_ms) {
                Ok(n) => n,
                Err(_) => return false,
            };
            if n == 0 {
                return false;
            }

            let mut target_fired = false;
            let mut any_fired = false;
            for (idx, pfd) in poll_fds.iter().enumerate() {
                let revents = match pfd.revents() {
                    Some(r) => r,
                    None => continue,
                };
                if revents.is_empty() {
                    continue;
                }
                let fd = fds[idx];
                let event = ReadyEvent {
                    fd,
                    readable: revents.contains(PollFlags::POLLIN),
                    writable: revents.contains(PollFlags::POLLOUT),
                };
                any_fired = true;
                if Some(fd) == target_fd {
                    target_fired = true;
                }
                self.dispatch(fd, event);
            }

            if target_fd.is_some() {
                if target_fired {
                    return true;
                }
                // keep waiting for the specific fd until the deadline.
                if deadline.is_none() && !any_fired {
                    return false;
                }
                continue;
            }
            return any_fired;
        }
    }

    fn dispatch(&self, fd: RawFd, event: ReadyEvent) {
        // Snapshot (id, callback) pairs before invoking anything: a callback
        // may register/unregister fds (including this one), so the map must
        // not be borrowed while callbacks run.
        let callbacks: Vec<(u64, Rc<RefCell<Callback>>)> = self
            .registrations
            .borrow()
            .get(&fd)
            .map(|regs| regs.iter().map(|r| (r.id, r.callback.clone())).collect())
            .unwrap_or_default();
        for (id, callback) in callbacks {
            if self.entered.borrow().contains(&id) {
                continue;
            }
            self.entered.borrow_mut().insert(id);
            match callback.try_borrow_mut() {
                Ok(mut guard) => {
                    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| guard(event)));
                    if let Err(payload) = outcome {
                        tracing::warn!(
                            fd,
                            id,
                            error = %panic_payload_message(payload),
                            "selector callback panicked, skipping"
                        );
                    }
                }
                Err(_) => {
                    tracing::warn!(fd, id, "selector callback re-entered itself, skipping");
                }
            }
            self.entered.borrow_mut().remove(&id);
        }
    }
}

/// Turns a caught callback panic payload into a loggable message, so one
/// misbehaving callback is warned about rather than propagated to every
/// caller of `select()` on this fd's remaining callbacks.
fn panic_payload_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "callback panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn fires_on_readable_pipe() {
        let (rfd, wfd) = nix::unistd::pipe().unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        with_current(|sel| {
            sel.register(rfd, Interest::Readable, move |_| {
                fired2.fetch_add(1, Ordering::SeqCst);
            });
        });
        nix::unistd::write(wfd, b"x").unwrap();
        let hit = with_current(|sel| sel.select(Some(Duration::from_millis(200)), Some(rfd)));
        assert!(hit);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        with_current(|sel| sel.unregister(rfd));
        let _ = nix::unistd::close(wfd);
        let _ = nix::unistd::close(rfd);
    }

    #[test]
    fn multiple_callbacks_on_same_fd_all_fire() {
        let (rfd, wfd) = nix::unistd::pipe().unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let count = count.clone();
            with_current(|sel| {
                sel.register(rfd, Interest::Readable, move |_| {
                    count.fetch_add(1, Ordering::SeqCst);
                });
            });
        }
        nix::unistd::write(wfd, b"y").unwrap();
        with_current(|sel| sel.select(Some(Duration::from_millis(200)), None));
        assert_eq!(count.load(Ordering::SeqCst), 3);
        with_current(|sel| sel.unregister(rfd));
        let _ = nix::unistd::close(wfd);
        let _ = nix::unistd::close(rfd);
    }

    #[test]
    fn a_panicking_callback_does_not_starve_the_others_on_the_same_fd() {
        let (rfd, wfd) = nix::unistd::pipe().unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        with_current(|sel| {
            sel.register(rfd, Interest::Readable, |_| panic!("boom"));
        });
        for _ in 0..2 {
            let count = count.clone();
            with_current(|sel| {
                sel.register(rfd, Interest::Readable, move |_| {
                    count.fetch_add(1, Ordering::SeqCst);
                });
            });
        }
        nix::unistd::write(wfd, b"z").unwrap();
        with_current(|sel| sel.select(Some(Duration::from_millis(200)), None));
        assert_eq!(count.load(Ordering::SeqCst), 2);
        with_current(|sel| sel.unregister(rfd));
        let _ = nix::unistd::close(wfd);
        let _ = nix::unistd::close(rfd);
    }

    #[test]
    fn timeout_with_no_ready_fd_returns_false() {
        let (rfd, wfd) = nix::unistd::pipe().unwrap();
        with_current(|sel| sel.register(rfd, Interest::Readable, |_| {}));
        let hit = with_current(|sel| sel.select(Some(Duration::from_millis(30)), None));
        assert!(!hit);
        with_current(|sel| sel.unregister(rfd));
        let _ = nix::unistd::close(wfd);
        let _ = nix::unistd::close(rfd);
    }
}
