//! File-descriptor-pair primitives with cross-interpreter reference
//! counting (spec §4.5).
//!
//! Two flavors: [`SimplexPipe`] (one OS pipe, a reader in one interpreter
//! and a writer in another) and [`DuplexPipe`] (two OS pipes crossed so
//! either side can write). Both are reference counted through a small
//! [`SharedBuffer`] payload — the same counting primitive `LockableBoard`
//! and `Queue` build on — and both dedup repeated attaches inside one
//! interpreter through a thread-local registry, exactly mirroring the
//! Python original's `PIPE_REGISTRY` weak map (see spec §4.4/§4.5).

use std::cell::RefCell;
use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::rc::{Rc, Weak};
use std::time::Duration;

use nix::fcntl::{fcntl, FcntlArg, OFlag};

use crate::error::{CoreError, CoreResult};
use crate::selector::{self, Interest};
use crate::shared_buffer::{SharedBuffer, SharedBufferHandle, DEFAULT_TTL};

fn set_nonblocking(fd: RawFd) -> CoreResult<()> {
    let flags = fcntl(fd, FcntlArg::F_GETFL).map_err(CoreError::Errno)?;
    let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
    fcntl(fd, FcntlArg::F_SETFL(flags)).map_err(CoreError::Errno)?;
    Ok(())
}

/// Atomically bumps the u16 payload of a ref-count buffer by `delta`
/// (negative to decrement), returning the new value. Reentrant through
/// `SharedBuffer`'s own header lock: `acquire` plus the `get`/`set` it calls
/// internally nest onto the same `ScopedLock` view without deadlocking.
fn bump_refcount(buf: &SharedBuffer, delta: i32) -> CoreResult<u16> {
    let _guard = buf.acquire(crate::byte_lock::LockTimeout::After(
        crate::byte_lock::DEFAULT_TIMEOUT,
    ))?;
    let bytes = buf.get(0, 2)?;
    let cur = u16::from_le_bytes([bytes[0], bytes[1]]);
    let next = (cur as i32 + delta).max(0) as u16;
    buf.set(0, &next.to_le_bytes())?;
    Ok(next)
}

fn new_refcount_buffer(initial: u16) -> CoreResult<SharedBuffer> {
    let mut buf = SharedBuffer::from_payload(&initial.to_le_bytes(), DEFAULT_TTL);
    buf.start()?;
    Ok(buf)
}

// ---------------------------------------------------------------- Simplex

/// Wire form of a [`SimplexPipe`]: everything a different interpreter needs
/// to attach to the same fds and share the same reference count.
#[derive(Debug, Clone, Copy)]
pub struct SimplexPipeHandle {
    pub read_fd: RawFd,
    pub write_fd: RawFd,
    pub counter: SharedBufferHandle,
}

struct SimplexInner {
    read_fd: RawFd,
    write_fd: RawFd,
    refcount: RefCell<SharedBuffer>,
}

thread_local! {
    static SIMPLEX_REGISTRY: RefCell<HashMap<(RawFd, RawFd), Weak<SimplexInner>>> =
        RefCell::new(HashMap::new());
}

/// A one-directional pipe: one end reads, the other writes. Construction on
/// the origin allocates the OS pipe and a small ref-counted header; every
/// subsequent `attach` inside the *same* interpreter returns the identical
/// object (pointer-equal, via the thread-local registry), and `attach`es
/// from other interpreters each bump the shared counter.
#[derive(Clone)]
pub struct SimplexPipe(Rc<SimplexInner>);

impl SimplexPipe {
    /// Allocates a fresh OS pipe and its ref-count buffer. Starts the count
    /// at 1 (this instance).
    pub fn create() -> CoreResult<Self> {
        let (read_fd, write_fd) = nix::unistd::pipe().map_err(CoreError::Errno)?;
        set_nonblocking(read_fd)?;
        set_nonblocking(write_fd)?;
        let inner = Rc::new(SimplexInner {
            read_fd,
            write_fd,
            refcount: RefCell::new(new_refcount_buffer(1)?),
        });
        SIMPLEX_REGISTRY.with(|r| {
            r.borrow_mut()
                .insert((read_fd, write_fd), Rc::downgrade(&inner))
        });
        Ok(SimplexPipe(inner))
    }

    /// Serializes this pipe for another interpreter to [`attach`](Self::attach).
    pub fn handle(&self) -> CoreResult<SimplexPipeHandle> {
        let counter = self.0.refcount.borrow_mut().serialize()?;
        Ok(SimplexPipeHandle {
            read_fd: self.0.read_fd,
            write_fd: self.0.write_fd,
            counter,
        })
    }

    /// Attaches to a pipe described by `handle`. If this interpreter
    /// already has a live `SimplexPipe` for the same `(read_fd, write_fd)`
    /// pair, returns a clone of that same object instead of building a new
    /// one (identity-preserving unpickle, spec §4.5).
    ///
    /// # Safety
    /// The origin's ref-count `SharedBuffer` must still be live, per
    /// [`SharedBuffer::attach`]'s contract.
    pub unsafe fn attach(handle: SimplexPipeHandle) -> CoreResult<Self> {
        let key = (handle.read_fd, handle.write_fd);
        if let Some(existing) = SIMPLEX_REGISTRY.with(|r| r.borrow().get(&key).and_then(Weak::upgrade)) {
            return Ok(SimplexPipe(existing));
        }
        // SAFETY: forwarded from this function's contract.
        let mut counter = unsafe { SharedBuffer::attach(handle.counter) };
        counter.start()?;
        bump_refcount(&counter, 1)?;
        let inner = Rc::new(SimplexInner {
            read_fd: handle.read_fd,
            write_fd: handle.write_fd,
            refcount: RefCell::new(counter),
        });
        SIMPLEX_REGISTRY.with(|r| r.borrow_mut().insert(key, Rc::downgrade(&inner)));
        Ok(SimplexPipe(inner))
    }

    pub fn read_fd(&self) -> RawFd {
        self.0.read_fd
    }

    pub fn write_fd(&self) -> RawFd {
        self.0.write_fd
    }

    /// Waits up to `timeout` for the read end to become readable.
    pub fn select(&self, timeout: Option<Duration>) -> bool {
        wait_ready(self.0.read_fd, Interest::Readable, timeout)
    }

    /// Waits up to `timeout` for the write end to accept data.
    pub fn select_for_write(&self, timeout: Option<Duration>) -> bool {
        wait_ready(self.0.write_fd, Interest::Writable, timeout)
    }

    /// Non-blocking read of at most `amount` bytes; `b""` if nothing is
    /// available within `timeout`.
    pub fn read(&self, amount: usize, timeout: Option<Duration>) -> CoreResult<Vec<u8>> {
        read_fd_nonblocking(self.0.read_fd, amount, timeout, || self.select(timeout))
    }

    /// Writes `data` once the pipe is write-ready within `timeout`.
    pub fn send(&self, data: &[u8], timeout: Option<Duration>) -> CoreResult<()> {
        send_fd(self.0.write_fd, data, || self.select_for_write(timeout))
    }

    /// Decrements the shared ref-count; once it reaches zero, unregisters
    /// from the selector and closes the underlying fds.
    pub fn close(self) -> CoreResult<()> {
        let key = (self.0.read_fd, self.0.write_fd);
        let remaining = bump_refcount(&self.0.refcount.borrow(), -1)?;
        if remaining == 0 {
            selector::with_current(|s| s.unregister(self.0.read_fd));
            let _ = nix::unistd::close(self.0.read_fd);
            let _ = nix::unistd::close(self.0.write_fd);
            SIMPLEX_REGISTRY.with(|r| {
                r.borrow_mut().remove(&key);
            });
        }
        Ok(())
    }
}

// ----------------------------------------------------------------- Duplex

/// Wire form of a [`DuplexPipe`].
#[derive(Debug, Clone, Copy)]
pub struct DuplexPipeHandle {
    pub read_fd: RawFd,
    pub write_fd: RawFd,
    pub counterpart_read_fd: RawFd,
    pub counterpart_write_fd: RawFd,
    pub counter: SharedBufferHandle,
}

struct DuplexInner {
    read_fd: RawFd,
    write_fd: RawFd,
    counterpart_read_fd: RawFd,
    counterpart_write_fd: RawFd,
    refcount: RefCell<SharedBuffer>,
}

thread_local! {
    static DUPLEX_REGISTRY: RefCell<HashMap<(RawFd, RawFd), Weak<DuplexInner>>> =
        RefCell::new(HashMap::new());
}

/// A two-directional pipe built from two crossed OS pipes: `read_fd` here
/// is `write_fd` on the counterpart side and vice-versa. Unpickling a
/// `DuplexPipe` in the interpreter that is *not* its binding interpreter
/// automatically promotes it to the counterpart view, so pickling "my end"
/// in the parent yields the other end on unpickle in the child — this is
/// implemented explicitly here as [`DuplexPipe::counterpart`] rather than as
/// an automatic effect of deserialization, since this workspace has no
/// implicit unpickle hook (spec §9's "self-dispatching deserialization"
/// redesign: the caller picks the operation explicitly instead).
#[derive(Clone)]
pub struct DuplexPipe(Rc<DuplexInner>);

impl DuplexPipe {
    /// Allocates two crossed OS pipes. This side's `write_fd` is pipe A's
    /// write end and its `read_fd` is pipe B's read end; [`counterpart`]
    /// swaps that.
    pub fn create() -> CoreResult<Self> {
        let (a_read, a_write) = nix::unistd::pipe().map_err(CoreError::Errno)?;
        let (b_read, b_write) = nix::unistd::pipe().map_err(CoreError::Errno)?;
        for fd in [a_read, a_write, b_read, b_write] {
            set_nonblocking(fd)?;
        }
        let inner = Rc::new(DuplexInner {
            read_fd: b_read,
            write_fd: a_write,
            counterpart_read_fd: a_read,
            counterpart_write_fd: b_write,
            refcount: RefCell::new(new_refcount_buffer(1)?),
        });
        DUPLEX_REGISTRY.with(|r| {
            r.borrow_mut()
                .insert((inner.read_fd, inner.write_fd), Rc::downgrade(&inner))
        });
        Ok(DuplexPipe(inner))
    }

    pub fn handle(&self) -> CoreResult<DuplexPipeHandle> {
        let counter = self.0.refcount.borrow_mut().serialize()?;
        Ok(DuplexPipeHandle {
            read_fd: self.0.read_fd,
            write_fd: self.0.write_fd,
            counterpart_read_fd: self.0.counterpart_read_fd,
            counterpart_write_fd: self.0.counterpart_write_fd,
            counter,
        })
    }

    /// # Safety
    /// Same contract as [`SimplexPipe::attach`].
    pub unsafe fn attach(handle: DuplexPipeHandle) -> CoreResult<Self> {
        let key = (handle.read_fd, handle.write_fd);
        if let Some(existing) = DUPLEX_REGISTRY.with(|r| r.borrow().get(&key).and_then(Weak::upgrade)) {
            return Ok(DuplexPipe(existing));
        }
        // SAFETY: forwarded from this function's contract.
        let mut counter = unsafe { SharedBuffer::attach(handle.counter) };
        counter.start()?;
        bump_refcount(&counter, 1)?;
        let inner = Rc::new(DuplexInner {
            read_fd: handle.read_fd,
            write_fd: handle.write_fd,
            counterpart_read_fd: handle.counterpart_read_fd,
            counterpart_write_fd: handle.counterpart_write_fd,
            refcount: RefCell::new(counter),
        });
        DUPLEX_REGISTRY.with(|r| r.borrow_mut().insert(key, Rc::downgrade(&inner)));
        Ok(DuplexPipe(inner))
    }

    /// Returns the other end of this duplex pipe — pickling "my end" in the
    /// parent and unpickling the counterpart in the child is how
    /// `InterpreterWorker` hands the child its half (spec §4.5's duplex
    /// end-swap rule).
    pub fn counterpart(&self) -> CoreResult<Self> {
        let key = (self.0.counterpart_read_fd, self.0.counterpart_write_fd);
        if let Some(existing) = DUPLEX_REGISTRY.with(|r| r.borrow().get(&key).and_then(Weak::upgrade)) {
            return Ok(DuplexPipe(existing));
        }
        bump_refcount(&self.0.refcount.borrow(), 1)?;
        let counter = self.0.refcount.borrow_mut().serialize()?;
        // SAFETY: `self` keeps the origin `SharedBuffer` alive for at least
        // as long as this freshly attached view.
        let counter_view = unsafe { SharedBuffer::attach(counter) };
        let inner = Rc::new(DuplexInner {
            read_fd: self.0.counterpart_read_fd,
            write_fd: self.0.counterpart_write_fd,
            counterpart_read_fd: self.0.read_fd,
            counterpart_write_fd: self.0.write_fd,
            refcount: RefCell::new(counter_view),
        });
        DUPLEX_REGISTRY.with(|r| r.borrow_mut().insert(key, Rc::downgrade(&inner)));
        Ok(DuplexPipe(inner))
    }

    pub fn read_fd(&self) -> RawFd {
        self.0.read_fd
    }

    pub fn write_fd(&self) -> RawFd {
        self.0.write_fd
    }

    pub fn select(&self, timeout: Option<Duration>) -> bool {
        wait_ready(self.0.read_fd, Interest::Readable, timeout)
    }

    pub fn select_for_write(&self, timeout: Option<Duration>) -> bool {
        wait_ready(self.0.write_fd, Interest::Writable, timeout)
    }

    pub fn read(&self, amount: usize, timeout: Option<Duration>) -> CoreResult<Vec<u8>> {
        read_fd_nonblocking(self.0.read_fd, amount, timeout, || self.select(timeout))
    }

    pub fn send(&self, data: &[u8], timeout: Option<Duration>) -> CoreResult<()> {
        send_fd(self.0.write_fd, data, || self.select_for_write(timeout))
    }

    pub fn close(self) -> CoreResult<()> {
        let key = (self.0.read_fd, self.0.write_fd);
        let remaining = bump_refcount(&self.0.refcount.borrow(), -1)?;
        if remaining == 0 {
            selector::with_current(|s| s.unregister(self.0.read_fd));
            let _ = nix::unistd::close(self.0.read_fd);
            let _ = nix::unistd::close(self.0.write_fd);
            DUPLEX_REGISTRY.with(|r| {
                r.borrow_mut().remove(&key);
            });
        }
        Ok(())
    }
}

// --------------------------------------------------------- shared helpers

fn wait_ready(fd: RawFd, interest: Interest, timeout: Option<Duration>) -> bool {
    use std::cell::Cell;
    let hit = Rc::new(Cell::new(false));
    let hit2 = hit.clone();
    let id = selector::with_current(|s| s.register(fd, interest, move |_| hit2.set(true)));
    let fired = selector::with_current(|s| s.select(timeout, Some(fd)));
    selector::with_current(|s| s.unregister_id(fd, id));
    fired || hit.get()
}

fn read_fd_nonblocking(
    fd: RawFd,
    amount: usize,
    _timeout: Option<Duration>,
    wait: impl FnOnce() -> bool,
) -> CoreResult<Vec<u8>> {
    if !wait() {
        return Ok(Vec::new());
    }
    let mut buf = vec![0u8; amount];
    match nix::unistd::read(fd, &mut buf) {
        Ok(len) => {
            buf.truncate(len);
            Ok(buf)
        }
        Err(nix::Error::EAGAIN) => Ok(Vec::new()),
        Err(e) => Err(CoreError::Errno(e)),
    }
}

fn send_fd(fd: RawFd, data: &[u8], wait: impl FnOnce() -> bool) -> CoreResult<()> {
    if !wait() {
        return Err(CoreError::Timeout(Duration::ZERO));
    }
    match nix::unistd::write(fd, data) {
        Ok(_) => Ok(()),
        Err(nix::Error::EPIPE) => Err(CoreError::BrokenChannel),
        Err(e) => Err(CoreError::Errno(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simplex_round_trips_bytes() {
        let pipe = SimplexPipe::create().unwrap();
        pipe.send(b"hello", Some(Duration::from_millis(200))).unwrap();
        let got = pipe.read(16, Some(Duration::from_millis(200))).unwrap();
        assert_eq!(got, b"hello");
        pipe.close().unwrap();
    }

    #[test]
    fn simplex_read_with_no_data_returns_empty() {
        let pipe = SimplexPipe::create().unwrap();
        let got = pipe.read(16, Some(Duration::from_millis(20))).unwrap();
        assert_eq!(got, b"");
        pipe.close().unwrap();
    }

    #[test]
    fn simplex_attach_dedups_within_one_interpreter() {
        let pipe = SimplexPipe::create().unwrap();
        let handle = pipe.handle().unwrap();
        // SAFETY: `pipe` is still alive, keeping the origin buffer live.
        let reattached = unsafe { SimplexPipe::attach(handle).unwrap() };
        assert_eq!(pipe.read_fd(), reattached.read_fd());
        assert!(Rc::ptr_eq(&pipe.0, &reattached.0));
        pipe.close().unwrap();
    }

    #[test]
    fn duplex_counterpart_is_crossed_and_writable_both_ways() {
        let a = DuplexPipe::create().unwrap();
        let b = a.counterpart().unwrap();
        a.send(b"to-b", Some(Duration::from_millis(200))).unwrap();
        assert_eq!(b.read(16, Some(Duration::from_millis(200))).unwrap(), b"to-b");
        b.send(b"to-a", Some(Duration::from_millis(200))).unwrap();
        assert_eq!(a.read(16, Some(Duration::from_millis(200))).unwrap(), b"to-a");
        a.close().unwrap();
        b.close().unwrap();
    }
}
