//! `InterpreterWorker`: wraps a subordinate interpreter, dispatching a
//! callable + arguments through a `SharedBuffer` and retrieving the result
//! (spec §4.7).
//!
//! **Module-name quirk, translated.** The Python original ships a function
//! by reference when it is importable, or by source text plus the caller's
//! root-level modules when it is not (the `__main__`-with-no-file case);
//! either way the goal is that the child can *locate* the callable without
//! the parent shipping a live closure environment. Rust has no `eval`, so
//! the structural analogue enforced here is the type of `run`/`run_in_thread`
//! themselves: they take a plain `fn(A) -> R` item pointer, never a
//! capturing closure. A fn pointer is `'static` and already linked into the
//! child thread's copy of the binary, exactly as a module-level Python
//! function is already importable from the child — this preserves the
//! spec's "must be preserved" requirement without inventing code-shipping.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};

use subinterp_core::byte_lock::TIME_RESOLUTION;
use subinterp_core::shared_buffer::DEFAULT_TTL;
use subinterp_core::{struct_view, SharedBuffer};

use crate::error::{SubinterpError, SubinterpResult};
use crate::host::{Command, HostRuntime, InterpreterHandle};
use crate::registry;

/// Spec §3's worker region split: command (fixed), send (~80% of the rest),
/// return (the remainder). Command region currently only exists to give the
/// layout a name symmetric with spec.md; dispatch itself goes through
/// `HostRuntime::run_command` rather than an on-the-wire opcode.
pub const COMMAND_REGION_SIZE: usize = 4096;
pub const DEFAULT_PAYLOAD_REGION_SIZE: usize = 256 * 1024;

/// How many scheduling quanta `close()` waits for an in-flight `run` to
/// finish before giving up and reporting `InterpreterBusy` (spec §4.7).
const CLOSE_WAIT_QUANTA: u32 = 10;

struct Regions {
    send_offset: usize,
    send_len: usize,
    return_offset: usize,
    return_len: usize,
}

fn split_regions(payload_len: usize) -> Regions {
    let payload_region = payload_len.saturating_sub(COMMAND_REGION_SIZE);
    let send_len = (payload_region * 4) / 5;
    let return_len = payload_region - send_len;
    Regions {
        send_offset: COMMAND_REGION_SIZE,
        send_len,
        return_offset: COMMAND_REGION_SIZE + send_len,
        return_len,
    }
}

/// Result of a `run_in_thread` call, retrieved through `result()`.
struct AsyncOutcome {
    bytes: SubinterpResult<Vec<u8>>,
}

/// Wraps one subordinate interpreter (in this workspace, one dedicated OS
/// thread — see `host`) and the `SharedBuffer` used to pass arguments and
/// results across that boundary.
pub struct InterpreterWorker<H: HostRuntime> {
    host: Arc<H>,
    handle: InterpreterHandle,
    buf: Mutex<SharedBuffer>,
    regions: Regions,
    pending: Arc<AtomicBool>,
    async_outcome: Arc<Mutex<Option<AsyncOutcome>>>,
    async_thread: Mutex<Option<JoinHandle<()>>>,
}

impl<H: HostRuntime + 'static> InterpreterWorker<H> {
    /// Starts a subordinate interpreter and allocates its worker buffer.
    pub fn start(host: Arc<H>) -> SubinterpResult<Arc<Self>> {
        Self::start_with_payload_region(host, DEFAULT_PAYLOAD_REGION_SIZE)
    }

    pub fn start_with_payload_region(host: Arc<H>, payload_region: usize) -> SubinterpResult<Arc<Self>> {
        let handle = host.create_interpreter()?;
        let total = COMMAND_REGION_SIZE + payload_region;
        let mut buf = SharedBuffer::create(total, DEFAULT_TTL);
        buf.start().map_err(SubinterpError::Core)?;
        let regions = split_regions(total);

        let worker = Arc::new(InterpreterWorker {
            host,
            handle,
            buf: Mutex::new(buf),
            regions,
            pending: Arc::new(AtomicBool::new(false)),
            async_outcome: Arc::new(Mutex::new(None)),
            async_thread: Mutex::new(None),
        });

        let weak = Arc::downgrade(&worker);
        registry::register_interpreter(handle, move || match weak.upgrade() {
            Some(w) => w.close(),
            None => Ok(()),
        });

        Ok(worker)
    }

    pub fn handle(&self) -> InterpreterHandle {
        self.handle
    }

    /// Synchronously calls `f(args)` in the subordinate interpreter and
    /// returns its result.
    pub fn run<A, R>(&self, f: fn(A) -> R, args: A) -> SubinterpResult<R>
    where
        A: Serialize + DeserializeOwned + Send + 'static,
        R: Serialize + DeserializeOwned + Send + 'static,
    {
        let payload = bincode::serialize(&args)?;
        if payload.len() > self.regions.send_len {
            return Err(SubinterpError::Core(subinterp_core::CoreError::PayloadTooLarge {
                len: payload.len(),
                capacity: self.regions.send_len,
            }));
        }

        // Captured as `usize` rather than `*mut u8`: a raw pointer is not
        // `Send`, but the address is just a number until cast back inside
        // the closure, which only ever runs on the child's own thread while
        // this call blocks on `run_command` below.
        let ptr_addr = self.buf.lock().payload_address();
        let send_offset = self.regions.send_offset;
        let return_offset = self.regions.return_offset;
        let return_len = self.regions.return_len;

        // SAFETY: `self.buf` outlives this call — `run` blocks on
        // `run_command` until the child's closure (below) has finished
        // writing into the same buffer, and `self` is not dropped while
        // this function is on the stack.
        unsafe { struct_view::write_bytes(ptr_addr as *mut u8, send_offset, &payload) };

        let command: Command = Box::new(move || {
            let ptr = ptr_addr as *mut u8;
            // SAFETY: see above; this closure runs synchronously inside
            // `run_command` before it returns.
            let args_bytes = unsafe { struct_view::read_bytes(ptr, send_offset, payload.len()) };
            let args: A = bincode::deserialize(&args_bytes).map_err(|e| e.to_string())?;
            let result = f(args);
            let out = bincode::serialize(&result).map_err(|e| e.to_string())?;
            if out.len() > return_len {
                return Err(format!(
                    "result ({} bytes) exceeds the return region ({} bytes)",
                    out.len(),
                    return_len
                ));
            }
            // SAFETY: bounds checked above.
            unsafe { struct_view::write_bytes(ptr, return_offset, &out) };
            Ok(out.len().to_le_bytes().to_vec())
        });

        let len_bytes = self.host.run_command(self.handle, command)?;
        let len = u64::from_le_bytes(len_bytes.try_into().unwrap_or_default()) as usize;
        // SAFETY: `len` was just written by the child's own successful run.
        let result_bytes = unsafe { struct_view::read_bytes(ptr_addr as *mut u8, return_offset, len) };
        Ok(bincode::deserialize(&result_bytes)?)
    }

    /// Asynchronous variant: dispatches `f(args)` on a dedicated OS thread
    /// and returns immediately. Only one outstanding call is tracked at a
    /// time; a second call while one is pending fails `InterpreterBusy`.
    pub fn run_in_thread<A, R>(self: &Arc<Self>, f: fn(A) -> R, args: A) -> SubinterpResult<()>
    where
        A: Serialize + DeserializeOwned + Send + 'static,
        R: Serialize + DeserializeOwned + Send + 'static,
    {
        if self.pending.swap(true, Ordering::AcqRel) {
            return Err(SubinterpError::InterpreterBusy);
        }
        let this = self.clone();
        let outcome_slot = self.async_outcome.clone();
        let pending = self.pending.clone();
        let join = std::thread::spawn(move || {
            let result = this.run::<A, R>(f, args).and_then(|r| Ok(bincode::serialize(&r)?));
            *outcome_slot.lock() = Some(AsyncOutcome { bytes: result });
            pending.store(false, Ordering::Release);
        });
        *self.async_thread.lock() = Some(join);
        Ok(())
    }

    /// Whether a `run_in_thread` dispatch has finished (or none was ever
    /// started — callers should check `result()`'s `Option` to tell the
    /// two apart).
    pub fn done(&self) -> bool {
        !self.pending.load(Ordering::Acquire)
    }

    /// Blocks until the outstanding `run_in_thread` call finishes.
    pub fn join(&self) {
        if let Some(handle) = self.async_thread.lock().take() {
            let _ = handle.join();
        }
    }

    /// Retrieves the result of the last `run_in_thread` call, deserializing
    /// it as `R`. Returns `None` if no async call has completed yet.
    pub fn result<R: DeserializeOwned>(&self) -> SubinterpResult<Option<R>> {
        let mut slot = self.async_outcome.lock();
        match slot.take() {
            None => Ok(None),
            Some(AsyncOutcome { bytes }) => {
                let bytes = bytes?;
                Ok(Some(bincode::deserialize(&bytes)?))
            }
        }
    }

    /// Runs `command` in the child interpreter and returns its raw encoded
    /// result, without the typed `run`/`SharedBuffer` round-trip — the
    /// compiled stand-in for spec §6's `run_source(handle, source)`, since a
    /// boxed closure is this workspace's equivalent of "a string of source
    /// to execute" (see this module's header comment and `host::Command`).
    /// When `raise_on_error` is `false`, a failing command is logged and
    /// swallowed as `Ok(None)` instead of propagating `ChildFailure`.
    pub fn run_source(&self, command: Command, raise_on_error: bool) -> SubinterpResult<Option<Vec<u8>>> {
        match self.host.run_command(self.handle, command) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if !raise_on_error => {
                tracing::warn!(handle = self.handle, %err, "run_source: child failed, raise_on_error=false");
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    /// Waits briefly for any in-flight call to settle, then destroys the
    /// child interpreter and releases its buffer. Fails `InterpreterBusy`
    /// (without side effects) if the child is still executing — callers
    /// must `join()` first. A second call on an already-closed worker is a
    /// silent no-op (spec §8's idempotence invariant).
    pub fn close(&self) -> SubinterpResult<()> {
        if !self.host.is_running(self.handle) {
            return Ok(());
        }
        for _ in 0..CLOSE_WAIT_QUANTA {
            if !self.host.is_busy(self.handle) {
                break;
            }
            std::thread::sleep(TIME_RESOLUTION);
        }
        if self.host.is_busy(self.handle) {
            return Err(SubinterpError::InterpreterBusy);
        }
        if let Err(err) = self.host.destroy_interpreter(self.handle) {
            if !self.host.is_running(self.handle) {
                // Raced with another close (or the handle was already gone
                // by the time `destroy_interpreter` ran); still a no-op.
                registry::unregister_interpreter(self.handle);
                return Ok(());
            }
            return Err(err);
        }
        registry::unregister_interpreter(self.handle);
        tracing::debug!(handle = self.handle, "worker: closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::ThreadHost;

    fn cos_approx(x: f64) -> f64 {
        // A worker call should tolerate a real computed function, not just
        // an identity passthrough.
        1.0 - x * x / 2.0
    }

    #[test]
    fn run_dispatches_to_the_child_and_reads_back_the_result() {
        let host = Arc::new(ThreadHost::new());
        let worker = InterpreterWorker::start(host).unwrap();
        let result = worker.run(cos_approx, 0.0f64).unwrap();
        assert_eq!(result, 1.0);
        worker.close().unwrap();
    }

    #[test]
    fn run_in_thread_then_join_then_result() {
        let host = Arc::new(ThreadHost::new());
        let worker = InterpreterWorker::start(host).unwrap();
        worker.run_in_thread(cos_approx, 0.0f64).unwrap();
        worker.join();
        assert!(worker.done());
        let result: Option<f64> = worker.result().unwrap();
        assert_eq!(result, Some(1.0));
        worker.close().unwrap();
    }

    #[test]
    fn close_removes_the_handle_from_list_interpreters() {
        let host = Arc::new(ThreadHost::new());
        let worker = InterpreterWorker::start(host.clone()).unwrap();
        let handle = worker.handle();
        assert!(host.list_interpreters().contains(&handle));
        worker.close().unwrap();
        assert!(!host.list_interpreters().contains(&handle));
    }

    #[test]
    fn close_called_twice_is_a_no_op() {
        let host = Arc::new(ThreadHost::new());
        let worker = InterpreterWorker::start(host).unwrap();
        worker.close().unwrap();
        worker.close().unwrap();
    }

    #[test]
    fn run_source_returns_the_commands_raw_bytes() {
        let host = Arc::new(ThreadHost::new());
        let worker = InterpreterWorker::start(host).unwrap();
        let result = worker
            .run_source(Box::new(|| Ok(vec![1, 2, 3])), true)
            .unwrap();
        assert_eq!(result, Some(vec![1, 2, 3]));
        worker.close().unwrap();
    }

    #[test]
    fn run_source_swallows_failure_when_raise_on_error_is_false() {
        let host = Arc::new(ThreadHost::new());
        let worker = InterpreterWorker::start(host).unwrap();
        let result = worker
            .run_source(Box::new(|| Err("boom".to_string())), false)
            .unwrap();
        assert_eq!(result, None);
        worker.close().unwrap();
    }

    #[test]
    fn run_source_propagates_failure_when_raise_on_error_is_true() {
        let host = Arc::new(ThreadHost::new());
        let worker = InterpreterWorker::start(host).unwrap();
        let result = worker.run_source(Box::new(|| Err("boom".to_string())), true);
        assert!(matches!(result, Err(SubinterpError::ChildFailure(_))));
        worker.close().unwrap();
    }

    fn too_big(_: ()) -> Vec<u8> {
        vec![0u8; DEFAULT_PAYLOAD_REGION_SIZE]
    }

    #[test]
    fn oversized_result_surfaces_as_a_child_failure() {
        let host = Arc::new(ThreadHost::new());
        let worker = InterpreterWorker::start(host).unwrap();
        let result = worker.run(too_big, ());
        assert!(matches!(result, Err(SubinterpError::ChildFailure(_))));
        worker.close().unwrap();
    }
}
