//! The `HostRuntime` collaborator (spec §6) and its production
//! implementation, `ThreadHost`.
//!
//! spec.md lists `create_interpreter`/`destroy_interpreter`/`is_running`/
//! `list_interpreters`/`current_interpreter`/`main_interpreter` and
//! `run_source(handle, source)` as external collaborators, explicitly out of
//! scope for the data plane. A runnable, testable crate still needs
//! something behind that trait (see `DESIGN.md`'s recorded decision): a
//! "subordinate interpreter" here is a dedicated OS thread with its own
//! registry slot, and `run_source`'s "string of source" becomes a boxed
//! closure — the compiled equivalent of injecting source text into a child.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::JoinHandle;

use parking_lot::Mutex;

use crate::error::{SubinterpError, SubinterpResult};
use crate::registry;

pub type InterpreterHandle = u32;

/// The reserved handle naming the process's main interpreter (spec §3).
pub const MAIN_INTERPRETER: InterpreterHandle = 0;

/// The compiled stand-in for "a string of source to run in the child"
/// (spec §6's `run_source`): a one-shot unit of work that returns either an
/// encoded result or a description of what went wrong.
pub type Command = Box<dyn FnOnce() -> Result<Vec<u8>, String> + Send>;

/// External collaborator this crate builds its worker/queue surface on top
/// of. Out of scope for spec.md itself; `ThreadHost` is the one production
/// implementation this crate ships. A real multi-process or sandboxed
/// runtime would implement this trait instead.
pub trait HostRuntime: Send + Sync {
    fn create_interpreter(&self) -> SubinterpResult<InterpreterHandle>;
    fn destroy_interpreter(&self, handle: InterpreterHandle) -> SubinterpResult<()>;
    fn is_running(&self, handle: InterpreterHandle) -> bool;
    fn list_interpreters(&self) -> Vec<InterpreterHandle>;
    fn current_interpreter(&self) -> InterpreterHandle;
    fn main_interpreter(&self) -> InterpreterHandle {
        MAIN_INTERPRETER
    }
    /// Runs `command` synchronously on `handle`'s thread and returns its
    /// result. Blocks the caller until the command completes.
    fn run_command(&self, handle: InterpreterHandle, command: Command) -> SubinterpResult<Vec<u8>>;
    /// Whether `handle` is in the middle of a `run_command` call right now.
    /// Used by `InterpreterWorker::close` to decide whether to wait.
    fn is_busy(&self, handle: InterpreterHandle) -> bool;
}

struct Job {
    command: Command,
    reply: mpsc::Sender<Result<Vec<u8>, String>>,
}

/// Turns a caught panic payload into the same `Err(String)` channel a
/// returned error takes, so a misbehaving command never leaves its
/// interpreter thread's `busy` flag stuck (spec's `ChildFailure` — "worker
/// stays usable").
fn panic_payload_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("interpreter panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("interpreter panicked: {s}")
    } else {
        "interpreter panicked".to_string()
    }
}

struct Child {
    sender: mpsc::Sender<Job>,
    join: Option<JoinHandle<()>>,
    busy: Arc<AtomicBool>,
}

/// `HostRuntime` built on `std::thread` + `std::sync::mpsc`: each
/// interpreter is one dedicated OS thread draining a job queue, with its own
/// `registry::CURRENT_HANDLE` thread-local standing in for a subinterpreter's
/// private state.
#[derive(Default)]
pub struct ThreadHost {
    children: Mutex<HashMap<InterpreterHandle, Child>>,
    next_handle: AtomicU32,
}

impl ThreadHost {
    pub fn new() -> Self {
        ThreadHost {
            children: Mutex::new(HashMap::new()),
            next_handle: AtomicU32::new(MAIN_INTERPRETER + 1),
        }
    }
}

impl HostRuntime for ThreadHost {
    fn create_interpreter(&self) -> SubinterpResult<InterpreterHandle> {
        let handle = self.next_handle.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel::<Job>();
        let busy = Arc::new(AtomicBool::new(false));
        let busy_for_thread = busy.clone();
        let join = std::thread::Builder::new()
            .name(format!("subinterp-{handle}"))
            .spawn(move || {
                registry::set_current_handle(handle);
                for job in rx {
                    busy_for_thread.store(true, Ordering::Release);
                    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(job.command))
                        .unwrap_or_else(|payload| Err(panic_payload_message(payload)));
                    busy_for_thread.store(false, Ordering::Release);
                    let _ = job.reply.send(result);
                }
            })
            .map_err(|e| SubinterpError::ChildFailure(e.to_string()))?;
        self.children.lock().insert(
            handle,
            Child {
                sender: tx,
                join: Some(join),
                busy,
            },
        );
        tracing::debug!(handle, "host: interpreter thread started");
        Ok(handle)
    }

    fn destroy_interpreter(&self, handle: InterpreterHandle) -> SubinterpResult<()> {
        let child = self
            .children
            .lock()
            .remove(&handle)
            .ok_or(SubinterpError::UnknownInterpreter(handle))?;
        // Dropping `sender` closes the channel, ending the child's `for job
        // in rx` loop so the thread returns on its own.
        drop(child.sender);
        if let Some(join) = child.join {
            let _ = join.join();
        }
        tracing::debug!(handle, "host: interpreter thread destroyed");
        Ok(())
    }

    fn is_running(&self, handle: InterpreterHandle) -> bool {
        handle == MAIN_INTERPRETER || self.children.lock().contains_key(&handle)
    }

    fn list_interpreters(&self) -> Vec<InterpreterHandle> {
        self.children.lock().keys().copied().collect()
    }

    fn current_interpreter(&self) -> InterpreterHandle {
        registry::get_current()
    }

    fn run_command(&self, handle: InterpreterHandle, command: Command) -> SubinterpResult<Vec<u8>> {
        let (reply_tx, reply_rx) = mpsc::channel();
        {
            let children = self.children.lock();
            let child = children
                .get(&handle)
                .ok_or(SubinterpError::UnknownInterpreter(handle))?;
            child
                .sender
                .send(Job {
                    command,
                    reply: reply_tx,
                })
                .map_err(|_| SubinterpError::ChildFailure("interpreter channel closed".into()))?;
        }
        reply_rx
            .recv()
            .map_err(|_| SubinterpError::ChildFailure("interpreter died mid-call".into()))?
            .map_err(SubinterpError::ChildFailure)
    }

    fn is_busy(&self, handle: InterpreterHandle) -> bool {
        self.children
            .lock()
            .get(&handle)
            .map(|c| c.busy.load(Ordering::Acquire))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runs_a_command_on_its_own_thread_and_reports_the_handle() {
        let host = ThreadHost::new();
        let handle = host.create_interpreter().unwrap();
        assert!(host.is_running(handle));
        assert_eq!(host.list_interpreters(), vec![handle]);

        let result = host
            .run_command(
                handle,
                Box::new(move || Ok(registry::get_current().to_le_bytes().to_vec())),
            )
            .unwrap();
        assert_eq!(u32::from_le_bytes(result.try_into().unwrap()), handle);

        host.destroy_interpreter(handle).unwrap();
        assert!(!host.is_running(handle));
    }

    #[test]
    fn a_returned_error_surfaces_as_child_failure() {
        let host = ThreadHost::new();
        let handle = host.create_interpreter().unwrap();
        let result = host.run_command(handle, Box::new(|| Err("boom".to_string())));
        assert!(matches!(result, Err(SubinterpError::ChildFailure(msg)) if msg == "boom"));
        host.destroy_interpreter(handle).unwrap();
    }

    #[test]
    fn a_panicking_command_surfaces_as_child_failure() {
        let host = ThreadHost::new();
        let handle = host.create_interpreter().unwrap();
        let result = host.run_command(handle, Box::new(|| panic!("boom")));
        assert!(matches!(result, Err(SubinterpError::ChildFailure(msg)) if msg.contains("boom")));
        host.destroy_interpreter(handle).unwrap();
    }

    #[test]
    fn a_panic_does_not_leave_the_interpreter_stuck_busy() {
        let host = ThreadHost::new();
        let handle = host.create_interpreter().unwrap();
        let _ = host.run_command(handle, Box::new(|| panic!("boom")));
        assert!(!host.is_busy(handle));

        let result = host.run_command(handle, Box::new(|| Ok(vec![7])));
        assert_eq!(result.unwrap(), vec![7]);
        host.destroy_interpreter(handle).unwrap();
    }
}
