//! Process-wide live-interpreter tracking and the exit hook (spec §6).
//!
//! Lifted from the Python original's module-scoped singletons into an
//! explicit registry, per spec §9's REDESIGN FLAGS guidance: every
//! [`InterpreterWorker`](crate::worker::InterpreterWorker) registers a
//! closure here on [`start`](crate::worker::InterpreterWorker::start) and
//! unregisters on a successful `close()`.

use std::cell::Cell;
use std::sync::Mutex;

use once_cell::sync::Lazy;

use crate::error::SubinterpResult;
use crate::host::InterpreterHandle;

thread_local! {
    static CURRENT_HANDLE: Cell<InterpreterHandle> = Cell::new(0);
}

/// Sets the handle `get_current()` reports for the calling thread. Called by
/// `ThreadHost` when it spawns a child's dedicated thread; the main thread
/// never calls this and so reports the reserved root handle, `0`.
pub fn set_current_handle(handle: InterpreterHandle) {
    CURRENT_HANDLE.with(|c| c.set(handle));
}

/// The handle of the interpreter the calling thread belongs to.
pub fn get_current() -> InterpreterHandle {
    CURRENT_HANDLE.with(Cell::get)
}

type CloseFn = Box<dyn Fn() -> SubinterpResult<()> + Send + Sync>;

struct Registered {
    handle: InterpreterHandle,
    close: CloseFn,
}

static REGISTRY: Lazy<Mutex<Vec<Registered>>> = Lazy::new(|| Mutex::new(Vec::new()));

/// Registers a live interpreter's `close` entry point; called once from
/// `InterpreterWorker::start`.
pub fn register_interpreter(
    handle: InterpreterHandle,
    close: impl Fn() -> SubinterpResult<()> + Send + Sync + 'static,
) {
    REGISTRY
        .lock()
        .expect("interpreter registry poisoned")
        .push(Registered {
            handle,
            close: Box::new(close),
        });
}

pub fn unregister_interpreter(handle: InterpreterHandle) {
    REGISTRY
        .lock()
        .expect("interpreter registry poisoned")
        .retain(|r| r.handle != handle);
}

/// Live interpreter handles, per spec §6's `list_all()`.
pub fn list_all() -> Vec<InterpreterHandle> {
    REGISTRY
        .lock()
        .expect("interpreter registry poisoned")
        .iter()
        .map(|r| r.handle)
        .collect()
}

/// Walks every still-registered interpreter and attempts `.close()`,
/// warning on any that resist (still executing). Intended to be invoked
/// once from a process shutdown path (spec §6's exit hook); idempotent,
/// since each successful close unregisters itself.
pub fn run_exit_hook() {
    let entries: Vec<Registered> = std::mem::take(
        &mut *REGISTRY.lock().expect("interpreter registry poisoned"),
    );
    for entry in entries {
        if let Err(err) = (entry.close)() {
            tracing::warn!(handle = entry.handle, %err, "interpreter resisted close on exit");
        }
    }
}
