//! User-visible surface built on `subinterp-core`'s data plane: a
//! [`host::HostRuntime`] collaborator, the [`worker::InterpreterWorker`]
//! call/return primitive, and the [`queue::Queue`] mailbox (spec §4.7/§4.8,
//! §6).
//!
//! `subinterp-core` only knows about bytes and shared memory; this crate is
//! where "an interpreter" becomes a concrete, runnable thing and where
//! typed values replace raw payloads.

pub mod error;
pub mod host;
pub mod queue;
pub mod registry;
pub mod worker;

pub use error::{SubinterpError, SubinterpResult};
pub use host::{HostRuntime, InterpreterHandle, ThreadHost, MAIN_INTERPRETER};
pub use queue::{Queue, QueueHandle};
pub use worker::InterpreterWorker;

/// Initializes a `tracing` subscriber reading `RUST_LOG` (default `info`),
/// matching the gateway-style setup used elsewhere in this stack. Intended
/// for binaries and tests embedding this crate directly; libraries that
/// already own their own subscriber should not call this.
pub fn tracing_init() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .try_init();
}

/// Runs every registered interpreter's exit hook, in reverse registration
/// order, best-effort. Mirrors the Python original's `atexit` cleanup for
/// interpreters a caller forgot to `close()` (spec §6).
pub fn shutdown_all() {
    registry::run_exit_hook();
}
