//! Error kinds for the worker/queue surface (spec §7), extending the data
//! plane's [`subinterp_core::CoreError`] with the handful of kinds that only
//! make sense once "interpreter" and "queue" exist as concepts.

use subinterp_core::CoreError;

#[derive(Debug, thiserror::Error)]
pub enum SubinterpError {
    /// Anything raised by the shared-memory data plane underneath (lock
    /// contention, TTL expiry, buffer state violations, ...).
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("close attempted while the interpreter is still executing; join first")]
    InterpreterBusy,

    #[error("child interpreter failed: {0}")]
    ChildFailure(String),

    #[error("queue is empty")]
    Empty,

    #[error("queue is full")]
    Full,

    #[error("unknown interpreter handle {0}")]
    UnknownInterpreter(u32),

    #[error("serialization failed: {0}")]
    Serialization(#[from] bincode::Error),
}

pub type SubinterpResult<T> = Result<T, SubinterpError>;
