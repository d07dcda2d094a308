//! Error kinds for the cross-interpreter data plane (spec §7).
//!
//! Each variant corresponds to one row of the error table: recoverable
//! contention kinds (`ResourceBusy`, `Timeout`, `BrokenChannel`, `Empty`,
//! `Full`) are expected to be handled locally by callers; the rest surface
//! as programming errors.

use std::time::Duration;

/// Errors raised by `subinterp-core`'s locks, buffers, pipes and boards.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// A non-blocking acquire would have had to wait.
    #[error("resource busy")]
    ResourceBusy,

    /// A timed operation exceeded its deadline.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// An item exceeded the send or return region of a buffer.
    #[error("payload of {len} bytes exceeds the {capacity}-byte region")]
    PayloadTooLarge { len: usize, capacity: usize },

    /// A `SharedBuffer` was touched before `start()` or after `close()`.
    #[error("buffer not ready for use")]
    BufferNotReady,

    /// A state-machine precondition was violated.
    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    /// A consumer tried to attach after the buffer's TTL had passed.
    #[error("TTL exceeded, origin may have reclaimed this buffer")]
    TtlExceeded,

    /// Write to a pipe end with no live readers.
    #[error("broken channel: no reader remains")]
    BrokenChannel,

    /// Underlying OS call failed.
    #[error("system call failed")]
    Io(#[from] std::io::Error),

    /// `nix`-level system call failure (kept distinct from `io::Error` so
    /// callers can match on `errno` via `nix::Error` directly).
    #[error("system call failed")]
    Errno(#[from] nix::Error),
}

pub type CoreResult<T> = Result<T, CoreError>;
