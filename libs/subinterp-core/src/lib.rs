//! Cross-interpreter shared-memory data plane: byte locks, struct views,
//! reference-counted shared buffers, a readiness selector, pipes, a
//! lockable slot board, and cross-interpreter locks.
//!
//! This crate knows nothing about what an "interpreter" is — that concept,
//! and the worker/queue machinery built on top of these primitives, lives
//! in the `subinterp` crate. Everything here is just memory, atomics, and
//! file descriptors.
#![forbid(unsafe_op_in_unsafe_fn)]

pub mod board;
pub mod byte_lock;
pub mod error;
pub mod lock;
pub mod pipe;
pub mod selector;
pub mod shared_buffer;
pub mod struct_view;

pub use board::{LockableBoard, LockableBoardHandle, SlotState};
pub use byte_lock::{LockGuard, LockTimeout, ScopedLock};
pub use error::{CoreError, CoreResult};
pub use lock::{IntRLock, IntRLockGuard, Lock, PlainLockGuard, RLock, RLockGuard};
pub use pipe::{DuplexPipe, DuplexPipeHandle, SimplexPipe, SimplexPipeHandle};
pub use selector::{Interest, ReadyEvent, Selector};
pub use shared_buffer::{BufferState, DataState, SharedBuffer, SharedBufferHandle};
