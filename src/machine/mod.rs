//! Host facilities the virtual machine is built on.
//!
//! - [`context`]: execution contexts and the switch primitive
//! - [`alarm`]: the periodic tick source
//! - [`file`]: asynchronous file operations with completion tokens
//!
//! None of these know about scheduling policy. They are wired together by
//! [`crate::runtime`].

pub mod alarm;
pub mod context;
pub mod file;

pub use alarm::{Alarm, AlarmCallback};
pub use context::{retire_current, ContextTable, Gate, Retired, Wake};
pub use file::{
    CompletionCallback, FileBackend, FileOp, IoCompletion, IoOutcome, OpenFlags,
    ThreadedFileBackend, Whence, IO_FAILURE,
};
