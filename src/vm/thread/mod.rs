//! Thread model of the virtual machine.
//!
//! - [`ThreadTable`] / [`ThreadControlBlock`]: the TCB store, single source of truth
//!   for thread metadata
//! - [`ReadyQueues`]: one FIFO per [`ThreadPriority`] level
//! - [`StackArena`]: stack reservations indexed by thread id
//! - [`ThreadState`] / [`WaitReason`]: lifecycle states

mod ready;
mod stack;
mod state;
mod tcb;

pub use ready::ReadyQueues;
pub use stack::{StackArena, StackRegion};
pub use state::{ThreadPriority, ThreadState, WaitReason};
pub use tcb::{ThreadControlBlock, ThreadEntry, ThreadTable};
