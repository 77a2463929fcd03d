//! Scheduler state of the virtual machine.
//!
//! Everything in this module is plain data guarded by a single critical
//! section. Nothing here spawns OS threads or blocks; the [`crate::runtime`]
//! layer owns the execution contexts and carries out the switches that
//! [`SchedulerCore`] decides.
//!
//! # Key Components
//!
//! ## Thread Model
//! - [`ThreadControlBlock`] / [`ThreadTable`] - Per-thread metadata, ids never reused
//! - [`ThreadState`] / [`WaitReason`] - Lifecycle states and why a thread is blocked
//! - [`ThreadPriority`] - `None < Low < Normal < High`, `None` reserved for idle
//! - [`ReadyQueues`] - One FIFO per priority level
//! - [`StackArena`] - Stack reservations with a byte budget
//!
//! ## Scheduling
//! - [`SchedulerCore`] - Dispatcher, selection policy, timer and I/O bridges
//! - [`Switch`] - A context switch decided inside the critical section
//!
//! ## Synchronization
//! - [`MutexState`] / [`MutexTable`] - Mutexes with priority-segmented wait queues
//!
//! ## Configuration
//! - [`VmConfig`] - Tick interval, stack sizing and limits
//! - [`VmStats`] - Counters collected during a run

mod config;
mod scheduler;
mod stats;
mod sync;
mod thread;
mod types;

pub use config::{VmConfig, MIN_CONTEXT_STACK};
pub use scheduler::{AcquireOutcome, IoRequest, IoTicket, ScheduleMode, SchedulerCore, Switch};
pub use stats::VmStats;
pub use sync::{MutexState, MutexTable};
pub use thread::{
    ReadyQueues, StackArena, StackRegion, ThreadControlBlock, ThreadEntry, ThreadPriority,
    ThreadState, ThreadTable, WaitReason,
};
pub use types::{MutexId, ThreadId, Tick, Timeout, TIMEOUT_IMMEDIATE, TIMEOUT_INFINITE};
