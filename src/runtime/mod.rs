//! Threaded runtime executing the decisions of the scheduler core.
//!
//! # Architecture
//!
//! ```text
//!   VM thread ──Vm call──▶ Mutex<SchedulerCore> ──Switch──▶ ContextTable
//!                              ▲          ▲
//!        alarm thread ─tick────┘          └──complete_io── file worker
//! ```
//!
//! - [`Vm`] is the handle every thread entry receives. Its operations enter
//!   the critical section, apply the change to the core and then switch
//!   contexts outside of it.
//! - The alarm thread and the file worker are the two asynchronous bridges.
//!   They only mutate core state and request preemption; the running thread
//!   picks the request up at its next operation, the idle thread immediately.
//! - [`VmBuilder`] wires everything together and runs the main thread on the
//!   calling OS thread. The run ends when the main thread's entry returns or
//!   the main thread is terminated.

mod builder;
mod program;
mod vm;

pub use builder::{RunReport, VmBuilder};
pub use program::{Program, ProgramEntry, ProgramRegistry};
pub use vm::Vm;
