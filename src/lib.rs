// Copyright 2025 tickvm developers
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

#![doc(html_no_source)]
#![deny(missing_docs)]
//! # tickvm
//!
//! A user-level virtual machine that multiplexes cooperative threads onto a
//! single logical CPU. Threads are scheduled by strict priority with
//! round-robin inside a priority level, preempted on periodic timer ticks,
//! and block on sleeps, file operations and mutexes.
//!
//! ## Features
//!
//! - **Priority scheduling** - `High > Normal > Low`, FIFO within a level, idle at `None`
//! - **Tick preemption** - an alarm thread advances the virtual clock and requests reschedules
//! - **Completion-based file I/O** - open, read, write, seek and close block only the caller
//! - **Priority mutexes** - waiters are served by priority, then arrival order, with tick timeouts
//! - **Deterministic core** - [`vm::SchedulerCore`] holds every decision and can be driven directly
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tickvm::prelude::*;
//!
//! let report = VmBuilder::new().tick_ms(5).run(|vm| {
//!     let worker = vm.thread_create(
//!         |vm| {
//!             tickvm::vm_print!(vm, "worker on thread {}\n", vm.thread_id()?)?;
//!             Ok(())
//!         },
//!         0x4000,
//!         ThreadPriority::High,
//!     )?;
//!     vm.thread_activate(worker)?;
//!     vm.thread_sleep(Timeout::Ticks(2))
//! })?;
//! println!("{} context switches", report.stats.context_switches);
//! # Ok::<(), tickvm::Error>(())
//! ```
//!
//! ### Mutual Exclusion
//!
//! ```rust,no_run
//! use tickvm::{Timeout, VmBuilder};
//!
//! VmBuilder::new().run(|vm| {
//!     let mutex = vm.mutex_create()?;
//!     vm.mutex_acquire(mutex, Timeout::Infinite)?;
//!     assert_eq!(vm.mutex_query(mutex)?, vm.thread_id()?);
//!     vm.mutex_release(mutex)?;
//!     vm.mutex_delete(mutex)
//! })?;
//! # Ok::<(), tickvm::Error>(())
//! ```
//!
//! ## Architecture
//!
//! - [`vm`] - scheduler state: thread table, ready queues, mutexes, the virtual clock
//! - [`machine`] - host facilities: execution contexts, the alarm, the file backend
//! - [`runtime`] - the [`Vm`] handle and [`VmBuilder`] tying both together
//! - [`prelude`] - re-exports of the commonly used types
//!
//! ## Error Handling
//!
//! Every operation returns [`Result<T, Error>`](Result). The error variants map
//! onto fixed numeric status codes through [`Error::status`]:
//!
//! ```rust,no_run
//! use tickvm::{Error, ThreadId, VmBuilder};
//!
//! VmBuilder::new().run(|vm| {
//!     match vm.thread_delete(ThreadId::new(42)) {
//!         Err(Error::InvalidId) => println!("no such thread"),
//!         Err(e) => println!("status {:#x}: {}", e.status(), e),
//!         Ok(()) => {}
//!     }
//!     Ok(())
//! })?;
//! # Ok::<(), Error>(())
//! ```
#[macro_use]
pub(crate) mod macros;

#[macro_use]
pub(crate) mod error;

pub mod machine;
pub mod prelude;
pub mod runtime;
pub mod vm;

/// Result type used throughout `tickvm`.
///
/// ```rust
/// fn checked(value: u32) -> tickvm::Result<u32> {
///     if value == 0 {
///         return Err(tickvm::Error::InvalidParameter);
///     }
///     Ok(value)
/// }
/// assert!(checked(0).is_err());
/// ```
pub type Result<T> = std::result::Result<T, Error>;

/// `tickvm` Error type
///
/// Each variant corresponds to one status code returned by the virtual machine
/// operations. See [`Error::status`].
pub use error::{Error, STATUS_SUCCESS};

/// Handle, builder and program registry of a virtual machine run.
pub use runtime::{Program, ProgramEntry, ProgramRegistry, RunReport, Vm, VmBuilder};

/// Identifiers, timeouts and thread attributes.
pub use vm::{
    MutexId, ThreadId, ThreadPriority, ThreadState, Tick, Timeout, VmConfig, VmStats,
    WaitReason, TIMEOUT_IMMEDIATE, TIMEOUT_INFINITE,
};

/// File operation flags and seek origins.
pub use machine::{FileBackend, OpenFlags, Whence};
