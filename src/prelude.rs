//! # tickvm Prelude
//!
//! Re-exports the types most programs running on the virtual machine need.
//!
//! ```rust,no_run
//! use tickvm::prelude::*;
//!
//! fn entry(vm: &Vm) -> Result<()> {
//!     let mutex = vm.mutex_create()?;
//!     vm.mutex_acquire(mutex, Timeout::Ticks(10))?;
//!     vm.mutex_release(mutex)
//! }
//! ```

// ================================================================================================
// Core Types and Error Handling
// ================================================================================================

/// The main error type for all tickvm operations
pub use crate::Error;

/// The result type used throughout tickvm
pub use crate::Result;

// ================================================================================================
// Running a Virtual Machine
// ================================================================================================

/// Handle passed to every thread entry
pub use crate::Vm;

/// Builder, run summary and configuration
pub use crate::{RunReport, VmBuilder, VmConfig, VmStats};

/// Named programs
pub use crate::{Program, ProgramEntry, ProgramRegistry};

// ================================================================================================
// Threads and Synchronization
// ================================================================================================

/// Identifiers and timeouts
pub use crate::{MutexId, ThreadId, Tick, Timeout};

/// Thread attributes
pub use crate::{ThreadPriority, ThreadState, WaitReason};

// ================================================================================================
// File Operations
// ================================================================================================

/// Open flags and seek origins
pub use crate::{OpenFlags, Whence};

/// Formatted output to the virtual machine's standard descriptors
pub use crate::{vm_print, vm_print_error};
