use thiserror::Error;

macro_rules! failure {
    // Single string version
    ($msg:expr) => {
        crate::Error::Error($msg.to_string())
    };

    // Format string with arguments version
    ($fmt:expr, $($arg:tt)*) => {
        crate::Error::Error(format!($fmt, $($arg)*))
    };
}

/// The generic Error type, which provides coverage for all errors this library can potentially
/// return.
///
/// The first five variants form the status taxonomy of the virtual machine boundary: every
/// operation a thread can invoke through [`crate::Vm`] reports its failure as one of them.
/// The remaining variants cover the host side (poisoned critical sections, host I/O while
/// setting up a run, and free-form errors from the machine layer).
///
/// # Error Categories
///
/// ## Boundary Errors
/// - [`Error::InvalidParameter`] - Absent argument or a disallowed sentinel value
/// - [`Error::InvalidId`] - Identifier outside of the live range
/// - [`Error::InvalidState`] - Operation illegal in the entity's current lifecycle state
/// - [`Error::Failure`] - Operation specific runtime failure (I/O error, mutex contention)
/// - [`Error::InsufficientResources`] - Stack budget exhausted
///
/// ## Host Errors
/// - [`Error::LockError`] - The scheduler critical section was poisoned
/// - [`Error::Error`] - Miscellaneous failures of the machine layer
///
/// # Examples
///
/// ```rust,no_run
/// use tickvm::{Error, Vm};
///
/// fn try_lock(vm: &Vm, mutex: tickvm::MutexId) {
///     match vm.mutex_acquire(mutex, tickvm::Timeout::Immediate) {
///         Ok(()) => {}
///         Err(Error::Failure) => { /* somebody else holds it */ }
///         Err(e) => eprintln!("unexpected: {e}"),
///     }
/// }
/// ```
#[derive(Error, Debug)]
pub enum Error {
    /// Operation specific runtime failure.
    ///
    /// Returned when a file operation completes with a negative result, when an
    /// immediate mutex acquisition finds the mutex locked, when a finite mutex wait
    /// expires, and when `start` cannot load the requested program.
    #[error("Operation failed")]
    Failure,

    /// A required argument was absent or carried a disallowed value.
    ///
    /// Examples are an empty file name, a zero sized stack, the idle-only priority
    /// or the infinite timeout passed to `sleep`.
    #[error("Invalid parameter")]
    InvalidParameter,

    /// The identifier does not name a live thread or mutex.
    #[error("Invalid identifier")]
    InvalidId,

    /// The operation is illegal for the current lifecycle state of the entity.
    ///
    /// Deleting a thread that is not dead, activating a thread that is not dead,
    /// deleting a locked mutex or releasing a mutex the caller does not own all
    /// report this error.
    #[error("Invalid state")]
    InvalidState,

    /// The stack arena could not satisfy a reservation.
    #[error("Insufficient resources")]
    InsufficientResources,

    /// Failed to lock target.
    ///
    /// The scheduler critical section is a `std::sync::Mutex`; this error is
    /// returned when a thread panicked while holding it.
    #[error("Failed to lock target")]
    LockError,

    /// Generic error for miscellaneous failures.
    #[error("{0}")]
    Error(String),
}

impl Error {
    /// Returns the numeric status code of the raw interface.
    ///
    /// | Status | Code |
    /// |---|---|
    /// | Failure | 0 |
    /// | Success | 1 (not an error) |
    /// | InvalidParameter | 2 |
    /// | InvalidId | 3 |
    /// | InvalidState | 4 |
    /// | InsufficientResources | 5 |
    ///
    /// Host errors report as [`Error::Failure`].
    #[must_use]
    pub fn status(&self) -> u32 {
        match self {
            Error::InvalidParameter => 0x02,
            Error::InvalidId => 0x03,
            Error::InvalidState => 0x04,
            Error::InsufficientResources => 0x05,
            Error::Failure | Error::LockError | Error::Error(_) => 0x00,
        }
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        Error::LockError
    }
}

/// The status code reported for a successful boundary operation.
pub const STATUS_SUCCESS: u32 = 0x01;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(Error::Failure.status(), 0x00);
        assert_eq!(Error::InvalidParameter.status(), 0x02);
        assert_eq!(Error::InvalidId.status(), 0x03);
        assert_eq!(Error::InvalidState.status(), 0x04);
        assert_eq!(Error::InsufficientResources.status(), 0x05);
        assert_eq!(Error::LockError.status(), 0x00);
        assert_eq!(Error::Error("worker gone".to_string()).status(), 0x00);
        assert_ne!(STATUS_SUCCESS, Error::Failure.status());
    }

    #[test]
    fn test_failure_macro() {
        let err = failure!("context {} vanished", 7);
        assert_eq!(err.to_string(), "context 7 vanished");
    }
}
