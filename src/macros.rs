#![allow(unused_macros)]

/// Helper macro for entering the scheduler critical section
///
/// Poisoning is reported as [`crate::Error::LockError`] to the caller.
///
/// ```rust, ignore
///  let mut core = lock!(self.shared.core);
///  core.tick();
/// ```
macro_rules! lock {
    ($lock:expr) => {
        $lock.lock().map_err(|_| crate::Error::LockError)?
    };
}

/// Prints formatted text to the standard output descriptor of the virtual machine.
///
/// The write goes through [`crate::Vm::file_print`] and therefore blocks the calling
/// thread until the file backend completes it, letting other threads run meanwhile.
///
/// ```rust,no_run
/// use tickvm::{vm_print, Vm};
///
/// fn entry(vm: &Vm) -> tickvm::Result<()> {
///     vm_print!(vm, "hello from thread {}\n", vm.thread_id()?)?;
///     Ok(())
/// }
/// ```
#[macro_export]
macro_rules! vm_print {
    ($vm:expr, $($arg:tt)*) => {
        $vm.file_print(1, format_args!($($arg)*))
    };
}

/// Prints formatted text to the standard error descriptor of the virtual machine.
///
/// See [`vm_print!`] for details.
#[macro_export]
macro_rules! vm_print_error {
    ($vm:expr, $($arg:tt)*) => {
        $vm.file_print(2, format_args!($($arg)*))
    };
}
