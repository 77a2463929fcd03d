//! Built-in programs the command line can start.
//!
//! Each program is a [`tickvm::ProgramEntry`] running on the main thread of a
//! fresh virtual machine. `args[0]` is the program name.

mod file;
mod hello;
mod mutex;
mod preempt;
mod sleep;
mod threads;

use std::str::FromStr;

use tickvm::{Error, ProgramRegistry, Result};

/// Registry of every built-in program.
pub fn registry() -> ProgramRegistry {
    let mut registry = ProgramRegistry::new();
    registry
        .register("hello", "Print a greeting and the program arguments", hello::main)
        .register("sleep", "Sleep for N ticks (default 10) and report the clock", sleep::main)
        .register(
            "threads",
            "Start threads at every priority and show the order they run in",
            threads::main,
        )
        .register(
            "preempt",
            "Two busy threads of equal priority rotated by timer ticks",
            preempt::main,
        )
        .register(
            "mutex",
            "Threads of mixed priority contending for one mutex",
            mutex::main,
        )
        .register(
            "file",
            "Copy FILE to DEST, or print FILE when no destination is given",
            file::main,
        );
    registry
}

/// Parses `args[index]`, falling back to `default` when absent.
fn arg_or<T: FromStr>(args: &[String], index: usize, default: T) -> Result<T> {
    match args.get(index) {
        Some(raw) => raw.parse().map_err(|_| Error::InvalidParameter),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_contents() {
        let registry = registry();
        let names: Vec<_> = registry.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["file", "hello", "mutex", "preempt", "sleep", "threads"]
        );
    }

    #[test]
    fn test_arg_or() {
        let args = vec!["sleep".to_string(), "5".to_string(), "x".to_string()];
        assert_eq!(arg_or(&args, 1, 10u32).unwrap(), 5);
        assert_eq!(arg_or(&args, 3, 10u32).unwrap(), 10);
        assert!(matches!(arg_or(&args, 2, 10u32), Err(Error::InvalidParameter)));
    }
}
