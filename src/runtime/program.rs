//! Named program entries a virtual machine can start.

use std::collections::BTreeMap;

use crate::{runtime::Vm, Result};

/// Entry point of a program, run on the main thread with the start arguments.
///
/// `args[0]` is the program name itself.
pub type ProgramEntry = fn(&Vm, &[String]) -> Result<()>;

/// A registered program.
#[derive(Clone, Debug)]
pub struct Program {
    /// Name used to start the program.
    pub name: String,
    /// One-line description shown by front ends.
    pub description: String,
    /// Entry point.
    pub entry: ProgramEntry,
}

/// Lookup table from program names to entries.
///
/// # Examples
///
/// ```rust
/// use tickvm::{ProgramRegistry, Vm};
///
/// fn hello(_vm: &Vm, _args: &[String]) -> tickvm::Result<()> {
///     Ok(())
/// }
///
/// let mut registry = ProgramRegistry::new();
/// registry.register("hello", "Prints a greeting", hello);
/// assert!(registry.get("hello").is_some());
/// assert!(registry.get("missing").is_none());
/// ```
#[derive(Clone, Debug, Default)]
pub struct ProgramRegistry {
    programs: BTreeMap<String, Program>,
}

impl ProgramRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `entry` under `name`, replacing any previous program of that name.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        description: impl Into<String>,
        entry: ProgramEntry,
    ) -> &mut Self {
        let name = name.into();
        self.programs.insert(
            name.clone(),
            Program {
                name,
                description: description.into(),
                entry,
            },
        );
        self
    }

    /// Looks up a program by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Program> {
        self.programs.get(name)
    }

    /// Iterates the programs in name order.
    pub fn iter(&self) -> impl Iterator<Item = &Program> {
        self.programs.values()
    }

    /// Number of registered programs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.programs.len()
    }

    /// Returns `true` if no program is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.programs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn first(_vm: &Vm, _args: &[String]) -> Result<()> {
        Ok(())
    }

    fn second(_vm: &Vm, _args: &[String]) -> Result<()> {
        Err(crate::Error::Failure)
    }

    #[test]
    fn test_register_and_iterate_in_order() {
        let mut registry = ProgramRegistry::new();
        registry
            .register("zeta", "last", first)
            .register("alpha", "first", second);

        let names: Vec<_> = registry.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get("alpha").unwrap().description, "first");
    }

    #[test]
    fn test_register_replaces() {
        let mut registry = ProgramRegistry::new();
        registry.register("demo", "old", first);
        registry.register("demo", "new", second);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("demo").unwrap().description, "new");
    }
}
