//! Stack arena indexed by thread id.
//!
//! Every thread reserves a stack size when it is created, fixed for the
//! lifetime of the thread. The arena only accounts for these reservations
//! against a total byte budget, so that stack exhaustion surfaces as
//! [`Error::InsufficientResources`] instead of an allocation abort. It owns no
//! memory: each activation spawns a backing OS thread whose stack is sized to
//! the reservation, raised to at least
//! [`MIN_CONTEXT_STACK`](crate::vm::MIN_CONTEXT_STACK).

use crate::{vm::types::ThreadId, Error, Result};

/// A stack region reserved for one thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StackRegion {
    size: usize,
}

impl StackRegion {
    /// Size of the region in bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }
}

/// Arena of stack reservations, one slot per thread id.
#[derive(Debug)]
pub struct StackArena {
    slots: Vec<Option<StackRegion>>,
    reserved: usize,
    budget: usize,
}

impl StackArena {
    /// Creates an arena that hands out at most `budget` bytes in total.
    #[must_use]
    pub fn new(budget: usize) -> Self {
        Self {
            slots: Vec::new(),
            reserved: 0,
            budget,
        }
    }

    /// Reserves `size` bytes for `id`.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidParameter`] if `size` is zero
    /// - [`Error::InvalidState`] if `id` already holds a region
    /// - [`Error::InsufficientResources`] if the budget would be exceeded
    pub fn reserve(&mut self, id: ThreadId, size: usize) -> Result<StackRegion> {
        if size == 0 {
            return Err(Error::InvalidParameter);
        }
        if self.region(id).is_some() {
            return Err(Error::InvalidState);
        }
        let total = self
            .reserved
            .checked_add(size)
            .ok_or(Error::InsufficientResources)?;
        if total > self.budget {
            return Err(Error::InsufficientResources);
        }

        if self.slots.len() <= id.index() {
            self.slots.resize(id.index() + 1, None);
        }
        let region = StackRegion { size };
        self.slots[id.index()] = Some(region);
        self.reserved = total;
        Ok(region)
    }

    /// Releases the region held by `id`, if any.
    pub fn release(&mut self, id: ThreadId) -> Option<StackRegion> {
        let region = self.slots.get_mut(id.index())?.take()?;
        self.reserved -= region.size;
        Some(region)
    }

    /// Returns the region held by `id`.
    #[must_use]
    pub fn region(&self, id: ThreadId) -> Option<StackRegion> {
        self.slots.get(id.index()).copied().flatten()
    }

    /// Bytes currently reserved.
    #[must_use]
    pub fn reserved(&self) -> usize {
        self.reserved
    }

    /// Total byte budget.
    #[must_use]
    pub fn budget(&self) -> usize {
        self.budget
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserve_and_release() {
        let mut arena = StackArena::new(1024);
        let region = arena.reserve(ThreadId(3), 512).unwrap();
        assert_eq!(region.size(), 512);
        assert_eq!(arena.region(ThreadId(3)), Some(region));
        assert_eq!(arena.region(ThreadId(2)), None);
        assert_eq!(arena.reserved(), 512);

        assert_eq!(arena.release(ThreadId(3)), Some(region));
        assert_eq!(arena.release(ThreadId(3)), None);
        assert_eq!(arena.reserved(), 0);
    }

    #[test]
    fn test_budget_exhaustion() {
        let mut arena = StackArena::new(1000);
        arena.reserve(ThreadId(0), 600).unwrap();
        assert!(matches!(
            arena.reserve(ThreadId(1), 600),
            Err(Error::InsufficientResources)
        ));
        arena.reserve(ThreadId(1), 400).unwrap();
    }

    #[test]
    fn test_invalid_reservations() {
        let mut arena = StackArena::new(1000);
        assert!(matches!(
            arena.reserve(ThreadId(0), 0),
            Err(Error::InvalidParameter)
        ));
        arena.reserve(ThreadId(0), 10).unwrap();
        assert!(matches!(
            arena.reserve(ThreadId(0), 10),
            Err(Error::InvalidState)
        ));
    }
}
