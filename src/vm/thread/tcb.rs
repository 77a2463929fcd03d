//! Thread control blocks and the thread table that owns them.
//!
//! The [`ThreadTable`] is the single source of truth for thread metadata. Every
//! other component refers to threads by [`ThreadId`] only. Slots are indexed by
//! id; deleting a thread leaves its slot vacant so identifiers are never reused.

use std::{fmt, sync::Arc};

use crate::{
    vm::{
        thread::{stack::StackRegion, ThreadPriority, ThreadState},
        types::{ThreadId, Tick},
    },
    Error, Result, Vm,
};

/// Entry function of a virtual machine thread.
///
/// The entry is shared rather than consumed so a thread can be activated again
/// after it terminated. Arguments are captured by the closure.
pub type ThreadEntry = Arc<dyn Fn(&Vm) -> Result<()> + Send + Sync>;

/// Per-thread scheduling metadata.
pub struct ThreadControlBlock {
    id: ThreadId,
    state: ThreadState,
    priority: ThreadPriority,
    entry: ThreadEntry,
    stack: StackRegion,
    /// Remaining ticks of a timed sleep.
    pub(crate) sleep_countdown: Tick,
    /// Remaining ticks of a mutex wait, `None` while waiting forever.
    pub(crate) mutex_wait: Option<Tick>,
    /// Result slot of the last completed file operation.
    pub(crate) io_result: Option<i32>,
    activations: u32,
}

impl fmt::Debug for ThreadControlBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadControlBlock")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("priority", &self.priority)
            .field("stack", &self.stack)
            .field("sleep_countdown", &self.sleep_countdown)
            .field("mutex_wait", &self.mutex_wait)
            .field("io_result", &self.io_result)
            .field("activations", &self.activations)
            .finish_non_exhaustive()
    }
}

impl ThreadControlBlock {
    /// Creates a control block in the [`ThreadState::Dead`] state.
    #[must_use]
    pub fn new(
        id: ThreadId,
        entry: ThreadEntry,
        stack: StackRegion,
        priority: ThreadPriority,
    ) -> Self {
        Self {
            id,
            state: ThreadState::Dead,
            priority,
            entry,
            stack,
            sleep_countdown: 0,
            mutex_wait: None,
            io_result: None,
            activations: 0,
        }
    }

    /// Returns the thread's identifier.
    #[must_use]
    pub fn id(&self) -> ThreadId {
        self.id
    }

    /// Returns the current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ThreadState {
        self.state
    }

    /// Sets the lifecycle state.
    pub fn set_state(&mut self, state: ThreadState) {
        self.state = state;
    }

    /// Returns the scheduling priority.
    #[must_use]
    pub fn priority(&self) -> ThreadPriority {
        self.priority
    }

    /// Returns the entry function.
    #[must_use]
    pub fn entry(&self) -> &ThreadEntry {
        &self.entry
    }

    /// Returns the stack reservation.
    #[must_use]
    pub fn stack(&self) -> StackRegion {
        self.stack
    }

    /// Number of times this thread has been activated.
    #[must_use]
    pub fn activations(&self) -> u32 {
        self.activations
    }

    pub(crate) fn record_activation(&mut self) {
        self.activations += 1;
        self.sleep_countdown = 0;
        self.mutex_wait = None;
        self.io_result = None;
    }
}

/// Owner of every [`ThreadControlBlock`].
#[derive(Debug, Default)]
pub struct ThreadTable {
    slots: Vec<Option<ThreadControlBlock>>,
}

impl ThreadTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Identifier the next inserted thread will receive.
    #[must_use]
    pub fn next_id(&self) -> ThreadId {
        // Bounded by the stack budget long before u32 overflows.
        ThreadId(self.slots.len() as u32)
    }

    /// Stores a control block built for [`ThreadTable::next_id`].
    pub fn insert(&mut self, tcb: ThreadControlBlock) -> ThreadId {
        debug_assert_eq!(tcb.id(), self.next_id());
        let id = tcb.id();
        self.slots.push(Some(tcb));
        id
    }

    /// Looks up a live thread.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidId`] if the id was never handed out or has been deleted.
    pub fn get(&self, id: ThreadId) -> Result<&ThreadControlBlock> {
        self.slots
            .get(id.index())
            .and_then(Option::as_ref)
            .ok_or(Error::InvalidId)
    }

    /// Looks up a live thread mutably.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidId`] if the id was never handed out or has been deleted.
    pub fn get_mut(&mut self, id: ThreadId) -> Result<&mut ThreadControlBlock> {
        self.slots
            .get_mut(id.index())
            .and_then(Option::as_mut)
            .ok_or(Error::InvalidId)
    }

    /// Removes a thread, leaving its slot vacant.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidId`] if the id does not name a live thread.
    pub fn remove(&mut self, id: ThreadId) -> Result<ThreadControlBlock> {
        self.slots
            .get_mut(id.index())
            .and_then(Option::take)
            .ok_or(Error::InvalidId)
    }

    /// Number of live (not deleted) threads, dead ones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    /// Returns `true` if the table holds no thread.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterates over all live control blocks in id order.
    pub fn iter(&self) -> impl Iterator<Item = &ThreadControlBlock> {
        self.slots.iter().flatten()
    }

    /// Iterates mutably over all live control blocks in id order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ThreadControlBlock> {
        self.slots.iter_mut().flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::thread::stack::StackArena;

    fn noop() -> ThreadEntry {
        Arc::new(|_: &Vm| Ok(()))
    }

    #[test]
    fn test_insert_assigns_sequential_ids() {
        let mut arena = StackArena::new(1 << 20);
        let mut table = ThreadTable::new();

        for expected in 0..3 {
            let id = table.next_id();
            let stack = arena.reserve(id, 4096).unwrap();
            let tcb = ThreadControlBlock::new(id, noop(), stack, ThreadPriority::Normal);
            assert_eq!(table.insert(tcb), ThreadId(expected));
        }
        assert_eq!(table.len(), 3);
        assert!(table.get(ThreadId(2)).unwrap().state().is_dead());
    }

    #[test]
    fn test_removed_slot_stays_vacant() {
        let mut arena = StackArena::new(1 << 20);
        let mut table = ThreadTable::new();
        let id = table.next_id();
        let stack = arena.reserve(id, 4096).unwrap();
        table.insert(ThreadControlBlock::new(id, noop(), stack, ThreadPriority::Low));

        assert!(table.remove(id).is_ok());
        assert!(matches!(table.get(id), Err(Error::InvalidId)));
        assert!(matches!(table.remove(id), Err(Error::InvalidId)));
        assert_eq!(table.next_id(), ThreadId(1));
        assert!(table.is_empty());
    }
}
