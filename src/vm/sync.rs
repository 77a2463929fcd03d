//! Mutex state and priority-segmented wait queues.
//!
//! A mutex is either unlocked, or locked by exactly one owner. Threads that
//! block on a locked mutex queue at their own priority level; on release,
//! ownership passes directly to the head of the highest non-empty level, so
//! the mutex never becomes observably unlocked while somebody is waiting.
//!
//! These types only hold state. Putting waiters to sleep and waking the new
//! owner is the job of [`crate::vm::SchedulerCore`].
//!
//! # Example
//!
//! ```rust
//! use tickvm::vm::{MutexState, ThreadPriority};
//! use tickvm::ThreadId;
//!
//! let mut mutex = MutexState::default();
//! assert!(mutex.try_acquire(ThreadId(2)));
//! mutex.enqueue_waiter(ThreadId(3), ThreadPriority::Low);
//! mutex.enqueue_waiter(ThreadId(4), ThreadPriority::High);
//!
//! // The high priority waiter is granted ownership first.
//! assert_eq!(mutex.release(ThreadId(2)).unwrap(), Some(ThreadId(4)));
//! assert_eq!(mutex.owner(), ThreadId(4));
//! ```

use crate::{
    vm::{
        thread::{ReadyQueues, ThreadPriority},
        types::{MutexId, ThreadId},
    },
    Error, Result,
};

/// State of one mutex.
#[derive(Debug)]
pub struct MutexState {
    locked: bool,
    owner: ThreadId,
    /// Blocked acquirers, one FIFO per priority level.
    waiters: ReadyQueues,
}

impl Default for MutexState {
    fn default() -> Self {
        Self {
            locked: false,
            owner: ThreadId::INVALID,
            waiters: ReadyQueues::new(),
        }
    }
}

impl MutexState {
    /// Returns `true` while the mutex is held.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Returns the owner, or [`ThreadId::INVALID`] when unlocked.
    #[must_use]
    pub fn owner(&self) -> ThreadId {
        if self.locked {
            self.owner
        } else {
            ThreadId::INVALID
        }
    }

    /// Checks if the given thread owns this mutex.
    #[must_use]
    pub fn is_owner(&self, thread_id: ThreadId) -> bool {
        self.locked && self.owner == thread_id
    }

    /// Attempts to lock the mutex for `thread_id` without blocking.
    ///
    /// Returns `false` if the mutex is already locked, including by `thread_id`
    /// itself; mutexes are not reentrant.
    pub fn try_acquire(&mut self, thread_id: ThreadId) -> bool {
        if self.locked {
            return false;
        }
        self.locked = true;
        self.owner = thread_id;
        true
    }

    /// Queues a blocked acquirer at its priority level.
    pub fn enqueue_waiter(&mut self, thread_id: ThreadId, priority: ThreadPriority) {
        self.waiters.push(thread_id, priority);
    }

    /// Removes a waiter, e.g. after its wait timed out.
    pub fn remove_waiter(&mut self, thread_id: ThreadId) -> bool {
        self.waiters.remove(thread_id)
    }

    /// Returns `true` if `thread_id` is queued on this mutex.
    #[must_use]
    pub fn has_waiter(&self, thread_id: ThreadId) -> bool {
        self.waiters.contains(thread_id)
    }

    /// Iterates the waiters, highest priority first.
    pub fn waiters(&self) -> impl Iterator<Item = ThreadId> + '_ {
        self.waiters.iter()
    }

    /// Releases the mutex held by `thread_id`.
    ///
    /// # Returns
    ///
    /// The waiter that now owns the mutex, or `None` if nobody was waiting and
    /// the mutex is unlocked.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidState`] if the mutex is not locked by `thread_id`.
    pub fn release(&mut self, thread_id: ThreadId) -> Result<Option<ThreadId>> {
        if !self.is_owner(thread_id) {
            return Err(Error::InvalidState);
        }
        Ok(self.hand_over())
    }

    /// Releases the mutex on behalf of a terminated owner.
    ///
    /// Behaves like [`MutexState::release`] without the ownership check.
    pub fn abandon(&mut self) -> Option<ThreadId> {
        if !self.locked {
            return None;
        }
        self.hand_over()
    }

    fn hand_over(&mut self) -> Option<ThreadId> {
        match self.waiters.pop_highest() {
            Some(next) => {
                self.owner = next;
                Some(next)
            }
            None => {
                self.locked = false;
                self.owner = ThreadId::INVALID;
                None
            }
        }
    }
}

/// Owner of every [`MutexState`], indexed by [`MutexId`].
#[derive(Debug, Default)]
pub struct MutexTable {
    slots: Vec<Option<MutexState>>,
}

impl MutexTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an unlocked mutex.
    pub fn create(&mut self) -> MutexId {
        let id = MutexId(self.slots.len() as u32);
        self.slots.push(Some(MutexState::default()));
        id
    }

    /// Deletes an unlocked mutex.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidId`] if `id` does not name a live mutex
    /// - [`Error::InvalidState`] if the mutex is locked
    pub fn delete(&mut self, id: MutexId) -> Result<()> {
        let slot = self.slots.get_mut(id.index()).ok_or(Error::InvalidId)?;
        match slot {
            None => Err(Error::InvalidId),
            Some(state) if state.is_locked() => Err(Error::InvalidState),
            Some(_) => {
                *slot = None;
                Ok(())
            }
        }
    }

    /// Looks up a live mutex.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidId`] if `id` does not name a live mutex.
    pub fn get(&self, id: MutexId) -> Result<&MutexState> {
        self.slots
            .get(id.index())
            .and_then(Option::as_ref)
            .ok_or(Error::InvalidId)
    }

    /// Looks up a live mutex mutably.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidId`] if `id` does not name a live mutex.
    pub fn get_mut(&mut self, id: MutexId) -> Result<&mut MutexState> {
        self.slots
            .get_mut(id.index())
            .and_then(Option::as_mut)
            .ok_or(Error::InvalidId)
    }

    /// Identifiers of the mutexes currently owned by `thread_id`.
    #[must_use]
    pub fn owned_by(&self, thread_id: ThreadId) -> Vec<MutexId> {
        self.iter()
            .filter(|(_, state)| state.is_owner(thread_id))
            .map(|(id, _)| id)
            .collect()
    }

    /// Iterates over all live mutexes.
    pub fn iter(&self) -> impl Iterator<Item = (MutexId, &MutexState)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| slot.as_ref().map(|state| (MutexId(index as u32), state)))
    }
}
