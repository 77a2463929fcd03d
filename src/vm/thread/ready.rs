//! Per-priority FIFO ready queues.
//!
//! The ready queue set is pure storage: one `VecDeque` per [`ThreadPriority`]
//! level, no reordering beyond insertion order. Policy lives in the scheduler.

use std::collections::VecDeque;

use strum::EnumCount;

use crate::vm::{thread::ThreadPriority, types::ThreadId};

/// One FIFO of runnable thread identifiers per priority level.
#[derive(Debug, Default)]
pub struct ReadyQueues {
    levels: [VecDeque<ThreadId>; ThreadPriority::COUNT],
}

impl ReadyQueues {
    /// Creates an empty queue set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `id` to the tail of the queue for `priority`.
    pub fn push(&mut self, id: ThreadId, priority: ThreadPriority) {
        self.levels[priority.level()].push_back(id);
    }

    /// Removes and returns the head of the highest non-empty level.
    pub fn pop_highest(&mut self) -> Option<ThreadId> {
        ThreadPriority::descending().find_map(|p| self.levels[p.level()].pop_front())
    }

    /// Removes and returns the head of exactly one level.
    pub fn pop_level(&mut self, priority: ThreadPriority) -> Option<ThreadId> {
        self.levels[priority.level()].pop_front()
    }

    /// Removes `id` from whichever level holds it.
    ///
    /// Returns `true` if the thread was queued.
    pub fn remove(&mut self, id: ThreadId) -> bool {
        for level in &mut self.levels {
            if let Some(pos) = level.iter().position(|queued| *queued == id) {
                level.remove(pos);
                return true;
            }
        }
        false
    }

    /// Returns `true` if `id` is queued at any level.
    #[must_use]
    pub fn contains(&self, id: ThreadId) -> bool {
        self.levels.iter().any(|level| level.contains(&id))
    }

    /// Number of threads queued at `priority`.
    #[must_use]
    pub fn len_at(&self, priority: ThreadPriority) -> usize {
        self.levels[priority.level()].len()
    }

    /// Total number of queued threads.
    #[must_use]
    pub fn len(&self) -> usize {
        self.levels.iter().map(VecDeque::len).sum()
    }

    /// Returns `true` if no thread is queued at any level.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.levels.iter().all(VecDeque::is_empty)
    }

    /// Iterates queued threads, highest level first, FIFO within a level.
    pub fn iter(&self) -> impl Iterator<Item = ThreadId> + '_ {
        ThreadPriority::descending().flat_map(move |p| self.levels[p.level()].iter().copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_highest_level_first() {
        let mut queues = ReadyQueues::new();
        queues.push(ThreadId(1), ThreadPriority::Low);
        queues.push(ThreadId(2), ThreadPriority::High);
        queues.push(ThreadId(3), ThreadPriority::None);

        assert_eq!(queues.pop_highest(), Some(ThreadId(2)));
        assert_eq!(queues.pop_highest(), Some(ThreadId(1)));
        assert_eq!(queues.pop_highest(), Some(ThreadId(3)));
        assert_eq!(queues.pop_highest(), None);
    }

    #[test]
    fn test_fifo_within_level() {
        let mut queues = ReadyQueues::new();
        for id in 4..8 {
            queues.push(ThreadId(id), ThreadPriority::Normal);
        }
        let order: Vec<_> = std::iter::from_fn(|| queues.pop_level(ThreadPriority::Normal)).collect();
        assert_eq!(order, vec![ThreadId(4), ThreadId(5), ThreadId(6), ThreadId(7)]);
    }

    #[test]
    fn test_remove() {
        let mut queues = ReadyQueues::new();
        queues.push(ThreadId(1), ThreadPriority::Normal);
        queues.push(ThreadId(2), ThreadPriority::Normal);

        assert!(queues.remove(ThreadId(1)));
        assert!(!queues.remove(ThreadId(1)));
        assert!(!queues.contains(ThreadId(1)));
        assert_eq!(queues.len_at(ThreadPriority::Normal), 1);
        assert_eq!(queues.iter().collect::<Vec<_>>(), vec![ThreadId(2)]);
    }
}
