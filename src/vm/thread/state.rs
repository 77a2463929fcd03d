//! Thread lifecycle states, wait reasons and priorities.
//!
//! # State Transitions
//!
//! ```text
//! Dead --activate--> Ready --dispatch--> Running --terminate--> Dead
//!                      ^                   |  |
//!                      |    preempt/yield  |  | sleep / file I/O / mutex
//!                      +-------------------+  v
//!                      +------wake------- Waiting
//! ```
//!
//! `Dead` is both the initial and the terminal state. A dead thread can be
//! activated again, which builds a fresh execution context for it.

use strum::{Display, EnumCount, EnumIter, IntoEnumIterator};

use crate::vm::types::MutexId;

/// Thread execution state.
///
/// The numeric codes returned by [`ThreadState::code`] match the raw
/// state values (`DEAD=0`, `RUNNING=1`, `READY=2`, `WAITING=3`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ThreadState {
    /// Created but not activated, or terminated.
    #[default]
    Dead,

    /// Currently executing. At most one thread is in this state at a time.
    Running,

    /// Queued in the ready queue of its priority.
    Ready,

    /// Blocked; the [`WaitReason`] tells which event wakes it.
    Waiting(WaitReason),
}

impl ThreadState {
    /// Returns the raw numeric state code.
    #[must_use]
    pub fn code(&self) -> u32 {
        match self {
            ThreadState::Dead => 0x00,
            ThreadState::Running => 0x01,
            ThreadState::Ready => 0x02,
            ThreadState::Waiting(_) => 0x03,
        }
    }

    /// Returns `true` for [`ThreadState::Dead`].
    #[must_use]
    pub fn is_dead(&self) -> bool {
        matches!(self, ThreadState::Dead)
    }

    /// Returns `true` for any [`ThreadState::Waiting`] state.
    #[must_use]
    pub fn is_waiting(&self) -> bool {
        matches!(self, ThreadState::Waiting(_))
    }
}

/// Reason a thread is blocked in the [`ThreadState::Waiting`] state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitReason {
    /// Timed sleep; the countdown lives in the thread's control block.
    Sleep,

    /// Waiting for the file backend to complete the request with this ticket.
    ///
    /// Completions carrying another ticket are stale and ignored.
    Io {
        /// Ticket of the outstanding request.
        ticket: u64,
    },

    /// Queued on the wait queue of a mutex.
    Mutex(MutexId),
}

/// Thread priority levels for scheduling.
///
/// Higher priority threads are scheduled before lower priority threads.
/// Within the same priority level, threads are scheduled in FIFO order.
/// [`ThreadPriority::None`] is reserved for the idle thread.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Display, EnumCount, EnumIter,
)]
#[strum(serialize_all = "lowercase")]
pub enum ThreadPriority {
    /// Idle-only level, scheduled when nothing else is ready.
    None = 0,

    /// Lowest level available to client threads.
    Low = 1,

    /// Normal (default) scheduling priority. The main thread runs here.
    #[default]
    Normal = 2,

    /// Highest scheduling priority.
    High = 3,
}

impl ThreadPriority {
    /// Index of this level inside per-priority queue arrays.
    #[must_use]
    pub fn level(self) -> usize {
        self as usize
    }

    /// Decodes a raw boundary value (`0..=3`).
    #[must_use]
    pub fn from_raw(raw: u32) -> Option<Self> {
        Self::iter().find(|p| *p as u32 == raw)
    }

    /// Iterates every level from [`ThreadPriority::High`] down to [`ThreadPriority::None`].
    pub fn descending() -> impl Iterator<Item = ThreadPriority> {
        Self::iter().rev()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_order() {
        assert!(ThreadPriority::None < ThreadPriority::Low);
        assert!(ThreadPriority::Low < ThreadPriority::Normal);
        assert!(ThreadPriority::Normal < ThreadPriority::High);
        assert_eq!(ThreadPriority::COUNT, 4);

        let order: Vec<_> = ThreadPriority::descending().collect();
        assert_eq!(
            order,
            vec![
                ThreadPriority::High,
                ThreadPriority::Normal,
                ThreadPriority::Low,
                ThreadPriority::None
            ]
        );
    }

    #[test]
    fn test_priority_from_raw() {
        assert_eq!(ThreadPriority::from_raw(3), Some(ThreadPriority::High));
        assert_eq!(ThreadPriority::from_raw(0), Some(ThreadPriority::None));
        assert_eq!(ThreadPriority::from_raw(4), None);
        assert_eq!(ThreadPriority::Normal.to_string(), "normal");
    }

    #[test]
    fn test_state_codes() {
        assert_eq!(ThreadState::default(), ThreadState::Dead);
        assert_eq!(ThreadState::Running.code(), 1);
        assert_eq!(ThreadState::Ready.code(), 2);
        assert_eq!(ThreadState::Waiting(WaitReason::Sleep).code(), 3);
        assert!(ThreadState::Waiting(WaitReason::Io { ticket: 1 }).is_waiting());
    }
}
