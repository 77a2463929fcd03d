//! Identifiers, ticks and timeout sentinels shared by every part of the virtual machine.
//!
//! Raw values use `u32` encodings throughout, so that
//! `u32::MAX` doubles as the "invalid id" and "immediate" sentinel and `0` as the
//! "infinite" timeout.

use std::fmt;

/// Number of timer ticks.
pub type Tick = u32;

/// Raw sentinel for "wait forever".
pub const TIMEOUT_INFINITE: Tick = 0;

/// Raw sentinel for "do not wait at all".
pub const TIMEOUT_IMMEDIATE: Tick = Tick::MAX;

/// Unique identifier of a virtual machine thread.
///
/// Identifiers are handed out monotonically by the thread table and are never
/// reused within a run, even after the thread is deleted.
///
/// # Reserved Identifiers
///
/// - [`ThreadId::IDLE`] is the idle thread created at start
/// - [`ThreadId::MAIN`] runs the program entry
/// - [`ThreadId::INVALID`] denotes "no thread", e.g. the owner of an unlocked mutex
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(pub u32);

impl ThreadId {
    /// The idle thread, always present at priority `None`.
    pub const IDLE: ThreadId = ThreadId(0);

    /// The thread running the program entry.
    pub const MAIN: ThreadId = ThreadId(1);

    /// Sentinel for "no thread".
    pub const INVALID: ThreadId = ThreadId(u32::MAX);

    /// Creates a new thread ID with the given value.
    #[must_use]
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    /// Returns the raw numeric ID value.
    #[must_use]
    pub fn value(&self) -> u32 {
        self.0
    }

    /// Returns `true` unless this is [`ThreadId::INVALID`].
    #[must_use]
    pub fn is_valid(&self) -> bool {
        *self != Self::INVALID
    }

    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Thread({})", self.0)
    }
}

/// Unique identifier of a virtual machine mutex.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MutexId(pub u32);

impl MutexId {
    /// Sentinel for "no mutex".
    pub const INVALID: MutexId = MutexId(u32::MAX);

    /// Creates a new mutex ID with the given value.
    #[must_use]
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    /// Returns the raw numeric ID value.
    #[must_use]
    pub fn value(&self) -> u32 {
        self.0
    }

    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for MutexId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Mutex({})", self.0)
    }
}

/// How long a blocking operation may wait.
///
/// Converts losslessly from and to the raw `u32` boundary encoding, where `0` is
/// [`Timeout::Infinite`] and `u32::MAX` is [`Timeout::Immediate`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Timeout {
    /// Wait until the event happens.
    Infinite,
    /// Never wait; for `sleep` this yields to threads of equal priority.
    Immediate,
    /// Wait at most this many ticks. Always in `1..u32::MAX`.
    Ticks(Tick),
}

impl Timeout {
    /// Decodes a raw boundary value.
    #[must_use]
    pub fn from_raw(raw: Tick) -> Self {
        match raw {
            TIMEOUT_INFINITE => Timeout::Infinite,
            TIMEOUT_IMMEDIATE => Timeout::Immediate,
            ticks => Timeout::Ticks(ticks),
        }
    }

    /// Encodes this timeout as a raw boundary value.
    #[must_use]
    pub fn raw(&self) -> Tick {
        match self {
            Timeout::Infinite => TIMEOUT_INFINITE,
            Timeout::Immediate => TIMEOUT_IMMEDIATE,
            Timeout::Ticks(ticks) => *ticks,
        }
    }
}

impl From<Tick> for Timeout {
    fn from(raw: Tick) -> Self {
        Timeout::from_raw(raw)
    }
}
