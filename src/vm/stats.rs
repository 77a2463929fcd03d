//! Run statistics.

/// Counters collected by the scheduler during a run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VmStats {
    /// Number of context switches performed.
    pub context_switches: u64,
    /// Number of timer ticks processed.
    pub ticks: u64,
    /// Number of preemptions delivered to a running thread.
    pub preemptions: u64,
    /// Number of threads created, idle and main included.
    pub threads_created: u64,
    /// Number of file operations completed.
    pub io_completions: u64,
    /// Number of mutex waits that expired before ownership was granted.
    pub mutex_timeouts: u64,
}

impl VmStats {
    /// Creates zeroed statistics.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Resets every counter to zero.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
