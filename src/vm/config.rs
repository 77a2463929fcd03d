//! Virtual machine configuration.
//!
//! [`VmConfig`] collects the knobs of a run: the tick interval of the alarm
//! source, stack sizing and the resource limits enforced by the thread table.
//!
//! # Presets
//!
//! | Preset | Tick | Use |
//! |---|---|---|
//! | [`VmConfig::default`] | 10 ms | Interactive programs |
//! | [`VmConfig::responsive`] | 1 ms | Tests and latency sensitive demos |
//! | [`VmConfig::coarse`] | 100 ms | Observing scheduling decisions by eye |
//!
//! Presets can be combined with struct update syntax:
//!
//! ```rust
//! use tickvm::VmConfig;
//!
//! let config = VmConfig {
//!     max_threads: 8,
//!     ..VmConfig::responsive()
//! };
//! assert_eq!(config.tick_ms, 1);
//! ```

/// Smallest stack an execution context is started with, whatever was reserved.
pub const MIN_CONTEXT_STACK: usize = 64 * 1024;

/// Configuration of a virtual machine run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VmConfig {
    /// Interval between two timer ticks, in milliseconds.
    pub tick_ms: u32,

    /// Stack reserved for the main thread.
    pub main_stack_size: usize,

    /// Stack reserved for the idle thread.
    pub idle_stack_size: usize,

    /// Total bytes of stack the arena may hand out.
    ///
    /// Thread creation fails with `InsufficientResources` beyond this budget.
    pub stack_budget: usize,

    /// Maximum number of live threads, idle and main included.
    pub max_threads: usize,

    /// Name prefix of the OS threads backing execution contexts.
    pub context_name: String,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            tick_ms: 10,
            main_stack_size: 1024 * 1024,
            idle_stack_size: MIN_CONTEXT_STACK,
            stack_budget: 256 * 1024 * 1024,
            max_threads: 1024,
            context_name: "tickvm".to_string(),
        }
    }
}

impl VmConfig {
    /// One millisecond ticks.
    #[must_use]
    pub fn responsive() -> Self {
        Self {
            tick_ms: 1,
            ..Self::default()
        }
    }

    /// One hundred millisecond ticks.
    #[must_use]
    pub fn coarse() -> Self {
        Self {
            tick_ms: 100,
            ..Self::default()
        }
    }

    /// Sets the tick interval.
    #[must_use]
    pub fn with_tick_ms(mut self, tick_ms: u32) -> Self {
        self.tick_ms = tick_ms;
        self
    }

    /// Sets the total stack budget.
    #[must_use]
    pub fn with_stack_budget(mut self, bytes: usize) -> Self {
        self.stack_budget = bytes;
        self
    }

    /// Sets the maximum number of live threads.
    #[must_use]
    pub fn with_max_threads(mut self, max: usize) -> Self {
        self.max_threads = max;
        self
    }

    /// Sets the stack reserved for the main thread.
    #[must_use]
    pub fn with_main_stack_size(mut self, bytes: usize) -> Self {
        self.main_stack_size = bytes;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets() {
        assert_eq!(VmConfig::default().tick_ms, 10);
        assert_eq!(VmConfig::responsive().tick_ms, 1);
        assert_eq!(VmConfig::coarse().tick_ms, 100);
        assert_eq!(
            VmConfig::responsive().stack_budget,
            VmConfig::default().stack_budget
        );
    }

    #[test]
    fn test_builder_methods() {
        let config = VmConfig::default()
            .with_tick_ms(5)
            .with_stack_budget(4096)
            .with_max_threads(3)
            .with_main_stack_size(2048);
        assert_eq!(config.tick_ms, 5);
        assert_eq!(config.stack_budget, 4096);
        assert_eq!(config.max_threads, 3);
        assert_eq!(config.main_stack_size, 2048);
    }
}
