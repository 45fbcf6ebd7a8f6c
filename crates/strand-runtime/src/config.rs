//! Runtime configuration
//!
//! Compile-time defaults with runtime environment overrides.
//!
//! Environment variables (all optional):
//! - `STRAND_NUM_CONSUMERS` - number of worker threads
//! - `STRAND_STACK_SIZE` - per-fiber stack bytes (rounded up to a page)
//! - `STRAND_TIMER_SLOTS` - timer wheel slot count
//! - `STRAND_TIMER_TICK_MS` - timer wheel tick interval

use strand_core::env::env_get;
use strand_core::{FiberError, FiberResult};

/// Default per-fiber stack size: 256 KiB.
pub const DEFAULT_STACK_SIZE: usize = 256 * 1024;

/// Default timer wheel slot count.
pub const DEFAULT_TIMER_SLOTS: usize = 256;

/// Default timer wheel tick interval in milliseconds.
pub const DEFAULT_TIMER_TICK_MS: u64 = 100;

/// Runtime configuration with builder-style setters.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Number of worker threads (consumers)
    pub num_consumers: usize,
    /// Stack size per fiber in bytes, rounded up to a page at allocation
    pub stack_size: usize,
    /// Timer wheel slot count
    pub timer_slots: usize,
    /// Timer wheel tick interval in milliseconds
    pub timer_tick_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl RuntimeConfig {
    /// Hard defaults, no environment overrides. Useful in tests.
    pub fn new() -> Self {
        RuntimeConfig {
            num_consumers: default_consumers(),
            stack_size: DEFAULT_STACK_SIZE,
            timer_slots: DEFAULT_TIMER_SLOTS,
            timer_tick_ms: DEFAULT_TIMER_TICK_MS,
        }
    }

    /// Defaults with environment variable overrides applied.
    pub fn from_env() -> Self {
        RuntimeConfig {
            num_consumers: env_get("STRAND_NUM_CONSUMERS", default_consumers()),
            stack_size: env_get("STRAND_STACK_SIZE", DEFAULT_STACK_SIZE),
            timer_slots: env_get("STRAND_TIMER_SLOTS", DEFAULT_TIMER_SLOTS),
            timer_tick_ms: env_get("STRAND_TIMER_TICK_MS", DEFAULT_TIMER_TICK_MS),
        }
    }

    pub fn num_consumers(mut self, n: usize) -> Self {
        self.num_consumers = n;
        self
    }

    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = bytes;
        self
    }

    pub fn timer_slots(mut self, slots: usize) -> Self {
        self.timer_slots = slots;
        self
    }

    pub fn timer_tick_ms(mut self, ms: u64) -> Self {
        self.timer_tick_ms = ms;
        self
    }

    pub fn validate(&self) -> FiberResult<()> {
        if self.num_consumers == 0 {
            return Err(FiberError::InvalidConfig("num_consumers must be > 0"));
        }
        if self.num_consumers > 256 {
            return Err(FiberError::InvalidConfig("num_consumers must be <= 256"));
        }
        if self.stack_size < 16 * 1024 {
            return Err(FiberError::InvalidConfig("stack_size must be >= 16 KiB"));
        }
        if self.timer_slots == 0 {
            return Err(FiberError::InvalidConfig("timer_slots must be > 0"));
        }
        if self.timer_tick_ms == 0 {
            return Err(FiberError::InvalidConfig("timer_tick_ms must be > 0"));
        }
        Ok(())
    }
}

fn default_consumers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}
