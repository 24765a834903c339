//! Engine configuration.

use std::time::Duration;

use tcg_proto::params::DEFAULT_CAPACITY;

/// Receive retry budget for "pending" responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryConfig {
    /// Retries after the first receive
    pub retries: u32,
    /// Delay before each retry
    pub delay: Duration,
}

impl RetryConfig {
    /// Total receive attempts, first one included.
    pub const fn attempts(&self) -> u32 {
        self.retries + 1
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self { retries: 10, delay: Duration::from_millis(50) }
    }
}

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Pending-response retry budget
    pub retry: RetryConfig,
    /// Send and receive buffer size in bytes (three 512-byte blocks)
    pub buffer_size: usize,
    /// Seed of the host session id counter
    pub first_host_session_id: u64,
    /// Slots per scratch parameter list
    pub parameter_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            buffer_size: 3 * 512,
            first_host_session_id: 100,
            parameter_capacity: DEFAULT_CAPACITY,
        }
    }
}
