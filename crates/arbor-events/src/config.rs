use arbor_core::{ArborError, ArborResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tuning knobs for the [`EventBus`](crate::EventBus).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusConfig {
    /// Per-subscription queue length. A full queue makes publishers wait.
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,
    /// Retries after the first failed handler attempt.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Fixed delay between handler attempts.
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,
    /// How long `close` waits for queues to drain before cancelling.
    #[serde(default = "default_close_timeout_ms")]
    pub close_timeout_ms: u64,
}

fn default_buffer_capacity() -> usize {
    1024
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_interval_ms() -> u64 {
    1000
}

fn default_close_timeout_ms() -> u64 {
    5000
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: default_buffer_capacity(),
            max_retries: default_max_retries(),
            retry_interval_ms: default_retry_interval_ms(),
            close_timeout_ms: default_close_timeout_ms(),
        }
    }
}

impl BusConfig {
    /// Reject values the bus cannot run with.
    pub fn validate(&self) -> ArborResult<()> {
        if self.buffer_capacity == 0 {
            return Err(ArborError::Config(
                "bus.buffer_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Delay between handler attempts.
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    /// Drain deadline for `close`.
    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }
}
