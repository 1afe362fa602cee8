use crate::{FlowContext, FlowError};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_retry::strategy::{jitter, ExponentialBackoff};

/// Decides whether a failed batch goes back to `RETRYABLE`.
pub trait RetryPolicy: Send + Sync {
    fn should_retry(&self, error: &FlowError, contexts: &[FlowContext]) -> bool;

    /// Delay before re-admitting a batch on its `attempt`-th retry (1-based).
    fn delay(&self, attempt: u32) -> Duration;
}

/// Retry policy for node execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub delay_ms: u64,
    /// Rounded to a whole growth factor.
    #[serde(default = "default_multiplier")]
    pub backoff_multiplier: f64,
    /// Scales each delay by a random factor in `[0, 1)`.
    #[serde(default)]
    pub jitter: bool,
}

fn default_multiplier() -> f64 {
    1.0
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay_ms: 1000,
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    pub fn none() -> Self {
        Self {
            max_attempts: 0,
            delay_ms: 0,
            backoff_multiplier: 1.0,
            jitter: false,
        }
    }

    /// Delays for attempts `1..=max_attempts`: `delay_ms`, then growing by
    /// the backoff factor.
    pub fn strategy(&self) -> Box<dyn Iterator<Item = Duration> + Send> {
        let base = (self.backoff_multiplier.round().max(1.0)) as u64;
        let factor = (self.delay_ms / base).max(1);
        let backoff = ExponentialBackoff::from_millis(base)
            .factor(factor)
            .take(self.max_attempts as usize);
        if self.jitter {
            Box::new(backoff.map(jitter))
        } else {
            Box::new(backoff)
        }
    }
}

impl RetryPolicy for RetryConfig {
    fn should_retry(&self, error: &FlowError, contexts: &[FlowContext]) -> bool {
        error.is_retryable() && contexts.iter().all(|c| c.retry_count < self.max_attempts)
    }

    fn delay(&self, attempt: u32) -> Duration {
        if self.delay_ms == 0 {
            return Duration::ZERO;
        }
        self.strategy()
            .nth(attempt.saturating_sub(1) as usize)
            .unwrap_or_else(|| Duration::from_millis(self.delay_ms))
    }
}
