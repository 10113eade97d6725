use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::Deserialize;
use tracing::warn;

use crate::error::GaplessErr;
use crate::error::Result;
use crate::error::SequenceRange;

const BACKOFF_FACTOR: f64 = 2.0;

/// Bounded exponential backoff with +/-10% jitter.
///
/// Each job builds its own policy; no retry state is shared between jobs.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u64,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(30),
        }
    }
}

/// `[retry]` table in `config.toml`.
#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
pub struct RetryToml {
    pub max_attempts: Option<u64>,
    pub base_delay_ms: Option<u64>,
    pub max_delay_secs: Option<u64>,
}

impl From<RetryToml> for RetryPolicy {
    fn from(toml: RetryToml) -> Self {
        let defaults = RetryPolicy::default();
        Self {
            max_attempts: toml.max_attempts.unwrap_or(defaults.max_attempts).max(1),
            base_delay: toml
                .base_delay_ms
                .map_or(defaults.base_delay, Duration::from_millis),
            max_delay: toml
                .max_delay_secs
                .map_or(defaults.max_delay, Duration::from_secs),
        }
    }
}

impl RetryPolicy {
    /// Delay before retrying after failed attempt number `attempt` (1-based).
    pub fn backoff(&self, attempt: u64) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let base = (self.base_delay.as_millis() as f64 * BACKOFF_FACTOR.powi(exponent))
            .min(self.max_delay.as_millis() as f64);
        let jitter = rand::rng().random_range(0.9..1.1);
        Duration::from_millis((base * jitter) as u64)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// attempt budget runs out.
    pub async fn run<T, F, Fut>(
        &self,
        operation: &'static str,
        range: SequenceRange,
        mut op: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0u64;
        loop {
            attempt += 1;
            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            if !err.is_retryable() {
                return Err(err);
            }
            if attempt >= max_attempts {
                warn!(
                    "{operation} for {range} failed on final attempt {attempt}/{max_attempts}: {err}"
                );
                return Err(GaplessErr::RetryLimit {
                    operation,
                    range,
                    attempts: attempt,
                    source: Box::new(err),
                });
            }
            let delay = self.backoff(attempt);
            warn!(
                "{operation} for {range} failed: {err}; retrying ({attempt}/{max_attempts} in {delay:?})..."
            );
            tokio::time::sleep(delay).await;
        }
    }
}
