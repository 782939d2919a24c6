// kiln-net/src/retry.rs
use std::future::Future;
use std::time::Duration;

use kiln_common::error::{KilnError, Result};
use rand::Rng;
use tracing::{debug, warn};

const DEFAULT_ATTEMPTS: u32 = 3;
const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(500);
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(8);

/// Bounded exponential backoff with jitter for transient fetch failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
        }
    }
}

impl RetryPolicy {
    pub fn with_attempts(attempts: u32) -> Self {
        Self {
            attempts: attempts.max(1),
            ..Self::default()
        }
    }

    /// No waiting between attempts.
    pub fn immediate(attempts: u32) -> Self {
        Self {
            attempts: attempts.max(1),
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay before retry number `retry` (1-based): `base * 2^(retry-1)` plus up to 50% jitter,
    /// never more than `max_delay`.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1).min(16);
        let backoff = self.base_delay.saturating_mul(1u32 << exp).min(self.max_delay);
        let jitter_cap = (backoff.as_millis() / 2) as u64;
        let jitter = if jitter_cap == 0 {
            0
        } else {
            rand::rng().random_range(0..=jitter_cap)
        };
        (backoff + Duration::from_millis(jitter)).min(self.max_delay)
    }

    /// Runs `op` until it succeeds, fails permanently, or the attempts are used up.
    ///
    /// Only transient errors are retried. Exhaustion is reported as a fetch error for `url`;
    /// permanent errors are returned unchanged.
    pub async fn run<T, F, Fut>(
        &self,
        url: &str,
        mut on_retry: impl FnMut(u32, &KilnError),
        mut op: F,
    ) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = self.attempts.max(1);
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_transient() => {
                    debug!("Permanent failure fetching {}: {}", url, e);
                    return Err(e);
                }
                Err(e) if attempt >= attempts => {
                    warn!("Giving up on {} after {} attempt(s): {}", url, attempt, e);
                    return Err(KilnError::Fetch {
                        url: url.to_string(),
                        attempts: attempt,
                        reason: e.to_string(),
                    });
                }
                Err(e) => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        "Attempt {}/{} for {} failed: {}. Retrying in {:?}",
                        attempt, attempts, url, e, delay
                    );
                    on_retry(attempt, &e);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
