use std::{future::Future, time::Duration};

use rand::{Rng, SeedableRng, rngs::SmallRng};
use tokio::time::sleep;
use tracing::warn;

/// Errors that know whether another attempt could succeed.
pub trait Transient {
    fn is_transient(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
        }
    }
}

impl RetryPolicy {
    /// Delay before the attempt following `attempt` (1-based): base, 2×base, 4×base…
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(1u32 << exponent)
    }

    fn jittered(&self, attempt: u32) -> Duration {
        let delay = self.backoff(attempt);
        let cap = (delay.as_millis() as u64 / 10).max(1);
        let jitter = SmallRng::from_os_rng().random_range(0..cap);
        delay + Duration::from_millis(jitter)
    }
}

/// Outcome of [`retry`]: the final result plus how many attempts it took.
#[derive(Debug)]
pub struct Retried<T, E> {
    pub result: Result<T, E>,
    pub attempts: u32,
}

/// Runs `op` until it succeeds, fails with a non-transient error, or the
/// policy's attempt ceiling is reached.
pub async fn retry<T, E, F, Fut>(policy: RetryPolicy, target: &'static str, mut op: F) -> Retried<T, E>
where
    E: Transient + std::fmt::Display,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => {
                return Retried {
                    result: Ok(value),
                    attempts: attempt,
                };
            }
            Err(err) if err.is_transient() && attempt < max_attempts => {
                let delay = policy.jittered(attempt);
                warn!(
                    target = "discovery.retry",
                    op = target,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "transient_failure_retrying"
                );
                sleep(delay).await;
                attempt += 1;
            }
            Err(err) => {
                return Retried {
                    result: Err(err),
                    attempts: attempt,
                };
            }
        }
    }
}
