use crate::error::WriteError;
use engine_config::RetryPolicy;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::warn;

/// Runs write operations under a target's retry policy.
///
/// Retryable failures (per [`WriteError::is_retryable`]) are re-attempted up
/// to `max_retries` times with exponential backoff and jitter; anything else
/// propagates immediately.
#[derive(Debug, Clone)]
pub struct RetryRunner {
    policy: RetryPolicy,
}

impl RetryRunner {
    pub fn new(policy: RetryPolicy) -> Self {
        RetryRunner { policy }
    }

    pub async fn run<F, Fut, T>(&self, mut op: F) -> Result<T, WriteError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, WriteError>>,
    {
        let mut attempt: u32 = 0;

        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if !err.is_retryable() => return Err(err),
                Err(err) => {
                    if attempt >= self.policy.max_retries {
                        return Err(WriteError::RetriesExhausted {
                            attempts: attempt + 1,
                            source: Box::new(err),
                        });
                    }

                    let delay = backoff_delay(&self.policy, attempt);
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient write failure, backing off"
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

/// `min(backoff_factor * 2^attempt + uniform(0, 1), max_delay)` seconds.
pub fn backoff_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let exponential = policy.backoff_factor * f64::powi(2.0, attempt.min(16) as i32);
    let jitter: f64 = rand::random();
    let seconds = (exponential + jitter).min(policy.max_delay.max(0.0));
    Duration::from_secs_f64(seconds.max(0.0))
}
