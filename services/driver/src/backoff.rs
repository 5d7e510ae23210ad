//! Exponential backoff and bounded retry.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::debug;

/// Exponential backoff policy.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Base delay for first retry.
    pub base: Duration,

    /// Maximum delay.
    pub max: Duration,

    /// Jitter factor (0.0 to 1.0).
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            max: Duration::from_secs(30),
            jitter: 0.25,
        }
    }
}

impl BackoffPolicy {
    /// Calculate delay for the given attempt number (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let delay = self.base.as_millis() as f64 * 2.0_f64.powi(attempt.min(30) as i32);
        let delay = delay.min(self.max.as_millis() as f64);

        let jitter = rand_jitter(delay * self.jitter.clamp(0.0, 1.0));
        let final_delay = (delay + jitter).max(0.0);

        Duration::from_millis(final_delay as u64)
    }
}

fn rand_jitter(range: f64) -> f64 {
    if range <= 0.0 {
        return 0.0;
    }
    rand::rng().random_range(-range..=range)
}

/// The last error of a retry loop that ran out of attempts or hit an
/// error it must not retry.
#[derive(Debug)]
pub struct Exhausted<E> {
    pub attempts: u32,
    pub last: E,
}

/// Run `op` up to `max_attempts` times, sleeping per `policy` between
/// attempts while `retryable` accepts the error.
///
/// `op` receives the 1-based attempt number. On success returns the value
/// and the number of attempts it took.
pub async fn retry<T, E, F, Fut, R>(
    policy: &BackoffPolicy,
    max_attempts: u32,
    retryable: R,
    mut op: F,
) -> Result<(T, u32), Exhausted<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: Fn(&E) -> bool,
{
    let max_attempts = max_attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op(attempt).await {
            Ok(value) => return Ok((value, attempt)),
            Err(e) if attempt < max_attempts && retryable(&e) => {
                let delay = policy.delay(attempt - 1);
                debug!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Retrying after backoff"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                return Err(Exhausted {
                    attempts: attempt,
                    last: e,
                })
            }
        }
    }
}
