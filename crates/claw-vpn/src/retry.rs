//! Retry with exponential backoff until success or cancellation.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Backoff schedule.
#[derive(Debug, Clone)]
pub struct Backoff {
    /// Delay after the first failure.
    pub initial_delay: Duration,
    /// Upper bound for any delay.
    pub max_delay: Duration,
    /// Growth factor per attempt.
    pub multiplier: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
        }
    }
}

impl Backoff {
    /// Delay to wait after failed attempt number `attempt` (1-based).
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let millis = self.initial_delay.as_millis() as f64 * self.multiplier.powi(exponent);
        if !millis.is_finite() || millis >= self.max_delay.as_millis() as f64 {
            return self.max_delay;
        }
        Duration::from_millis(millis as u64).min(self.max_delay)
    }
}

/// Runs `op` until it succeeds, sleeping between attempts.
///
/// Returns `None` once `token` is cancelled, whether during an attempt or a
/// sleep. Every failure is logged with `what`.
pub async fn retry_with_backoff<T, E, F, Fut>(
    token: &CancellationToken,
    backoff: &Backoff,
    what: &str,
    mut op: F,
) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0u32;
    loop {
        attempt = attempt.saturating_add(1);
        let outcome = tokio::select! {
            () = token.cancelled() => return None,
            outcome = op() => outcome,
        };
        match outcome {
            Ok(value) => return Some(value),
            Err(e) => {
                let delay = backoff.delay_for_attempt(attempt);
                warn!(what, attempt, error = %e, retry_in = ?delay, "attempt failed");
                tokio::select! {
                    () = token.cancelled() => return None,
                    () = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}
