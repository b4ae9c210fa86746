//! Exponential backoff for transient GitHub failures.

use std::future::Future;
use std::time::Duration;

use crate::errors::{GitHubError, GitHubResult};

/// Backoff policy applied inside the HTTP client.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts including the first one. `1` disables retries.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Tight delays without jitter, for tests against a local server.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            backoff_multiplier: 1.0,
            jitter: false,
        }
    }

    /// Delay before retry number `retry` (1-based). A server-provided
    /// `Retry-After` wins over the computed backoff but is still capped.
    pub fn delay_for_attempt(&self, retry: u32, retry_after: Option<Duration>) -> Duration {
        if let Some(requested) = retry_after {
            return requested.min(self.max_delay);
        }
        if retry == 0 {
            return Duration::ZERO;
        }

        let base = self.initial_delay.as_millis() as f64
            * self.backoff_multiplier.powi(retry as i32 - 1);
        let capped = base.min(self.max_delay.as_millis() as f64);
        let delay = if self.jitter {
            capped * (1.0 + jitter_fraction() * 0.25)
        } else {
            capped
        };
        Duration::from_millis(delay as u64)
    }
}

fn jitter_fraction() -> f64 {
    use std::time::SystemTime;
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    (nanos % 1000) as f64 / 1000.0
}

/// Run `op` until it succeeds, fails with an error that must not be re-sent
/// in place (permanent, not found, or a timeout), or the attempt budget is spent.
pub async fn retry_transient<T, F, Fut>(config: &RetryConfig, mut op: F) -> GitHubResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = GitHubResult<T>>,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.retries_in_loop() && attempt < max_attempts => {
                let delay = config.delay_for_attempt(attempt, err.retry_after);
                tracing::warn!(
                    operation = %err.operation,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "Transient GitHub failure, retrying: {}",
                    err.message
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(exhausted(err, attempt)),
        }
    }
}

fn exhausted(err: GitHubError, attempts: u32) -> GitHubError {
    if err.is_transient() && attempts > 1 {
        GitHubError {
            message: format!("{} (after {} attempts)", err.message, attempts),
            ..err
        }
    } else {
        err
    }
}
