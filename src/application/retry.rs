use std::future::Future;
use std::time::Duration;

use anyhow::Result;
use rand::Rng;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::domain::errors::{classify_error, DomainError, ErrorClass};

const MIN_DELAY: Duration = Duration::from_millis(100);
const RETRY_AFTER_JITTER: f64 = 0.1;

/// Exponential-backoff configuration. Delay for attempt `n` (0-based) is
/// `min(initial * multiplier^n, max_delay)` perturbed by `jitter_fraction`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub jitter_fraction: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            jitter_fraction: 0.3,
        }
    }
}

pub struct Retrier {
    policy: RetryPolicy,
}

impl Retrier {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    /// Runs `op` until it succeeds, fails fatally, or retries are exhausted.
    /// Returns the value together with the number of retries performed.
    pub async fn run<T, F, Fut>(&self, cancel: &CancellationToken, mut op: F) -> Result<(T, u32)>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut last_err: Option<anyhow::Error> = None;

        for attempt in 0..=self.policy.max_retries {
            match op().await {
                Ok(value) => return Ok((value, attempt)),
                Err(err) => {
                    if classify_error(&err) == ErrorClass::Fatal {
                        debug!(attempt = attempt + 1, error = %err, "non-retryable error, stopping");
                        return Err(err);
                    }

                    if attempt == self.policy.max_retries {
                        last_err = Some(err);
                        break;
                    }

                    let delay = self.delay_for(attempt, &err);
                    warn!(
                        attempt = attempt + 1,
                        max_retries = self.policy.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying after error"
                    );
                    last_err = Some(err);

                    tokio::select! {
                        _ = cancel.cancelled() => return Err(DomainError::Cancelled.into()),
                        _ = sleep(delay) => {}
                    }
                }
            }
        }

        let last = last_err
            .map(|e| format!("{e:#}"))
            .unwrap_or_else(|| "retry operation failed".to_string());
        Err(DomainError::MaxRetriesExceeded {
            attempts: self.policy.max_retries + 1,
            last,
        }
        .into())
    }

    fn delay_for(&self, attempt: u32, err: &anyhow::Error) -> Duration {
        let mut rng = rand::thread_rng();

        // A retry-after hint from the upstream replaces the computed backoff.
        if let Some(hint) = extract_retry_after(&format!("{err:#}")) {
            let jitter = hint.mul_f64(rng.gen::<f64>() * RETRY_AFTER_JITTER);
            return hint + jitter;
        }

        let mut delay =
            self.policy.initial_delay.as_secs_f64() * self.policy.multiplier.powi(attempt as i32);
        delay = delay.min(self.policy.max_delay.as_secs_f64());

        let jitter_range = delay * self.policy.jitter_fraction;
        delay += rng.gen::<f64>() * 2.0 * jitter_range - jitter_range;

        Duration::from_secs_f64(delay).max(MIN_DELAY)
    }
}

/// Looks for "retry after 30s", "retry-after: 30" or "wait 30" hints in an
/// error message. Bare numbers are treated as seconds.
fn extract_retry_after(message: &str) -> Option<Duration> {
    let lower = message.to_ascii_lowercase();
    for pattern in ["retry after ", "retry-after: ", "retry-after:", "wait "] {
        let Some(idx) = lower.find(pattern) else {
            continue;
        };
        let tail = &lower[idx + pattern.len()..];
        if let Some(duration) = parse_duration_token(tail.split_whitespace().next().unwrap_or("")) {
            return Some(duration);
        }
    }
    None
}

fn parse_duration_token(token: &str) -> Option<Duration> {
    if token.is_empty() {
        return None;
    }
    let digits: String = token.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return None;
    }
    let value: u64 = digits.parse().ok()?;
    let unit = &token[digits.len()..];
    match unit {
        "ms" => Some(Duration::from_millis(value)),
        "m" | "min" => Some(Duration::from_secs(value * 60)),
        "" | "s" | "sec" | "secs" | "s." => Some(Duration::from_secs(value)),
        _ => Some(Duration::from_secs(value)),
    }
    .filter(|d| !d.is_zero())
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Instant;

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(50),
            multiplier: 2.0,
            jitter_fraction: 0.0,
        }
    }

    #[tokio::test]
    async fn succeeds_first_try_without_retries() {
        let retrier = Retrier::new(fast_policy(3));
        let cancel = CancellationToken::new();
        let (value, retries) = retrier
            .run(&cancel, || async { Ok::<_, anyhow::Error>(42) })
            .await
            .expect("success");
        assert_eq!(value, 42);
        assert_eq!(retries, 0);
    }

    #[tokio::test]
    async fn retries_transient_errors_then_succeeds() {
        let retrier = Retrier::new(fast_policy(3));
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));
        let calls_op = calls.clone();
        let (value, retries) = retrier
            .run(&cancel, move || {
                let calls = calls_op.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(anyhow!("429 rate limit"))
                    } else {
                        Ok("done")
                    }
                }
            })
            .await
            .expect("second attempt succeeds");
        assert_eq!(value, "done");
        assert_eq!(retries, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn fatal_errors_surface_immediately() {
        let retrier = Retrier::new(fast_policy(5));
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));
        let calls_op = calls.clone();
        let result: Result<((), u32)> = retrier
            .run(&cancel, move || {
                let calls = calls_op.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(anyhow!("pull request not found"))
                }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausted_retries_compose_final_error() {
        let retrier = Retrier::new(fast_policy(2));
        let cancel = CancellationToken::new();
        let result: Result<((), u32)> = retrier
            .run(&cancel, || async { Err(anyhow!("503 server error")) })
            .await;
        let err = result.err().expect("exhausted");
        let msg = format!("{err:#}");
        assert!(msg.contains("maximum retries exceeded"));
        assert!(msg.contains("503"));
    }

    #[tokio::test]
    async fn total_delay_stays_under_jittered_bound() {
        let policy = RetryPolicy {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(400),
            multiplier: 2.0,
            jitter_fraction: 0.3,
        };
        // Σ min(initial * mult^i, max) * (1 + jitter) for i in 0..3
        let bound_ms = (100.0 + 200.0 + 400.0) * 1.3 + 200.0; // scheduling slack
        let retrier = Retrier::new(policy);
        let cancel = CancellationToken::new();
        let started = Instant::now();
        let _: Result<((), u32)> = retrier
            .run(&cancel, || async { Err(anyhow!("connection reset")) })
            .await;
        assert!(
            started.elapsed() < Duration::from_millis(bound_ms as u64),
            "elapsed {:?} exceeded bound",
            started.elapsed()
        );
    }

    #[tokio::test]
    async fn cancellation_interrupts_backoff_sleep() {
        let retrier = Retrier::new(RetryPolicy {
            max_retries: 3,
            initial_delay: Duration::from_secs(10),
            ..RetryPolicy::default()
        });
        let cancel = CancellationToken::new();
        let cancel_in_op = cancel.clone();
        let started = Instant::now();
        let result: Result<((), u32)> = retrier
            .run(&cancel, move || {
                let cancel = cancel_in_op.clone();
                async move {
                    cancel.cancel();
                    Err(anyhow!("timeout"))
                }
            })
            .await;
        let err = result.err().expect("cancelled");
        assert!(crate::domain::errors::is_cancelled(&err));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn retry_after_hints_are_extracted() {
        assert_eq!(
            extract_retry_after("rate limited, retry after 30s"),
            Some(Duration::from_secs(30))
        );
        assert_eq!(
            extract_retry_after("upstream says Retry-After: 5"),
            Some(Duration::from_secs(5))
        );
        assert_eq!(
            extract_retry_after("please wait 2 seconds"),
            Some(Duration::from_secs(2))
        );
        assert_eq!(extract_retry_after("no hints here"), None);
    }

    #[test]
    fn minimum_delay_floor_applies() {
        let retrier = Retrier::new(RetryPolicy {
            max_retries: 1,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            multiplier: 1.0,
            jitter_fraction: 0.0,
        });
        let delay = retrier.delay_for(0, &anyhow!("429"));
        assert!(delay >= MIN_DELAY);
    }
}
