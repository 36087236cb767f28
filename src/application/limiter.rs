use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::Result;
use serde::Serialize;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::domain::errors::DomainError;

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const DEFAULT_MAX_TOKENS: usize = 2;
const DEFAULT_REFILL_RATE: Duration = Duration::from_secs(30);

/// Token-bucket limiter bounding concurrent engine invocations across the
/// process. At any instant at most `max_tokens` callers hold a token;
/// fairness is approximate.
pub struct Limiter {
    state: Mutex<LimiterState>,
    max_tokens: usize,
    refill_rate: Duration,
}

struct LimiterState {
    tokens: usize,
    last_refill: Instant,
    total_acquisitions: u64,
    total_wait: Duration,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct LimiterStats {
    pub available_tokens: usize,
    pub max_tokens: usize,
    pub total_acquisitions: u64,
    pub total_wait_ms: u64,
    pub average_wait_ms: u64,
}

impl Limiter {
    pub fn new(max_tokens: usize, refill_rate: Duration) -> Self {
        let max_tokens = if max_tokens == 0 {
            DEFAULT_MAX_TOKENS
        } else {
            max_tokens
        };
        let refill_rate = if refill_rate.is_zero() {
            DEFAULT_REFILL_RATE
        } else {
            refill_rate
        };
        Self::with_exact(max_tokens, refill_rate)
    }

    /// Builds a limiter without normalizing the configuration. A zero-token
    /// limiter never grants a token; acquisitions block until cancelled.
    pub fn with_exact(max_tokens: usize, refill_rate: Duration) -> Self {
        Self {
            state: Mutex::new(LimiterState {
                tokens: max_tokens,
                last_refill: Instant::now(),
                total_acquisitions: 0,
                total_wait: Duration::ZERO,
            }),
            max_tokens,
            refill_rate,
        }
    }

    /// Blocks until a token is free or the token is cancelled. Cancellation
    /// returns within one poll interval.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<()> {
        let start = Instant::now();
        loop {
            if self.try_acquire() {
                let waited = start.elapsed();
                if !waited.is_zero() {
                    let mut state = self.state.lock().expect("limiter state poisoned");
                    state.total_wait += waited;
                    drop(state);
                    debug!(wait_ms = waited.as_millis() as u64, "acquired limiter token after waiting");
                }
                return Ok(());
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(DomainError::Cancelled.into()),
                _ = sleep(POLL_INTERVAL) => {}
            }
        }
    }

    fn try_acquire(&self) -> bool {
        let mut state = self.state.lock().expect("limiter state poisoned");

        let elapsed = state.last_refill.elapsed();
        if !self.refill_rate.is_zero() {
            let to_add = (elapsed.as_nanos() / self.refill_rate.as_nanos().max(1)) as usize;
            if to_add > 0 {
                state.tokens = (state.tokens + to_add).min(self.max_tokens);
                state.last_refill = Instant::now();
            }
        }

        if state.tokens > 0 {
            state.tokens -= 1;
            state.total_acquisitions += 1;
            true
        } else {
            false
        }
    }

    /// Returns a token to the bucket, capped at `max_tokens`.
    pub fn release(&self) {
        let mut state = self.state.lock().expect("limiter state poisoned");
        if state.tokens < self.max_tokens {
            state.tokens += 1;
        }
    }

    pub fn stats(&self) -> LimiterStats {
        let state = self.state.lock().expect("limiter state poisoned");
        let average_wait_ms = if state.total_acquisitions > 0 {
            (state.total_wait.as_millis() as u64) / state.total_acquisitions
        } else {
            0
        };
        LimiterStats {
            available_tokens: state.tokens,
            max_tokens: self.max_tokens,
            total_acquisitions: state.total_acquisitions,
            total_wait_ms: state.total_wait.as_millis() as u64,
            average_wait_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn grants_up_to_max_tokens_without_waiting() {
        let limiter = Limiter::new(3, Duration::from_secs(60));
        let cancel = CancellationToken::new();
        for _ in 0..3 {
            limiter.acquire(&cancel).await.expect("token available");
        }
        assert_eq!(limiter.stats().available_tokens, 0);
        assert_eq!(limiter.stats().total_acquisitions, 3);
    }

    #[tokio::test]
    async fn outstanding_tokens_never_exceed_max() {
        let limiter = Arc::new(Limiter::new(2, Duration::from_secs(60)));
        let cancel = CancellationToken::new();

        limiter.acquire(&cancel).await.expect("first");
        limiter.acquire(&cancel).await.expect("second");

        // A third acquire must block until a release happens.
        let contender = {
            let limiter = limiter.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { limiter.acquire(&cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!contender.is_finished());

        limiter.release();
        contender
            .await
            .expect("join")
            .expect("acquire after release");
        assert_eq!(limiter.stats().available_tokens, 0);
    }

    #[tokio::test]
    async fn release_is_capped_at_max_tokens() {
        let limiter = Limiter::new(1, Duration::from_secs(60));
        limiter.release();
        limiter.release();
        assert_eq!(limiter.stats().available_tokens, 1);
    }

    #[tokio::test]
    async fn cancellation_returns_promptly() {
        let limiter = Arc::new(Limiter::with_exact(0, Duration::from_secs(3600)));
        let cancel = CancellationToken::new();

        let waiter = {
            let limiter = limiter.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { limiter.acquire(&cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(30)).await;
        let started = Instant::now();
        cancel.cancel();
        let result = waiter.await.expect("join");
        assert!(result.is_err());
        assert!(
            started.elapsed() < Duration::from_millis(200),
            "cancel should resolve within one poll interval"
        );
    }

    #[tokio::test]
    async fn refill_restores_tokens_over_time() {
        let limiter = Limiter::with_exact(1, Duration::from_millis(20));
        let cancel = CancellationToken::new();
        limiter.acquire(&cancel).await.expect("initial token");
        tokio::time::sleep(Duration::from_millis(60)).await;
        limiter.acquire(&cancel).await.expect("refilled token");
    }

    #[tokio::test]
    async fn zero_config_falls_back_to_defaults() {
        let limiter = Limiter::new(0, Duration::ZERO);
        assert_eq!(limiter.stats().max_tokens, 2);
    }
}
