//! Sliding-window rate limiting and retry around any [`ModelProvider`].
//!
//! Every call first waits for a slot in a one-minute window holding at most `rpm_limit`
//! call timestamps. When the window is full the caller sleeps until the oldest call ages
//! out. Retryable [`ProviderError`]s are retried with exponential backoff; each retry takes
//! a fresh slot.
//!
//! ```rust
//! use cloudllm_lab::providers::rate_limited::RetryPolicy;
//! use std::time::Duration;
//!
//! let policy = RetryPolicy::default();
//! assert_eq!(policy.max_attempts, 3);
//! assert_eq!(policy.backoff_for(1), Duration::from_secs(2));
//! assert_eq!(policy.backoff_for(2), Duration::from_secs(4));
//! ```

use crate::lab::provider::{Completion, CompletionRequest, ModelProvider, ProviderError};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Exponential backoff settings for retryable provider errors.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one. 1 disables retries.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub multiplier: f64,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(2),
            multiplier: 2.0,
            max_backoff: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    pub fn no_retries() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before retry number `retry` (1-based).
    pub fn backoff_for(&self, retry: u32) -> Duration {
        let factor = self.multiplier.powi(retry.saturating_sub(1) as i32);
        let secs = self.initial_backoff.as_secs_f64() * factor;
        Duration::from_secs_f64(secs.min(self.max_backoff.as_secs_f64()))
    }
}

/// Wraps a provider with a per-provider RPM window and retries.
pub struct RateLimitedProvider<P: ModelProvider> {
    inner: P,
    rpm_limit: usize,
    window: Duration,
    calls: Mutex<VecDeque<Instant>>,
    retry: RetryPolicy,
}

impl<P: ModelProvider> RateLimitedProvider<P> {
    pub fn new(inner: P, rpm_limit: u32, retry: RetryPolicy) -> Self {
        Self {
            inner,
            rpm_limit: rpm_limit.max(1) as usize,
            window: Duration::from_secs(60),
            calls: Mutex::new(VecDeque::new()),
            retry,
        }
    }

    /// Shrink or grow the window; tests use a sub-second window.
    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    pub fn inner(&self) -> &P {
        &self.inner
    }

    /// Wait until a call is allowed, then record it.
    async fn acquire_slot(&self) {
        loop {
            let wait = {
                let mut calls = self.calls.lock().await;
                let now = Instant::now();
                while let Some(oldest) = calls.front() {
                    if now.duration_since(*oldest) >= self.window {
                        calls.pop_front();
                    } else {
                        break;
                    }
                }
                if calls.len() < self.rpm_limit {
                    calls.push_back(now);
                    return;
                }
                match calls.front() {
                    Some(oldest) => self.window.saturating_sub(now.duration_since(*oldest)),
                    None => Duration::ZERO,
                }
            };
            log::debug!("rate limit reached, waiting {:?}", wait);
            tokio::time::sleep(wait).await;
        }
    }
}

#[async_trait]
impl<P: ModelProvider> ModelProvider for RateLimitedProvider<P> {
    fn default_model(&self) -> &str {
        self.inner.default_model()
    }

    async fn complete(&self, request: CompletionRequest) -> Result<Completion, ProviderError> {
        let mut attempt = 1;
        loop {
            self.acquire_slot().await;
            match self.inner.complete(request.clone()).await {
                Ok(completion) => return Ok(completion),
                Err(err) if err.retryable && attempt < self.retry.max_attempts => {
                    let delay = self.retry.backoff_for(attempt);
                    log::warn!(
                        "{} attempt {}/{} failed ({}), retrying in {:?}",
                        request.model,
                        attempt,
                        self.retry.max_attempts,
                        err,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
