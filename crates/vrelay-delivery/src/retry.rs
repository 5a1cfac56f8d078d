//! Retry policy with exponential backoff and jitter.
//!
//! A [`RetryPolicy`] is a plain value that wraps any fallible async call.
//! Which errors are worth another attempt is decided by an injected
//! [`RetryClassifier`], so the same policy serves HTTP calls and tests.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{info_span, warn, Instrument};

use crate::error::DeliveryError;
use crate::metrics::record_retry;

/// Outcome of classifying a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry,
    Fatal,
}

/// Decides whether an error is transient.
pub trait RetryClassifier<E> {
    fn classify(&self, error: &E) -> RetryDecision;
}

impl<E, F> RetryClassifier<E> for F
where
    F: Fn(&E) -> RetryDecision,
{
    fn classify(&self, error: &E) -> RetryDecision {
        self(error)
    }
}

/// Classifier for delivery calls: connection failures, timeouts and 5xx
/// responses are retried; 4xx and local errors are not.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeliveryClassifier;

impl RetryClassifier<DeliveryError> for DeliveryClassifier {
    fn classify(&self, error: &DeliveryError) -> RetryDecision {
        if error.is_retryable() {
            RetryDecision::Retry
        } else {
            RetryDecision::Fatal
        }
    }
}

/// Retry policy configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt; total calls are at most `max_retries + 1`.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
    /// Scale each delay by a uniform factor in `[0.5, 1.0]`
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_factor: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Policy tuned for multi-gigabyte transfers.
    pub fn upload() -> Self {
        Self {
            max_retries: 5,
            max_delay: Duration::from_secs(30),
            ..Self::default()
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    pub fn with_backoff_factor(mut self, factor: f64) -> Self {
        self.backoff_factor = factor;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Un-jittered delay before retry `attempt` (0-based):
    /// `min(base * factor^attempt, max)`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.base_delay.as_secs_f64() * self.backoff_factor.powi(exponent);
        Duration::try_from_secs_f64(secs)
            .map(|d| d.min(self.max_delay))
            .unwrap_or(self.max_delay)
    }

    /// Delay actually slept before retry `attempt`, never above [`Self::backoff`].
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = self.backoff(attempt);
        if self.jitter {
            delay.mul_f64(rand::rng().random_range(0.5..=1.0))
        } else {
            delay
        }
    }

    /// Run `op` until it succeeds, fails fatally, or the budget is spent.
    ///
    /// The error of the last attempt is returned unchanged.
    pub async fn run<T, E, C, F, Fut>(&self, classifier: &C, operation: &str, mut op: F) -> Result<T, E>
    where
        C: RetryClassifier<E> + ?Sized,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let mut attempt = 0;
        loop {
            let span = info_span!("retry", operation = %operation, attempt = attempt + 1);

            let error = match op().instrument(span).await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            if attempt >= self.max_retries || classifier.classify(&error) == RetryDecision::Fatal {
                return Err(error);
            }

            let delay = self.delay_for_attempt(attempt);
            warn!(
                operation = %operation,
                attempt = attempt + 1,
                max_attempts = self.max_retries + 1,
                delay_ms = delay.as_millis() as u64,
                "Attempt failed, retrying: {}",
                error
            );
            record_retry(operation);

            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}
