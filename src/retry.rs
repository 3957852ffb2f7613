//! Retry logic with exponential backoff
//!
//! A failed attempt is handed to the policy's classifier. Retryable
//! failures wait `base * multiplier^(attempt-1)` (capped at `max_delay`,
//! raised to the classifier's minimum) plus bounded random jitter;
//! anything else propagates at once. Exhausting the attempt budget
//! surfaces the last failure wrapped in [`Error::RetriesExhausted`].

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBackoff, ExponentialBuilder};
use rand::Rng;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use crate::config::RetryConfig;
use crate::{Error, Result};

/// What to do after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry, waiting at least `min_delay` before the next attempt
    Retry {
        /// Floor for the computed backoff delay
        min_delay: Duration,
    },
    /// Propagate the failure immediately
    Stop,
}

/// Pluggable failure classification
pub type Classifier = Arc<dyn Fn(&Error) -> RetryDecision + Send + Sync>;

/// Default classification: rate limits wait at least `rate_limit_min_delay`
/// (or the platform's `Retry-After`, whichever is longer), transient network
/// failures use the plain backoff, everything else stops.
#[must_use]
pub fn default_classifier(rate_limit_min_delay: Duration) -> Classifier {
    Arc::new(move |error: &Error| match error {
        Error::RateLimited { retry_after, .. } => RetryDecision::Retry {
            min_delay: retry_after.map_or(rate_limit_min_delay, |d| d.max(rate_limit_min_delay)),
        },
        Error::TransientNetworkFailure(_) => RetryDecision::Retry {
            min_delay: Duration::ZERO,
        },
        _ => RetryDecision::Stop,
    })
}

/// Retry policy configuration
#[derive(Clone)]
pub struct RetryPolicy {
    /// Maximum attempts, including the first one
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub base_delay: Duration,
    /// Cap for a single computed delay
    pub max_delay: Duration,
    /// Backoff multiplier
    pub multiplier: f64,
    /// Upper bound of the random jitter added to every delay
    pub jitter: Duration,
    /// Per-attempt timeout; an elapsed attempt counts as a transient failure
    pub attempt_timeout: Option<Duration>,
    classifier: Classifier,
}

impl RetryPolicy {
    /// Create from config
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the config is unusable.
    pub fn new(config: &RetryConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            max_attempts: config.max_attempts,
            base_delay: config.base_delay,
            max_delay: config.max_delay,
            multiplier: config.multiplier,
            jitter: config.jitter,
            attempt_timeout: None,
            classifier: default_classifier(config.rate_limit_min_delay),
        })
    }

    /// Policy that makes exactly one attempt
    #[must_use]
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            multiplier: 1.0,
            jitter: Duration::ZERO,
            attempt_timeout: None,
            classifier: default_classifier(Duration::ZERO),
        }
    }

    /// Replace the failure classifier
    #[must_use]
    pub fn with_classifier<F>(mut self, classifier: F) -> Self
    where
        F: Fn(&Error) -> RetryDecision + Send + Sync + 'static,
    {
        self.classifier = Arc::new(classifier);
        self
    }

    /// Bound every attempt by `limit`
    #[must_use]
    pub fn with_attempt_timeout(mut self, limit: Duration) -> Self {
        self.attempt_timeout = Some(limit);
        self
    }

    /// Classify a failure
    #[must_use]
    pub fn classify(&self, error: &Error) -> RetryDecision {
        (self.classifier)(error)
    }

    /// Create the exponential backoff schedule (no jitter; jitter is added
    /// per delay so its bound is independent of the delay size)
    #[allow(clippy::cast_possible_truncation)]
    fn create_backoff(&self) -> ExponentialBackoff {
        ExponentialBuilder::default()
            .with_min_delay(self.base_delay)
            .with_max_delay(self.max_delay)
            .with_factor(self.multiplier as f32)
            .with_max_times(self.max_attempts.saturating_sub(1) as usize)
            .build()
    }

    fn jitter(&self) -> Duration {
        let bound = u64::try_from(self.jitter.as_millis()).unwrap_or(u64::MAX);
        if bound == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::rng().random_range(0..=bound))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        let config = RetryConfig::default();
        Self {
            max_attempts: config.max_attempts,
            base_delay: config.base_delay,
            max_delay: config.max_delay,
            multiplier: config.multiplier,
            jitter: config.jitter,
            attempt_timeout: None,
            classifier: default_classifier(config.rate_limit_min_delay),
        }
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("base_delay", &self.base_delay)
            .field("max_delay", &self.max_delay)
            .field("multiplier", &self.multiplier)
            .field("jitter", &self.jitter)
            .field("attempt_timeout", &self.attempt_timeout)
            .finish_non_exhaustive()
    }
}

/// Successful result with retry accounting
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Retried<T> {
    /// Operation result
    pub value: T,
    /// Attempts made, including the successful one
    pub attempts: u32,
    /// Cumulative backoff wait
    pub waited: Duration,
}

/// Applies a [`RetryPolicy`] to single remote calls.
///
/// Holds no mutable state; one executor can be shared by any number of
/// concurrent callers.
#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    /// Create an executor for `policy`
    #[must_use]
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    /// The policy in use
    #[must_use]
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Execute `f` with retries
    ///
    /// # Errors
    ///
    /// Returns the first non-retryable failure as-is, or the last retryable
    /// failure wrapped in [`Error::RetriesExhausted`].
    pub async fn execute<F, Fut, T>(&self, operation: &str, f: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.execute_with_stats(operation, f)
            .await
            .map(|retried| retried.value)
    }

    /// Execute `f` with retries, reporting attempts and time waited
    ///
    /// # Errors
    ///
    /// Same as [`RetryExecutor::execute`].
    pub async fn execute_with_stats<F, Fut, T>(&self, operation: &str, mut f: F) -> Result<Retried<T>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let policy = &self.policy;
        let mut backoff = policy.create_backoff();
        let mut attempts = 0u32;
        let mut waited = Duration::ZERO;

        loop {
            attempts += 1;

            let outcome = match policy.attempt_timeout {
                Some(limit) => match timeout(limit, f()).await {
                    Ok(result) => result,
                    Err(_) => Err(Error::TransientNetworkFailure(format!(
                        "{operation} timed out after {}ms",
                        limit.as_millis()
                    ))),
                },
                None => f().await,
            };

            let error = match outcome {
                Ok(value) => {
                    return Ok(Retried {
                        value,
                        attempts,
                        waited,
                    });
                }
                Err(e) => e,
            };

            let RetryDecision::Retry { min_delay } = policy.classify(&error) else {
                debug!(operation, attempt = attempts, error = %error, "Non-retryable failure");
                return Err(error);
            };

            let next = if attempts >= policy.max_attempts {
                None
            } else {
                backoff.next()
            };
            let Some(computed) = next else {
                warn!(
                    operation,
                    attempts,
                    waited_ms = waited.as_millis(),
                    error = %error,
                    "Max retry attempts reached"
                );
                return Err(Error::RetriesExhausted {
                    operation: operation.to_string(),
                    attempts,
                    waited,
                    source: Box::new(error),
                });
            };

            let delay = computed.max(min_delay) + policy.jitter();
            debug!(
                operation,
                attempt = attempts,
                delay_ms = delay.as_millis(),
                error = %error,
                "Retrying after backoff"
            );
            sleep(delay).await;
            waited += delay;
        }
    }
}

/// Execute `f` under `policy` without keeping an executor around
///
/// # Errors
///
/// Same as [`RetryExecutor::execute`].
pub async fn retrying<F, Fut, T>(policy: &RetryPolicy, operation: &str, f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    RetryExecutor::new(policy.clone()).execute(operation, f).await
}
