//! Bounded retry with exponential backoff and jitter
//!
//! Only errors classified as transient are retried. The delay before retry
//! `n` (n >= 1) is `base_delay * multiplier^(n-1)`, saturating at `max_delay`.
//! Jitter only stretches a delay upwards, by at most `factor` and never past
//! the next nominal delay, so a retry sequence stays non-decreasing and capped.

use crate::error::{QueryError, Result};
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Retry policy configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Delay before the first retry
    #[serde(with = "humantime_serde")]
    pub base_delay: Duration,
    /// Growth factor between consecutive delays
    pub multiplier: f64,
    /// Maximum delay between retries
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
    /// Jitter configuration
    pub jitter: JitterConfig,
    /// Deadline for a single attempt; a hung attempt becomes a `Timeout`
    #[serde(default, with = "humantime_serde")]
    pub attempt_timeout: Option<Duration>,
    /// Enable detailed logging
    pub detailed_logging: bool,
}

/// Jitter configuration for retry delays
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JitterConfig {
    pub enabled: bool,
    /// Largest upward stretch as a fraction of the delay (0.0 to 1.0)
    pub factor: f64,
}

impl Default for JitterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            factor: 0.2,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            multiplier: 2.0,
            max_delay: Duration::from_secs(10),
            jitter: JitterConfig::default(),
            attempt_timeout: None,
            detailed_logging: false,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry `retry` without jitter
    pub fn nominal_delay(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else if secs <= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    /// Delay before retry `retry`, jitter included
    pub fn calculate_delay(&self, retry: u32) -> Duration {
        let delay = self.nominal_delay(retry);
        if self.jitter.enabled && self.jitter.factor > 0.0 {
            self.apply_jitter(delay, self.nominal_delay(retry.saturating_add(1)))
        } else {
            delay
        }
    }

    /// Random point in `[delay, min(delay * (1 + factor), next)]`
    fn apply_jitter(&self, delay: Duration, next: Duration) -> Duration {
        let factor = self.jitter.factor.clamp(0.0, 1.0);
        let low = delay.as_secs_f64();
        let high = (low * (1.0 + factor)).min(next.as_secs_f64());
        if high <= low {
            return delay;
        }
        Duration::from_secs_f64(rand::thread_rng().gen_range(low..=high))
    }

    /// Check if error should be retried
    pub fn should_retry(&self, error: &QueryError) -> bool {
        error.is_retryable()
    }

    /// Total attempts including the first one
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

/// One scheduled retry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryAttempt {
    /// Retry number, starting at 1
    pub attempt: u32,
    #[serde(with = "humantime_serde")]
    pub delay: Duration,
    pub previous_error: String,
}

/// Retry statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetryStats {
    /// Total operations attempted
    pub total_operations: u64,
    /// Successful operations (no retry needed)
    pub successful_first_attempt: u64,
    /// Successful operations (after retry)
    pub successful_after_retry: u64,
    /// Failed operations (all retries exhausted)
    pub failed_after_retries: u64,
    /// Failed operations with a non-retryable error
    pub failed_fatal: u64,
    /// Total retry attempts
    pub total_retry_attempts: u64,
    /// Last retry timestamp
    pub last_retry: Option<DateTime<Utc>>,
    pub last_attempt: Option<RetryAttempt>,
}

/// Retry executor
pub struct RetryExecutor {
    policy: RetryPolicy,
    stats: RwLock<RetryStats>,
}

impl RetryExecutor {
    /// Create new retry executor
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            stats: RwLock::new(RetryStats::default()),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Execute operation with retry policy
    pub async fn execute<F, T, Fut>(&self, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.stats.write().await.total_operations += 1;

        let max_attempts = self.policy.max_attempts();
        let mut attempt = 0;

        loop {
            attempt += 1;

            if self.policy.detailed_logging && attempt > 1 {
                debug!("Retry attempt {} of {}", attempt, max_attempts);
            }

            let outcome = match self.policy.attempt_timeout {
                Some(limit) => match tokio::time::timeout(limit, operation()).await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(QueryError::timeout(format!(
                        "attempt {attempt} exceeded {limit:?}"
                    ))),
                },
                None => operation().await,
            };

            let error = match outcome {
                Ok(result) => {
                    let mut stats = self.stats.write().await;
                    if attempt == 1 {
                        stats.successful_first_attempt += 1;
                    } else {
                        stats.successful_after_retry += 1;
                        info!("Operation succeeded after {} attempts", attempt);
                    }
                    return Ok(result);
                }
                Err(error) => error,
            };

            if !self.policy.should_retry(&error) {
                self.stats.write().await.failed_fatal += 1;
                if self.policy.detailed_logging {
                    debug!("Error not retryable: {}", error);
                }
                return Err(error);
            }

            if attempt >= max_attempts {
                self.stats.write().await.failed_after_retries += 1;
                warn!("Operation failed after {} attempts: {}", attempt, error);
                return Err(error);
            }

            let delay = self.policy.calculate_delay(attempt);
            {
                let mut stats = self.stats.write().await;
                stats.total_retry_attempts += 1;
                stats.last_retry = Some(Utc::now());
                stats.last_attempt = Some(RetryAttempt {
                    attempt,
                    delay,
                    previous_error: error.to_string(),
                });
            }

            debug!(
                "Retrying after {:?} (attempt {}/{}): {}",
                delay, attempt, max_attempts, error
            );
            sleep(delay).await;
        }
    }

    /// Get retry statistics
    pub async fn get_stats(&self) -> RetryStats {
        self.stats.read().await.clone()
    }

    /// Reset statistics
    pub async fn reset_stats(&self) {
        *self.stats.write().await = RetryStats::default();
    }
}

/// Retry builder for fluent API
pub struct RetryBuilder {
    policy: RetryPolicy,
}

impl Default for RetryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RetryBuilder {
    /// Create new retry builder
    pub fn new() -> Self {
        Self {
            policy: RetryPolicy::default(),
        }
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.policy.max_retries = retries;
        self
    }

    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.policy.base_delay = delay;
        self
    }

    pub fn multiplier(mut self, multiplier: f64) -> Self {
        self.policy.multiplier = multiplier;
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.policy.max_delay = delay;
        self
    }

    /// Enable jitter
    pub fn with_jitter(mut self, factor: f64) -> Self {
        self.policy.jitter = JitterConfig {
            enabled: true,
            factor,
        };
        self
    }

    pub fn without_jitter(mut self) -> Self {
        self.policy.jitter.enabled = false;
        self
    }

    pub fn attempt_timeout(mut self, timeout: Duration) -> Self {
        self.policy.attempt_timeout = Some(timeout);
        self
    }

    pub fn policy(self) -> RetryPolicy {
        self.policy
    }

    /// Build retry executor
    pub fn build(self) -> RetryExecutor {
        RetryExecutor::new(self.policy)
    }
}
