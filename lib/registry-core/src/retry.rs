//! Retry policies and the backoff executor used for one-shot registry calls

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::{RegistryError, Result};

/// Bounded exponential backoff for one-shot calls such as the initial registration
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    /// Sleep after the first failure
    pub initial_interval: Duration,
    /// Upper bound for any sleep
    pub max_interval: Duration,
    /// Growth factor applied after each failure
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 6,
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(2),
            multiplier: 1.1,
        }
    }
}

impl RetryPolicy {
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(RegistryError::Config(
                "retry max_attempts must be at least 1".to_string(),
            ));
        }
        if !(self.multiplier >= 1.0) || !self.multiplier.is_finite() {
            return Err(RegistryError::Config(format!(
                "retry multiplier must be a finite value >= 1, got {}",
                self.multiplier
            )));
        }
        Ok(())
    }

    /// Sleep after failed attempt `attempt` (1-based):
    /// `min(initial * multiplier^(attempt - 1), max)`
    pub fn backoff_duration(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.initial_interval.as_secs_f64() * self.multiplier.powi(exponent);
        let max = self.max_interval.as_secs_f64();

        if !secs.is_finite() || secs >= max {
            self.max_interval
        } else if secs <= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_nanos((secs * 1e9).round() as u64)
        }
    }
}

/// Unbounded backoff for the steady-state heartbeat loop
///
/// After `n` consecutive heartbeat failures the next tick waits
/// `nominal * min(growth^(n - 1), max_factor)`.
#[derive(Clone, Debug, PartialEq)]
pub struct HeartbeatPolicy {
    pub growth: f64,
    pub max_factor: f64,
}

impl Default for HeartbeatPolicy {
    fn default() -> Self {
        Self {
            growth: 1.5,
            max_factor: 2.0,
        }
    }
}

impl HeartbeatPolicy {
    pub fn validate(&self) -> Result<()> {
        let usable = |value: f64| value >= 1.0 && value.is_finite();
        if !usable(self.growth) || !usable(self.max_factor) {
            return Err(RegistryError::Config(format!(
                "heartbeat growth and max_factor must be finite values >= 1, got {} and {}",
                self.growth, self.max_factor
            )));
        }
        Ok(())
    }

    /// Saturates at [`Duration::MAX`] rather than overflowing.
    pub fn interval(&self, nominal: Duration, consecutive_failures: u32) -> Duration {
        if consecutive_failures == 0 {
            return nominal;
        }
        let exponent = (consecutive_failures - 1).min(i32::MAX as u32) as i32;
        let factor = self.growth.powi(exponent);
        let factor = if factor.is_finite() {
            factor.min(self.max_factor)
        } else {
            self.max_factor
        };
        Duration::try_from_secs_f64(nominal.as_secs_f64() * factor).unwrap_or(Duration::MAX)
    }
}

/// Runs an operation under a [`RetryPolicy`]
///
/// Holds no mutable state, so one executor can serve concurrent callers.
#[derive(Clone, Debug, Default)]
pub struct BackoffExecutor {
    policy: RetryPolicy,
}

impl BackoffExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Invoke `operation` until it succeeds or the policy's attempts run out.
    ///
    /// Returns `Ok(Some(value))` on success. When every attempt fails the
    /// last error is returned if `fail_fast` is set, otherwise `Ok(None)`.
    /// The operation receives the 1-based attempt number.
    pub async fn run<T, E, F, Fut>(
        &self,
        operation_name: &str,
        fail_fast: bool,
        operation: F,
    ) -> std::result::Result<Option<T>, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Display,
    {
        self.run_retrying(operation_name, fail_fast, |_| true, operation).await
    }

    /// Like [`run`](Self::run), but an error for which `retryable` returns
    /// false ends the loop at once and is returned regardless of `fail_fast`.
    pub async fn run_retrying<T, E, R, F, Fut>(
        &self,
        operation_name: &str,
        fail_fast: bool,
        retryable: R,
        mut operation: F,
    ) -> std::result::Result<Option<T>, E>
    where
        R: Fn(&E) -> bool,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Display,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            debug!("{}: attempt {}/{}", operation_name, attempt, max_attempts);

            match operation(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        info!("{}: succeeded on attempt {}", operation_name, attempt);
                    }
                    return Ok(Some(value));
                }
                Err(e) if !retryable(&e) => {
                    info!("{}: giving up on attempt {}: {}", operation_name, attempt, e);
                    return Err(e);
                }
                Err(e) if attempt >= max_attempts => {
                    error!(
                        "{}: failed after {} attempts, last error: {}",
                        operation_name, max_attempts, e
                    );
                    return if fail_fast { Err(e) } else { Ok(None) };
                }
                Err(e) => {
                    let backoff = self.policy.backoff_duration(attempt);
                    warn!(
                        "{}: attempt {} failed: {}, retrying in {:?}",
                        operation_name, attempt, e, backoff
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
            }
        }
    }
}
