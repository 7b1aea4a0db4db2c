//! Retry with pluggable backoff
//!
//! Registration is the only place the agent retries inside a single run;
//! periodic loops simply wait for their next tick. Both use the policies
//! defined here so retry semantics live in one place.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

/// Delay before the next attempt
pub trait BackoffPolicy: Send + Sync {
    /// `attempt` is 1 for the delay after the first failure
    fn delay(&self, attempt: u32) -> Duration;
}

/// Exponential backoff: `initial * multiplier^(attempt-1)`, capped
#[derive(Clone, Debug)]
pub struct ExponentialBackoff {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Scale each delay by a random factor in 0.5..1.5, still capped
    pub jitter: bool,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl ExponentialBackoff {
    fn base_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.multiplier.powi(exp);
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
    }
}

impl BackoffPolicy for ExponentialBackoff {
    fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if !self.jitter {
            return base;
        }
        // Jitter never pushes a delay past the cap
        let factor = rand::thread_rng().gen_range(0.5..1.5);
        Duration::from_secs_f64((base.as_secs_f64() * factor).min(self.max_delay.as_secs_f64()))
    }
}

/// Constant delay between attempts
#[derive(Clone, Debug)]
pub struct FixedBackoff(pub Duration);

impl BackoffPolicy for FixedBackoff {
    fn delay(&self, _attempt: u32) -> Duration {
        self.0
    }
}

/// Why a retried operation gave up
#[derive(Debug)]
pub enum RetryOutcome<E> {
    /// `is_fatal` classified the error as not worth retrying
    Fatal(E),
    /// Cancellation was requested while waiting
    Cancelled(Option<E>),
}

/// Run `operation` until it succeeds, a fatal error occurs, or `cancel` fires.
///
/// Cancellation is observed between attempts only; an attempt in flight is
/// allowed to finish.
pub async fn retry_until_success<F, Fut, T, E>(
    policy: &dyn BackoffPolicy,
    operation_name: &str,
    cancel: &CancellationToken,
    is_fatal: impl Fn(&E) -> bool,
    mut operation: F,
) -> Result<T, RetryOutcome<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0u32;

    loop {
        if cancel.is_cancelled() {
            return Err(RetryOutcome::Cancelled(None));
        }
        attempt += 1;

        let err = match operation().await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        if is_fatal(&err) {
            error!(
                operation = %operation_name,
                attempt = attempt,
                error = %err,
                "Operation failed with a non-retryable error"
            );
            return Err(RetryOutcome::Fatal(err));
        }

        let delay = policy.delay(attempt);
        warn!(
            operation = %operation_name,
            attempt = attempt,
            error = %err,
            delay_ms = delay.as_millis() as u64,
            "Operation failed, retrying"
        );

        tokio::select! {
            _ = cancel.cancelled() => return Err(RetryOutcome::Cancelled(Some(err))),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
