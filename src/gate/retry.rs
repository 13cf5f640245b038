//! Exponential backoff with jitter.

use super::classify::{retry_after_hint, ErrorClass};
use std::future::Future;
use std::time::Duration;

/// How often and how patiently a failing operation is repeated.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first. At least 1.
    pub max_attempts: u32,
    pub base_delay: Duration,
    /// Growth factor between consecutive delays. At least 1.0.
    pub backoff_multiplier: f64,
    /// Ceiling applied before jitter.
    pub max_delay: Option<Duration>,
    /// Fraction in `[0, 1]` by which a delay may move in either direction.
    pub jitter_ratio: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            max_delay: Some(Duration::from_secs(30)),
            jitter_ratio: 0.2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RetryPolicyError {
    #[error("max_attempts must be at least 1")]
    ZeroAttempts,
    #[error("backoff multiplier must be a finite value >= 1.0, got {0}")]
    InvalidMultiplier(f64),
    #[error("jitter ratio must be within [0, 1], got {0}")]
    InvalidJitter(f64),
}

impl RetryPolicy {
    /// Fixed-delay policy without jitter.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            backoff_multiplier: 1.0,
            max_delay: None,
            jitter_ratio: 0.0,
        }
    }

    pub fn with_backoff(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = Some(max_delay);
        self
    }

    pub fn with_jitter(mut self, ratio: f64) -> Self {
        self.jitter_ratio = ratio;
        self
    }

    pub fn validate(&self) -> Result<(), RetryPolicyError> {
        if self.max_attempts == 0 {
            return Err(RetryPolicyError::ZeroAttempts);
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(RetryPolicyError::InvalidMultiplier(self.backoff_multiplier));
        }
        if !(0.0..=1.0).contains(&self.jitter_ratio) {
            return Err(RetryPolicyError::InvalidJitter(self.jitter_ratio));
        }
        Ok(())
    }

    /// Unjittered wait after the given failed attempt (1-based):
    /// `base_delay * backoff_multiplier^(attempt - 1)`, capped at `max_delay`.
    pub fn nominal_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let secs = self.base_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let delay = Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX);
        match self.max_delay {
            Some(cap) => delay.min(cap),
            None => delay,
        }
    }

    /// Wait after the given failed attempt, with jitter applied.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = self.nominal_delay(attempt);
        if self.jitter_ratio <= 0.0 {
            return delay;
        }
        let spread = (rand::random::<f64>() * 2.0 - 1.0) * self.jitter_ratio;
        Duration::try_from_secs_f64(delay.as_secs_f64() * (1.0 + spread)).unwrap_or(delay)
    }

    /// Unjittered waits between consecutive attempts. Has `max_attempts - 1` entries.
    pub fn backoff_schedule(&self) -> Vec<Duration> {
        (1..self.max_attempts).map(|a| self.nominal_delay(a)).collect()
    }

    /// Whether another attempt may follow the given failed attempt.
    pub fn allows_retry_after(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// Why [`retry_async`] gave up.
#[derive(Debug)]
pub struct RetryFailure {
    /// `Fatal` when classification stopped the loop, `Transient` when attempts ran out.
    pub class: ErrorClass,
    pub attempts: u32,
    pub error: anyhow::Error,
}

/// Run `op` until it succeeds, fails fatally, or the policy is exhausted.
///
/// `op` receives the 1-based attempt number. `classify` decides whether an
/// error is worth another attempt. A `Retry-After` hint in the error message
/// stretches the wait, still bounded by `max_delay`.
pub async fn retry_async<T, F, Fut, C>(
    policy: &RetryPolicy,
    label: &str,
    classify: C,
    mut op: F,
) -> Result<T, RetryFailure>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
    C: Fn(&anyhow::Error) -> ErrorClass,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        let error = match op(attempt).await {
            Ok(value) => {
                if attempt > 1 {
                    tracing::info!(target_op = label, attempt, "gate.recovered");
                }
                return Ok(value);
            }
            Err(error) => error,
        };

        let class = classify(&error);
        if class == ErrorClass::Fatal {
            tracing::warn!(target_op = label, attempt, error = %format!("{error:#}"), "gate.fatal");
            return Err(RetryFailure {
                class,
                attempts: attempt,
                error,
            });
        }
        if attempt >= max_attempts {
            tracing::warn!(
                target_op = label,
                attempts = attempt,
                error = %format!("{error:#}"),
                "gate.exhausted"
            );
            return Err(RetryFailure {
                class,
                attempts: attempt,
                error,
            });
        }

        let mut wait = policy.delay_for_attempt(attempt);
        if let Some(hint) = retry_after_hint(&error) {
            wait = wait.max(hint);
            if let Some(cap) = policy.max_delay {
                wait = wait.min(cap);
            }
        }
        tracing::warn!(
            target_op = label,
            attempt,
            max_attempts,
            delay_ms = wait.as_millis() as u64,
            error = %format!("{error:#}"),
            "gate.retry"
        );
        tokio::time::sleep(wait).await;
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::classify_error;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn quick(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::fixed(max_attempts, Duration::from_millis(1))
    }

    #[test]
    fn backoff_doubles_without_jitter() {
        let policy = RetryPolicy {
            max_attempts: 4,
            base_delay: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            max_delay: None,
            jitter_ratio: 0.0,
        };
        assert_eq!(
            policy.backoff_schedule(),
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4)
            ]
        );
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(4));
        assert!(policy.allows_retry_after(3));
        assert!(!policy.allows_retry_after(4));
    }

    #[test]
    fn delay_is_capped() {
        let policy = RetryPolicy::fixed(10, Duration::from_secs(1))
            .with_backoff(3.0)
            .with_max_delay(Duration::from_secs(5));
        assert_eq!(policy.nominal_delay(2), Duration::from_secs(3));
        assert_eq!(policy.nominal_delay(3), Duration::from_secs(5));
        assert_eq!(policy.nominal_delay(9), Duration::from_secs(5));
    }

    #[test]
    fn huge_exponent_does_not_overflow() {
        let policy = RetryPolicy::fixed(u32::MAX, Duration::from_secs(1)).with_backoff(10.0);
        assert_eq!(policy.nominal_delay(5_000), Duration::MAX);
        let _ = policy.delay_for_attempt(5_000);
    }

    #[test]
    fn jitter_stays_within_ratio() {
        let policy = RetryPolicy::fixed(3, Duration::from_millis(1000)).with_jitter(0.2);
        for _ in 0..200 {
            let d = policy.delay_for_attempt(1);
            assert!(d >= Duration::from_millis(800), "{d:?} below range");
            assert!(d <= Duration::from_millis(1200), "{d:?} above range");
        }
    }

    #[test]
    fn validation_rejects_bad_values() {
        assert!(RetryPolicy::default().validate().is_ok());
        assert_eq!(
            RetryPolicy::fixed(0, Duration::ZERO).validate(),
            Err(RetryPolicyError::ZeroAttempts)
        );
        assert!(matches!(
            RetryPolicy::default().with_backoff(0.5).validate(),
            Err(RetryPolicyError::InvalidMultiplier(_))
        ));
        assert!(matches!(
            RetryPolicy::default().with_backoff(f64::NAN).validate(),
            Err(RetryPolicyError::InvalidMultiplier(_))
        ));
        assert!(matches!(
            RetryPolicy::default().with_jitter(1.5).validate(),
            Err(RetryPolicyError::InvalidJitter(_))
        ));
    }

    #[tokio::test]
    async fn retries_transient_errors_until_success() {
        let calls = AtomicU32::new(0);
        let result = retry_async(&quick(3), "test", classify_error, |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 3 {
                    anyhow::bail!("503 Service Unavailable");
                }
                Ok(attempt)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn fatal_error_stops_immediately() {
        let calls = AtomicU32::new(0);
        let failure = retry_async(&quick(5), "test", classify_error, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(anyhow::anyhow!("400 Bad Request")) }
        })
        .await
        .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(failure.class, ErrorClass::Fatal);
        assert_eq!(failure.attempts, 1);
    }

    #[tokio::test]
    async fn never_exceeds_max_attempts() {
        let calls = AtomicU32::new(0);
        let failure = retry_async(&quick(4), "test", classify_error, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(anyhow::anyhow!("timed out")) }
        })
        .await
        .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(failure.class, ErrorClass::Transient);
        assert_eq!(failure.attempts, 4);
        assert!(failure.error.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn retry_after_hint_is_capped_by_max_delay() {
        let policy = quick(2).with_max_delay(Duration::from_millis(20));
        let started = std::time::Instant::now();
        let _ = retry_async(&policy, "test", classify_error, |_| async {
            Err::<(), _>(anyhow::anyhow!("429 Too Many Requests, Retry-After: 60"))
        })
        .await;
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
