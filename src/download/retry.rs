//! Retry classification and backoff scheduling for failed attempts (§7).
//!
//! When an attempt fails, the error is classified into a [`FailureType`]
//! and [`RetryPolicy`] decides whether the item goes back to `Retrying`
//! or terminates at `FailedPermanent`, using the delay formula
//! `retryBackoffBase^attempts + jitter`.

use std::time::Duration;

use rand::Rng;
use tracing::{debug, instrument};

use super::DownloadError;

/// Maximum jitter added to a computed backoff delay.
const MAX_JITTER: Duration = Duration::from_millis(250);

/// Classification of an attempt failure for retry purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureType {
    /// May succeed on a fresh attempt: network, protocol, timeout, integrity,
    /// or disk errors other than permission-denied.
    Transient,
    /// Will not succeed regardless of retries: permission-denied disk errors,
    /// or exhausted attempts.
    Permanent,
}

/// What the worker should do after an attempt fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { delay: Duration, attempt: u32 },
    DoNotRetry { reason: String },
}

/// Classifies a [`DownloadError`] into a [`FailureType`] (§7).
#[must_use]
pub fn classify_error(error: &DownloadError) -> FailureType {
    if error.is_inherently_permanent() {
        FailureType::Permanent
    } else {
        FailureType::Transient
    }
}

/// Computes retry/give-up decisions from `retryBackoffBase` and `maxAttempts`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    backoff_base: Duration,
}

impl RetryPolicy {
    #[must_use]
    pub fn new(max_attempts: u32, backoff_base: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff_base,
        }
    }

    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Decides what to do after `attempts_so_far` failed attempts of
    /// `failure_type`. `attempts_so_far` counts the attempt that just failed.
    #[instrument(skip(self), fields(attempts_so_far, failure_type = ?failure_type))]
    pub fn should_retry(&self, failure_type: FailureType, attempts_so_far: u32) -> RetryDecision {
        if failure_type == FailureType::Permanent {
            return RetryDecision::DoNotRetry {
                reason: "failure classified as permanent".to_string(),
            };
        }
        if attempts_so_far >= self.max_attempts {
            return RetryDecision::DoNotRetry {
                reason: format!("max attempts ({}) reached", self.max_attempts),
            };
        }

        let delay = self.backoff_delay(attempts_so_far);
        debug!(?delay, "scheduling retry");
        RetryDecision::Retry {
            delay,
            attempt: attempts_so_far + 1,
        }
    }

    /// `retryBackoffBase^attempts + jitter`, computed in floating seconds.
    fn backoff_delay(&self, attempts: u32) -> Duration {
        let base_secs = self.backoff_base.as_secs_f64().max(1.0);
        let exponent = attempts.min(10); // guards against overflow on pathological inputs
        let raw = base_secs.powi(exponent as i32);
        let jitter = rand::thread_rng().gen_range(Duration::ZERO..=MAX_JITTER);
        Duration::from_secs_f64(raw) + jitter
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn protocol_error() -> DownloadError {
        DownloadError::Protocol {
            url: "http://host/a".into(),
            status: 503,
        }
    }

    fn permanent_disk_error() -> DownloadError {
        DownloadError::Disk {
            path: "/tmp/a".into(),
            permanent: true,
        }
    }

    #[test]
    fn protocol_errors_classify_transient() {
        assert_eq!(classify_error(&protocol_error()), FailureType::Transient);
    }

    #[test]
    fn permission_denied_classifies_permanent() {
        assert_eq!(classify_error(&permanent_disk_error()), FailureType::Permanent);
    }

    #[test]
    fn retries_while_attempts_remain() {
        let policy = RetryPolicy::new(3, Duration::from_secs(2));
        match policy.should_retry(FailureType::Transient, 1) {
            RetryDecision::Retry { delay, attempt } => {
                assert_eq!(attempt, 2);
                assert!(delay >= Duration::from_secs(2));
            }
            other => panic!("expected Retry, got {other:?}"),
        }
    }

    #[test]
    fn gives_up_at_max_attempts() {
        let policy = RetryPolicy::new(3, Duration::from_secs(2));
        assert!(matches!(
            policy.should_retry(FailureType::Transient, 3),
            RetryDecision::DoNotRetry { .. }
        ));
    }

    #[test]
    fn permanent_failures_never_retry() {
        let policy = RetryPolicy::new(5, Duration::from_secs(2));
        assert!(matches!(
            policy.should_retry(FailureType::Permanent, 1),
            RetryDecision::DoNotRetry { .. }
        ));
    }

    #[test]
    fn backoff_grows_with_attempts() {
        let policy = RetryPolicy::new(5, Duration::from_secs(2));
        let Some(d1) = (match policy.should_retry(FailureType::Transient, 1) {
            RetryDecision::Retry { delay, .. } => Some(delay),
            RetryDecision::DoNotRetry { .. } => None,
        }) else {
            panic!("expected retry")
        };
        let Some(d2) = (match policy.should_retry(FailureType::Transient, 2) {
            RetryDecision::Retry { delay, .. } => Some(delay),
            RetryDecision::DoNotRetry { .. } => None,
        }) else {
            panic!("expected retry")
        };
        assert!(d2 > d1);
    }
}
