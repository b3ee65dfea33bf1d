//! Bounded retry for transient instrument errors.
//
// Step-level bus failures (`Command`, `Timeout`) are retried here with a fixed
// backoff between attempts. Anything else is returned immediately. The backoff
// goes through the injected `Clock` so retries cost no wall time in tests.

use crate::clock::Clock;
use crate::error::DaqError;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

/// Defines a policy for retrying an operation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// The maximum number of attempts, including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// The delay between attempts.
    #[serde(default = "default_backoff_delay", with = "humantime_serde")]
    pub backoff_delay: Duration,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_delay() -> Duration {
    Duration::from_millis(100)
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_delay: default_backoff_delay(),
        }
    }
}

impl RetryPolicy {
    pub fn validate(&self) -> Result<(), DaqError> {
        if self.max_attempts == 0 {
            return Err(DaqError::Config(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Runs `op` against `target` until it succeeds, fails with a non-transient
/// error, or `policy.max_attempts` is used up.
///
/// The last transient error is returned when attempts run out.
pub async fn retry_transient<R, T, F>(
    policy: &RetryPolicy,
    clock: &dyn Clock,
    what: &str,
    target: &mut R,
    mut op: F,
) -> Result<T, DaqError>
where
    R: ?Sized,
    F: for<'a> FnMut(&'a mut R) -> BoxFuture<'a, Result<T, DaqError>>,
{
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op(target).await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < attempts => {
                warn!(
                    "{} failed (attempt {}/{}): {}; retrying in {:?}",
                    what, attempt, attempts, err, policy.backoff_delay
                );
                clock.sleep(policy.backoff_delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    struct Flaky {
        attempts: u32,
        succeed_on_attempt: u32,
    }

    impl Flaky {
        async fn poke(&mut self) -> Result<u32, DaqError> {
            self.attempts += 1;
            if self.attempts >= self.succeed_on_attempt {
                Ok(self.attempts)
            } else {
                Err(DaqError::command("flaky", "no ack"))
            }
        }
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            backoff_delay: Duration::from_millis(10),
        }
    }

    #[tokio::test]
    async fn test_retry_logic_succeeds() {
        let clock = ManualClock::new();
        let mut flaky = Flaky {
            attempts: 0,
            succeed_on_attempt: 2,
        };
        let result = retry_transient(&policy(), &clock, "poke", &mut flaky, |f| {
            Box::pin(f.poke())
        })
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(clock.sleeps(), vec![Duration::from_millis(10)]);
    }

    #[tokio::test]
    async fn test_retry_logic_fails() {
        let clock = ManualClock::new();
        let mut flaky = Flaky {
            attempts: 0,
            succeed_on_attempt: 4,
        };
        let result = retry_transient(&policy(), &clock, "poke", &mut flaky, |f| {
            Box::pin(f.poke())
        })
        .await;
        assert!(matches!(result, Err(DaqError::Command { .. })));
        assert_eq!(flaky.attempts, 3);
        assert_eq!(clock.sleeps().len(), 2);
    }

    #[tokio::test]
    async fn test_non_transient_is_not_retried() {
        let clock = ManualClock::new();
        let mut calls = 0u32;
        let result: Result<(), _> = retry_transient(&policy(), &clock, "cfg", &mut calls, |c| {
            Box::pin(async move {
                *c += 1;
                Err(DaqError::Config("bad range".into()))
            })
        })
        .await;
        assert!(matches!(result, Err(DaqError::Config(_))));
        assert_eq!(calls, 1);
        assert!(clock.sleeps().is_empty());
    }

    #[test]
    fn test_zero_attempts_rejected() {
        let policy = RetryPolicy {
            max_attempts: 0,
            ..RetryPolicy::default()
        };
        assert!(policy.validate().is_err());
    }
}
