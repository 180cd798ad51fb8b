//! Bounded retrying of I/O that may fail transiently.

use {
    anyhow::{Error, Result},
    cadd::ops::Cadd,
    heddle_protocol::Error as HeddleError,
    std::{thread::sleep, time::Duration},
    tracing::warn,
};

/// How long and how often to retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub num_retries: u32,
    /// Delay before the second attempt. Doubles with each further attempt.
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    #[inline]
    fn default() -> Self {
        Self {
            num_retries: 5,
            base_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    #[must_use]
    #[inline]
    pub fn delay_before(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(1_u32 << exponent)
    }
}

pub enum AttemptError {
    /// Worth retrying: the same call may succeed later.
    Transient(Error),
    /// Retrying will not help.
    Application(Error),
}

impl AttemptError {
    #[inline]
    pub fn application(err: impl Into<Error>) -> Self {
        Self::Application(err.into())
    }

    #[inline]
    pub fn transient(err: impl Into<Error>) -> Self {
        Self::Transient(err.into())
    }
}

impl From<AttemptError> for Error {
    #[inline]
    fn from(err: AttemptError) -> Self {
        match err {
            AttemptError::Transient(err) | AttemptError::Application(err) => err,
        }
    }
}

/// Calls `f` until it succeeds, fails with an application error or runs out of retries.
///
/// Exhausted transient failures are escalated as [`HeddleError::Transient`].
#[inline]
pub fn ok_or_retry<T, F>(policy: &RetryPolicy, mut f: F) -> Result<T>
where
    F: FnMut() -> Result<T, AttemptError>,
{
    let mut attempt = 0_u32;
    loop {
        attempt = attempt.cadd(1_u32)?;
        let transient_err = match f() {
            Ok(x) => break Ok(x),
            Err(AttemptError::Application(err)) => break Err(err),
            Err(AttemptError::Transient(err)) => err,
        };
        if attempt > policy.num_retries {
            break Err(transient_err.context(HeddleError::Transient(format!(
                "giving up after {attempt} attempts"
            ))));
        }
        let delay = policy.delay_before(attempt);
        warn!(error = %transient_err, attempt, ?delay, "operation failed, will retry");
        sleep(delay);
    }
}

#[cfg(test)]
#[expect(clippy::unwrap_used, clippy::arithmetic_side_effects, reason = "test")]
mod tests {
    use {super::*, anyhow::anyhow, std::cell::Cell};

    fn fast() -> RetryPolicy {
        RetryPolicy {
            num_retries: 3,
            base_delay: Duration::from_millis(1),
        }
    }

    #[test]
    fn backoff_doubles() {
        let policy = RetryPolicy {
            num_retries: 5,
            base_delay: Duration::from_secs(2),
        };
        assert_eq!(policy.delay_before(1), Duration::from_secs(2));
        assert_eq!(policy.delay_before(2), Duration::from_secs(4));
        assert_eq!(policy.delay_before(4), Duration::from_secs(16));
    }

    #[test]
    fn transient_then_success() {
        let calls = Cell::new(0_u32);
        let value = ok_or_retry(&fast(), || {
            calls.set(calls.get() + 1);
            if calls.get() < 3 {
                Err(AttemptError::transient(anyhow!("flaky")))
            } else {
                Ok(42)
            }
        })
        .unwrap();
        assert_eq!(value, 42);
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn application_error_is_not_retried() {
        let calls = Cell::new(0_u32);
        let result: Result<()> = ok_or_retry(&fast(), || {
            calls.set(calls.get() + 1);
            Err(AttemptError::application(anyhow!("bad request")))
        });
        result.unwrap_err();
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn exhausted_retries_escalate() {
        let calls = Cell::new(0_u32);
        let err = ok_or_retry(&fast(), || -> Result<(), AttemptError> {
            calls.set(calls.get() + 1);
            Err(AttemptError::transient(anyhow!("down")))
        })
        .unwrap_err();
        assert_eq!(calls.get(), 4);
        assert!(matches!(
            err.downcast_ref::<HeddleError>(),
            Some(HeddleError::Transient(_))
        ));
    }
}
