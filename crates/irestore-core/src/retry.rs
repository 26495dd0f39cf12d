//! Bounded retry with fixed backoff.
//!
//! Shared by device-open loops and mode-transition polling so every
//! reconnect in a session follows the same attempt budget.

use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Attempt bound and fixed interval between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub attempts: u32,
    #[serde(with = "millis")]
    pub interval: Duration,
}

impl RetryPolicy {
    pub const fn new(attempts: u32, interval: Duration) -> Self {
        Self { attempts, interval }
    }

    /// Twenty attempts, four seconds apart.
    pub const fn connect() -> Self {
        Self::new(20, Duration::from_secs(4))
    }

    /// Ten attempts, one second apart.
    pub const fn reconnect() -> Self {
        Self::new(10, Duration::from_secs(1))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::connect()
    }
}

#[derive(Error, Debug)]
pub enum RetryError<E> {
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: E },

    /// The probe reported an error that retrying cannot fix.
    #[error(transparent)]
    Fatal(E),
}

impl<E> RetryError<E> {
    pub fn into_inner(self) -> E {
        match self {
            RetryError::Exhausted { last, .. } => last,
            RetryError::Fatal(e) => e,
        }
    }
}

/// Outcome of one probe.
pub enum Attempt<T, E> {
    Ready(T),
    /// Not there yet; try again after the interval.
    Retry(E),
    Abort(E),
}

/// Run `probe` until it is ready or the attempt bound is reached.
///
/// The probe receives the 1-based attempt number. No sleep follows the
/// final attempt.
pub fn retry_with_backoff<T, E, F>(policy: &RetryPolicy, mut probe: F) -> Result<T, RetryError<E>>
where
    F: FnMut(u32) -> Attempt<T, E>,
{
    let attempts = policy.attempts.max(1);
    let mut attempt = 1;
    loop {
        match probe(attempt) {
            Attempt::Ready(value) => return Ok(value),
            Attempt::Abort(e) => return Err(RetryError::Fatal(e)),
            Attempt::Retry(e) => {
                if attempt >= attempts {
                    return Err(RetryError::Exhausted { attempts, last: e });
                }
                debug!(attempt, max = attempts, "Not ready, retrying");
                if !policy.interval.is_zero() {
                    thread::sleep(policy.interval);
                }
                attempt += 1;
            }
        }
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ready_on_third_attempt() {
        let policy = RetryPolicy::new(5, Duration::ZERO);
        let mut calls = 0;
        let res: Result<u32, RetryError<&str>> = retry_with_backoff(&policy, |n| {
            calls += 1;
            if n == 3 { Attempt::Ready(n) } else { Attempt::Retry("busy") }
        });
        assert_eq!(res.unwrap(), 3);
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_exhausted_respects_bound() {
        let policy = RetryPolicy::new(4, Duration::ZERO);
        let mut calls = 0;
        let res: Result<(), _> = retry_with_backoff(&policy, |_| {
            calls += 1;
            Attempt::Retry("absent")
        });
        assert!(matches!(
            res,
            Err(RetryError::Exhausted { attempts: 4, last: "absent" })
        ));
        assert_eq!(calls, 4);
    }

    #[test]
    fn test_abort_stops_immediately() {
        let policy = RetryPolicy::new(10, Duration::ZERO);
        let mut calls = 0;
        let res: Result<(), _> = retry_with_backoff(&policy, |_| {
            calls += 1;
            Attempt::Abort("denied")
        });
        assert!(matches!(res, Err(RetryError::Fatal("denied"))));
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_policy_toml_uses_millis() {
        #[derive(Serialize, Deserialize)]
        struct Wrap {
            policy: RetryPolicy,
        }
        let text = toml::to_string(&Wrap {
            policy: RetryPolicy::connect(),
        })
        .unwrap();
        assert!(text.contains("interval = 4000"));
        let back: Wrap = toml::from_str(&text).unwrap();
        assert_eq!(back.policy, RetryPolicy::connect());
    }
}
