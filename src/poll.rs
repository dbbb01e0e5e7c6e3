//! Bounded poll-until-condition combinator
//!
//! Device visibility and pod state propagate asynchronously. Instead of
//! sleeping a fixed amount after each mutation, callers probe until the
//! condition holds or the attempt budget runs out.

use crate::error::{Error, Result};
use backoff::ExponentialBackoffBuilder;
use parking_lot::Mutex;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// Poll interval and attempt budget
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl PollPolicy {
    pub fn new(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Single probe, no waiting
    pub fn immediate() -> Self {
        Self::new(Duration::ZERO, 1)
    }

    /// Upper bound on the time spent polling
    pub fn deadline(&self) -> Duration {
        self.interval * self.max_attempts
    }

    fn backoff(&self) -> backoff::ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.interval)
            .with_max_interval(self.interval)
            .with_multiplier(1.0)
            .with_randomization_factor(0.0)
            // attempts bound the loop; the elapsed cap only guards slow probes
            .with_max_elapsed_time(Some(self.deadline() * 2 + Duration::from_secs(1)))
            .build()
    }
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self::new(Duration::from_millis(500), 20)
    }
}

/// Probe until it yields `Some`, failing with `PollTimeout` once the budget
/// is spent. Probe errors abort immediately.
pub async fn poll_until<T, F, Fut>(policy: &PollPolicy, condition: &str, mut probe: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
{
    let max_attempts = policy.max_attempts;
    let mut attempts = 0u32;

    let outcome = backoff::future::retry(policy.backoff(), || {
        attempts += 1;
        let attempt = attempts;
        let probe = probe();
        async move {
            match probe.await {
                Ok(Some(value)) => Ok(value),
                Ok(None) if attempt >= max_attempts => {
                    Err(backoff::Error::permanent(Pending::Exhausted(attempt)))
                }
                Ok(None) => {
                    debug!("Condition not met yet (attempt {}/{})", attempt, max_attempts);
                    Err(backoff::Error::transient(Pending::NotYet(attempt)))
                }
                Err(e) => Err(backoff::Error::permanent(Pending::Failed(e))),
            }
        }
    })
    .await;

    outcome.map_err(|pending| match pending {
        Pending::Failed(e) => e,
        Pending::Exhausted(n) | Pending::NotYet(n) => Error::PollTimeout {
            condition: condition.to_string(),
            attempts: n,
        },
    })
}

/// Poll a value until it equals `expected`, returning the last observation
pub async fn poll_until_eq<T, F, Fut>(
    policy: &PollPolicy,
    condition: &str,
    expected: T,
    mut probe: F,
) -> Result<T>
where
    T: PartialEq + std::fmt::Display + Clone,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let last: Mutex<Option<T>> = Mutex::new(None);
    let result = poll_until(policy, condition, || {
        let fut = probe();
        let expected = expected.clone();
        let last = &last;
        async move {
            let value = fut.await?;
            let matched = value == expected;
            *last.lock() = Some(value.clone());
            Ok(matched.then_some(value))
        }
    })
    .await;

    match result {
        Err(Error::PollTimeout { .. }) => Err(match last.into_inner() {
            Some(actual) => Error::consistency(condition, expected, actual),
            None => Error::consistency(condition, expected, "nothing"),
        }),
        other => other,
    }
}

enum Pending {
    NotYet(u32),
    Exhausted(u32),
    Failed(Error),
}
