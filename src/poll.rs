//! Bounded polling.
//!
//! Every wait in a bootstrap run is a fixed-interval loop with a fixed attempt
//! ceiling. There is no backoff and no cancellation: the ceiling is the only
//! timeout.

use crate::errors::PollError;
use std::future::Future;
use std::time::Duration;

/// How many times a check may run before the poll gives up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attempts {
    Bounded(u32),
    /// Poll until the check succeeds. Callers rely on a later step for the deadline.
    Unbounded,
}

impl Attempts {
    /// `0` means unbounded, matching the config file convention.
    pub fn from_ceiling(ceiling: u32) -> Self {
        if ceiling == 0 {
            Attempts::Unbounded
        } else {
            Attempts::Bounded(ceiling)
        }
    }

    fn exhausted(self, attempt: u32) -> bool {
        match self {
            Attempts::Bounded(max) => attempt >= max,
            Attempts::Unbounded => false,
        }
    }
}

impl std::fmt::Display for Attempts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Attempts::Bounded(max) => write!(f, "{}", max),
            Attempts::Unbounded => write!(f, "∞"),
        }
    }
}

/// Interval and ceiling for one kind of wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub attempts: Attempts,
}

impl PollPolicy {
    pub fn bounded(interval: Duration, max: u32) -> Self {
        Self {
            interval,
            attempts: Attempts::Bounded(max),
        }
    }

    pub async fn run<F, Fut>(&self, check: F) -> Result<u32, PollError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = bool>,
    {
        poll_until(check, self.interval, self.attempts).await
    }

    pub async fn find<T, F, Fut>(&self, check: F) -> Result<(T, u32), PollError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Option<T>>,
    {
        poll_for(check, self.interval, self.attempts).await
    }
}

/// Run `check` until it returns `true`, sleeping `interval` between attempts.
///
/// The closure receives the 1-based attempt number. Returns the attempt that
/// succeeded. No sleep follows the final failed attempt.
pub async fn poll_until<F, Fut>(
    mut check: F,
    interval: Duration,
    attempts: Attempts,
) -> Result<u32, PollError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = bool>,
{
    poll_for(
        |attempt| {
            let ready = check(attempt);
            async move { ready.await.then_some(()) }
        },
        interval,
        attempts,
    )
    .await
    .map(|((), attempt)| attempt)
}

/// Like `poll_until`, but the check yields the value it was waiting for.
pub async fn poll_for<T, F, Fut>(
    mut check: F,
    interval: Duration,
    attempts: Attempts,
) -> Result<(T, u32), PollError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let mut attempt: u32 = 0;
    loop {
        attempt = attempt.saturating_add(1);
        if let Some(value) = check(attempt).await {
            return Ok((value, attempt));
        }
        if attempts.exhausted(attempt) {
            return Err(PollError::TimedOut { attempts: attempt, interval });
        }
        tokio::time::sleep(interval).await;
    }
}

/// Retry a fallible operation under `policy`, logging each failed attempt.
///
/// Returns the first `Ok` value with the attempt that produced it. Exhaustion
/// reports the attempt count; the individual errors have already been logged.
pub async fn retry<T, E, F, Fut>(
    policy: PollPolicy,
    what: &str,
    mut op: F,
) -> Result<(T, u32), PollError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt: u32 = 0;
    loop {
        attempt = attempt.saturating_add(1);
        match op(attempt).await {
            Ok(value) => return Ok((value, attempt)),
            Err(e) => tracing::warn!(
                attempt,
                max = %policy.attempts,
                "{} failed: {}",
                what,
                e
            ),
        }
        if policy.attempts.exhausted(attempt) {
            return Err(PollError::TimedOut {
                attempts: attempt,
                interval: policy.interval,
            });
        }
        tokio::time::sleep(policy.interval).await;
    }
}
