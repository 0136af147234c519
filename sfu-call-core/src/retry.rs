//! Retry while still current
//!
//! Every retried RPC of a session (subscriptions, mute state, answers, joins)
//! goes through [`retry_while_current`]. Before each attempt, and again after
//! each failure, the loop asks its [`Relevance`] whether the payload it is
//! carrying is still the desired one and whether the target it is aimed at is
//! still the active one. If either changed, the loop stops without sending.

use crate::config::SyncRetryConfig;
use crate::signaling::SignalingError;
use std::future::Future;
use std::time::Duration;

/// Attempt budget and delay schedule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    delays: Vec<Duration>,
}

impl RetryPolicy {
    /// Explicit policy; `delays[i]` is waited after failed attempt `i + 1`,
    /// the last delay repeats
    #[must_use]
    pub fn new(max_attempts: u32, delays: Vec<Duration>) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delays,
        }
    }

    /// Policy of the sync RPCs
    #[must_use]
    pub fn from_sync(config: &SyncRetryConfig) -> Self {
        Self::new(
            config.max_attempts,
            config
                .backoff_ms
                .iter()
                .copied()
                .map(Duration::from_millis)
                .collect(),
        )
    }

    /// Linear backoff: failed attempt `n` waits `n * step`
    #[must_use]
    pub fn linear(max_attempts: u32, step: Duration) -> Self {
        let delays = (1..max_attempts.max(1))
            .map(|n| step.saturating_mul(n))
            .collect();
        Self::new(max_attempts, delays)
    }

    /// Maximum number of attempts
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay after the given failed attempt (1-based)
    #[must_use]
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let index = (attempt.max(1) - 1) as usize;
        self.delays
            .get(index)
            .or_else(|| self.delays.last())
            .copied()
            .unwrap_or(Duration::ZERO)
    }
}

/// Why an in-flight operation stopped being relevant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Staleness {
    /// The desired value changed after the operation started
    Payload,
    /// The session or SFU the operation targets is no longer active
    Target,
}

/// Relevance check of an in-flight operation
pub trait Relevance: Send + Sync {
    /// The payload is still the desired one
    fn payload_current(&self) -> bool;

    /// The target is still the active one
    fn target_current(&self) -> bool;

    /// First failing check, if any
    fn staleness(&self) -> Option<Staleness> {
        if !self.target_current() {
            Some(Staleness::Target)
        } else if !self.payload_current() {
            Some(Staleness::Payload)
        } else {
            None
        }
    }
}

/// [`Relevance`] built from two closures
pub struct Guard<P, T> {
    payload: P,
    target: T,
}

/// Build a relevance guard from an equality check and a target-identity check
pub fn guard<P, T>(payload: P, target: T) -> Guard<P, T>
where
    P: Fn() -> bool + Send + Sync,
    T: Fn() -> bool + Send + Sync,
{
    Guard { payload, target }
}

impl<P, T> Relevance for Guard<P, T>
where
    P: Fn() -> bool + Send + Sync,
    T: Fn() -> bool + Send + Sync,
{
    fn payload_current(&self) -> bool {
        (self.payload)()
    }

    fn target_current(&self) -> bool {
        (self.target)()
    }
}

/// Result of a guarded retry loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryOutcome<T> {
    /// An attempt succeeded
    Completed(T),
    /// Payload or target changed; nothing more was sent
    Superseded(Staleness),
    /// Attempt budget used up
    Exhausted(SignalingError),
    /// Error that retrying cannot fix
    Permanent(SignalingError),
}

impl<T> RetryOutcome<T> {
    /// Whether an attempt succeeded
    #[must_use]
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed(_))
    }
}

/// Run `op` until it succeeds, the budget is exhausted, an error is
/// permanent, or `relevance` reports the operation stale
///
/// `op` receives the 1-based attempt number.
pub async fn retry_while_current<T, R, F, Fut>(
    label: &'static str,
    policy: &RetryPolicy,
    relevance: &R,
    mut op: F,
) -> RetryOutcome<T>
where
    R: Relevance + ?Sized,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, SignalingError>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        if let Some(staleness) = relevance.staleness() {
            tracing::warn!(label, attempt, ?staleness, "Superseded before attempt, stopping");
            return RetryOutcome::Superseded(staleness);
        }

        tracing::debug!(label, attempt, "Attempt");
        let error = match op(attempt).await {
            Ok(value) => return RetryOutcome::Completed(value),
            Err(error) => error,
        };

        if let Some(staleness) = relevance.staleness() {
            tracing::warn!(label, attempt, ?staleness, error = %error, "Failed after being superseded, stopping");
            return RetryOutcome::Superseded(staleness);
        }
        if error.is_permanent() {
            tracing::error!(label, attempt, error = %error, "Permanent error, not retrying");
            return RetryOutcome::Permanent(error);
        }
        if attempt >= policy.max_attempts() {
            tracing::error!(label, attempt, error = %error, "Retries exhausted");
            return RetryOutcome::Exhausted(error);
        }

        let delay = policy.delay_after(attempt);
        tracing::warn!(
            label,
            attempt,
            backoff_ms = delay.as_millis() as u64,
            error = %error,
            "Attempt failed, backing off"
        );
        tokio::time::sleep(delay).await;
    }
}
