//! Retry-with-backoff strategies.
//!
//! Two strategies guard the orchestrator's contended paths:
//! - Recording a state change, where concurrent writers race on the same
//!   event key
//! - Polling whether every job and ingestion for a commit has finished,
//!   where the store is only eventually consistent

use std::future::Future;
use std::time::Duration;

use anyhow::Result;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::error::EventStoreError;

/// Wait schedule between attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelaySchedule {
    /// No wait between attempts
    Immediate,

    /// Wait `base * attempt^exponent` before every attempt after the first
    Polynomial { base: Duration, exponent: u32 },
}

impl DelaySchedule {
    /// Wait before `attempt` (1-indexed); the first attempt never waits
    pub fn delay_before_attempt(&self, attempt: u32) -> Duration {
        match *self {
            Self::Immediate => Duration::ZERO,
            Self::Polynomial { .. } if attempt <= 1 => Duration::ZERO,
            Self::Polynomial { base, exponent } => {
                base.saturating_mul(attempt.saturating_pow(exponent))
            }
        }
    }

    /// Sum of all waits across `max_attempts` attempts
    pub fn total_delay(&self, max_attempts: u32) -> Duration {
        (1..=max_attempts)
            .map(|attempt| self.delay_before_attempt(attempt))
            .fold(Duration::ZERO, Duration::saturating_add)
    }
}

/// A retry policy
pub trait BackoffStrategy {
    /// Value the retried operation produces
    type Output;

    /// Human-readable strategy name (for logs)
    fn name(&self) -> &'static str;

    /// Maximum number of attempts (including the first)
    fn max_attempts(&self) -> u32;

    /// Wait before `attempt` (1-indexed)
    fn delay_before_attempt(&self, attempt: u32) -> Duration;

    /// Whether an outcome warrants another attempt
    fn should_retry(&self, outcome: &Result<Self::Output>) -> bool;
}

/// Run `operation` until `strategy` stops retrying or attempts run out.
///
/// The last outcome is returned as-is, whether it is a value or an error.
pub async fn run_with_backoff<S, F, Fut>(strategy: &S, mut operation: F) -> Result<S::Output>
where
    S: BackoffStrategy + ?Sized,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<S::Output>>,
{
    let max_attempts = strategy.max_attempts().max(1);
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        let delay = strategy.delay_before_attempt(attempt);
        if !delay.is_zero() {
            debug!(
                strategy = strategy.name(),
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Backing off before retry"
            );
            tokio::time::sleep(delay).await;
        }

        let outcome = operation().await;

        if !strategy.should_retry(&outcome) {
            return outcome;
        }

        if attempt >= max_attempts {
            warn!(
                strategy = strategy.name(),
                attempts = attempt,
                "Backoff attempts exhausted"
            );
            return outcome;
        }

        if let Err(ref e) = outcome {
            warn!(strategy = strategy.name(), attempt, error = %e, "Attempt failed, retrying");
        }
    }
}

/// Retries persisting a state change.
///
/// Waits are randomized so competing writers spread out. An out-of-order
/// rejection aborts at once: a newer change already exists and retrying the
/// same write can never succeed.
#[derive(Debug, Clone)]
pub struct EventStoreRecorderBackoffStrategy {
    max_attempts: u32,
    schedule: DelaySchedule,
}

impl EventStoreRecorderBackoffStrategy {
    pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
    pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(100);
    pub const DEFAULT_EXPONENT: u32 = 2;

    pub fn new(max_attempts: u32, schedule: DelaySchedule) -> Self {
        Self {
            max_attempts,
            schedule,
        }
    }

    /// Record the change; `Ok(false)` counts as a failed attempt
    pub async fn run<F, Fut>(&self, operation: F) -> Result<bool>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<bool>>,
    {
        run_with_backoff(self, operation).await
    }
}

impl Default for EventStoreRecorderBackoffStrategy {
    fn default() -> Self {
        Self::new(
            Self::DEFAULT_MAX_ATTEMPTS,
            DelaySchedule::Polynomial {
                base: Self::DEFAULT_BASE_DELAY,
                exponent: Self::DEFAULT_EXPONENT,
            },
        )
    }
}

impl BackoffStrategy for EventStoreRecorderBackoffStrategy {
    type Output = bool;

    fn name(&self) -> &'static str {
        "event_store_recorder"
    }

    fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    fn delay_before_attempt(&self, attempt: u32) -> Duration {
        let ceiling = self.schedule.delay_before_attempt(attempt);
        if ceiling.is_zero() {
            return ceiling;
        }

        // Full jitter: anywhere between zero and the schedule's wait
        let millis = rand::thread_rng().gen_range(0..=ceiling.as_millis() as u64);
        Duration::from_millis(millis)
    }

    fn should_retry(&self, outcome: &Result<bool>) -> bool {
        match outcome {
            Ok(recorded) => !recorded,
            Err(e) => !EventStoreError::is_out_of_order_error(e),
        }
    }
}

/// Whether a commit's coverage can be finalised
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Readiness {
    /// Every constituent event has reached a terminal state
    Ready,

    /// Something is still in progress (or nothing has been seen yet)
    NotReady,
}

impl Readiness {
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }
}

/// Polls the finalisation check while it reports [`Readiness::NotReady`].
///
/// Errors are not retried. Exhausting the attempts returns the last
/// `NotReady` to the caller rather than failing.
#[derive(Debug, Clone)]
pub struct ReadyToFinaliseBackoffStrategy {
    max_attempts: u32,
    schedule: DelaySchedule,
}

impl ReadyToFinaliseBackoffStrategy {
    pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
    pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(100);
    pub const DEFAULT_EXPONENT: u32 = 2;

    pub fn new(max_attempts: u32, schedule: DelaySchedule) -> Self {
        Self {
            max_attempts,
            schedule,
        }
    }

    /// Worst-case time spent waiting between polls
    pub fn max_total_delay(&self) -> Duration {
        self.schedule.total_delay(self.max_attempts)
    }

    pub async fn run<F, Fut>(&self, operation: F) -> Result<Readiness>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Readiness>>,
    {
        run_with_backoff(self, operation).await
    }
}

impl Default for ReadyToFinaliseBackoffStrategy {
    fn default() -> Self {
        Self::new(
            Self::DEFAULT_MAX_ATTEMPTS,
            DelaySchedule::Polynomial {
                base: Self::DEFAULT_BASE_DELAY,
                exponent: Self::DEFAULT_EXPONENT,
            },
        )
    }
}

impl BackoffStrategy for ReadyToFinaliseBackoffStrategy {
    type Output = Readiness;

    fn name(&self) -> &'static str {
        "ready_to_finalise"
    }

    fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    fn delay_before_attempt(&self, attempt: u32) -> Duration {
        self.schedule.delay_before_attempt(attempt)
    }

    fn should_retry(&self, outcome: &Result<Readiness>) -> bool {
        matches!(outcome, Ok(Readiness::NotReady))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_polynomial_schedule() {
        let schedule = DelaySchedule::Polynomial {
            base: Duration::from_millis(100),
            exponent: 2,
        };

        let delays: Vec<u64> = (1..=5)
            .map(|a| schedule.delay_before_attempt(a).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![0, 400, 900, 1600, 2500]);
        assert_eq!(schedule.total_delay(5), Duration::from_millis(5400));
    }

    #[test]
    fn test_immediate_schedule() {
        assert_eq!(DelaySchedule::Immediate.delay_before_attempt(3), Duration::ZERO);
        assert_eq!(DelaySchedule::Immediate.total_delay(10), Duration::ZERO);
    }

    #[test]
    fn test_recorder_jitter_within_schedule() {
        let strategy = EventStoreRecorderBackoffStrategy::default();

        assert_eq!(strategy.delay_before_attempt(1), Duration::ZERO);
        for _ in 0..50 {
            assert!(strategy.delay_before_attempt(2) <= Duration::from_millis(400));
            assert!(strategy.delay_before_attempt(3) <= Duration::from_millis(900));
        }
    }

    #[test]
    fn test_recorder_retry_predicate() {
        let strategy = EventStoreRecorderBackoffStrategy::default();

        assert!(!strategy.should_retry(&Ok(true)));
        assert!(strategy.should_retry(&Ok(false)));
        assert!(strategy.should_retry(&Err(anyhow::anyhow!("throttled"))));
        assert!(!strategy.should_retry(&Err(anyhow::Error::new(
            EventStoreError::OutOfOrderEvent {
                event_key: "key".to_string(),
                version: 1,
            }
        ))));
    }

    #[test]
    fn test_finalise_retry_predicate() {
        let strategy = ReadyToFinaliseBackoffStrategy::default();

        assert!(strategy.should_retry(&Ok(Readiness::NotReady)));
        assert!(!strategy.should_retry(&Ok(Readiness::Ready)));
        assert!(!strategy.should_retry(&Err(anyhow::anyhow!("store unavailable"))));
        assert_eq!(strategy.max_total_delay(), Duration::from_millis(5400));
    }
}
