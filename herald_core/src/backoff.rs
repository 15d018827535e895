use self::config::BackoffConfig;
use backoff::backoff::Backoff as InnerBackoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use parking_lot::Mutex as SyncMutex;
use std::num::NonZeroU32;
use std::time::Duration;
use thiserror::Error;

pub mod config;

/// Paces repeated attempts of a fallible operation with an exponentially
/// growing, randomized delay, and counts the attempts.
///
/// When the [config](BackoffConfig) sets a maximum number of attempts, the
/// backoff refuses to schedule another attempt once that many were made and
/// returns [`BackoffExhausted`] instead. A [`reset`](Backoff::reset) (after a
/// success) starts counting from zero again.
pub struct Backoff {
    state: SyncMutex<BackoffState>,
    max_attempts: Option<NonZeroU32>,
}

struct BackoffState {
    exponential: ExponentialBackoff,
    attempts: u32,
    max_interval: Duration,
}

/// Returned once a [`Backoff`] has scheduled its maximum number of attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("gave up after {attempts} attempts")]
pub struct BackoffExhausted {
    /// How many attempts were made before giving up.
    pub attempts: u32,
}

impl Backoff {
    /// Builds a new [`Backoff`] from the given [`BackoffConfig`].
    pub fn new(config: impl AsRef<BackoffConfig>) -> Self {
        let config = config.as_ref();
        let exponential = ExponentialBackoffBuilder::new()
            .with_initial_interval(config.initial_interval())
            .with_max_interval(config.max_interval())
            .with_randomization_factor(config.randomization_factor())
            .with_multiplier(config.multiplier())
            .with_max_elapsed_time(None)
            .build();

        Self {
            state: SyncMutex::new(BackoffState {
                exponential,
                attempts: 0,
                max_interval: config.max_interval(),
            }),
            max_attempts: config.max_attempts(),
        }
    }

    /// Reports how many attempts were scheduled since the last reset.
    pub fn attempts(&self) -> u32 {
        self.state.lock().attempts
    }

    /// Schedules the next attempt: returns the delay to wait before making it,
    /// or [`BackoffExhausted`] if the attempt limit is reached.
    pub fn next(&self) -> Result<Duration, BackoffExhausted> {
        let mut state = self.state.lock();

        if let Some(max_attempts) = self.max_attempts {
            if state.attempts >= max_attempts.get() {
                return Err(BackoffExhausted {
                    attempts: state.attempts,
                });
            }
        }

        state.attempts += 1;
        let fallback = state.max_interval;

        Ok(state.exponential.next_backoff().unwrap_or(fallback))
    }

    /// Sleeps for the next delay and returns the number of the attempt that may
    /// now be made (starting at 1).
    pub async fn sleep_next(&self) -> Result<u32, BackoffExhausted> {
        let delay = self.next()?;

        tokio::time::sleep(delay).await;

        Ok(self.attempts())
    }

    /// Starts over: the delay drops back to the initial interval and the
    /// attempt counter to zero.
    pub fn reset(&self) {
        let mut state = self.state.lock();

        state.exponential.reset();
        state.attempts = 0;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(BackoffConfig::default())
    }
}
