//! Retry helpers with exponential backoff and jitter.
//!
//! Wraps idempotent operations that must eventually succeed (kernel calls,
//! API writes) and retries them forever with a doubling, capped, jittered
//! delay. Callers that need to give up must race the returned future against
//! their own cancellation signal.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::error;

const DEFAULT_BACKOFF_MIN: Duration = Duration::from_secs(2);
const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(60);

/// Exponential backoff state.
///
/// Each call to [`Backoff::duration`] returns the delay for the next attempt:
/// `min * 2^attempts`, capped at `max`, multiplied by a uniform factor in
/// `[0.5, 1.5]` when jitter is enabled.
#[derive(Clone, Debug)]
pub struct Backoff {
    /// Delay for the first failed attempt
    pub min: Duration,
    /// Upper bound for the computed delay (before jitter)
    pub max: Duration,
    /// Randomize the delay to avoid thundering herds
    pub jitter: bool,
    attempts: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            min: DEFAULT_BACKOFF_MIN,
            max: DEFAULT_BACKOFF_MAX,
            jitter: true,
            attempts: 0,
        }
    }
}

impl Backoff {
    /// Create a backoff with explicit bounds
    pub fn new(min: Duration, max: Duration, jitter: bool) -> Self {
        Self {
            min,
            max,
            jitter,
            attempts: 0,
        }
    }

    /// Return the delay for the current attempt and advance the counter
    pub fn duration(&mut self) -> Duration {
        let exp = self.min.as_secs_f64() * 2f64.powi(self.attempts.min(63) as i32);
        let capped = exp.min(self.max.as_secs_f64());
        self.attempts = self.attempts.saturating_add(1);
        if self.jitter {
            let factor = rand::thread_rng().gen_range(0.5..1.5);
            Duration::from_secs_f64(capped * factor)
        } else {
            Duration::from_secs_f64(capped)
        }
    }

    /// Rewind the backoff to its initial delay
    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}

/// Retry an async operation until it succeeds.
///
/// The backoff is reset on entry and advanced on every failure. There is no
/// attempt cap: the operation must be idempotent and eventually succeed or be
/// externally cancelled.
pub async fn retry_with_backoff<F, Fut, E>(mut op: F, backoff: &mut Backoff, description: &str)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), E>>,
    E: Display,
{
    backoff.reset();
    loop {
        match op().await {
            Ok(()) => return,
            Err(e) => {
                let delay = backoff.duration();
                error!(
                    description = %description,
                    error = %e,
                    backoff_ms = delay.as_millis(),
                    "Retry failed"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Retry with the default 2s..60s jittered backoff
pub async fn retry_with_default_backoff<F, Fut, E>(op: F, description: &str)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), E>>,
    E: Display,
{
    let mut backoff = Backoff::default();
    retry_with_backoff(op, &mut backoff, description).await;
}
