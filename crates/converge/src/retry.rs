use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};

fn default_max_attempts() -> u32 {
    3
}

fn default_delay_ms() -> u64 {
    2000
}

fn default_max_delay_ms() -> u64 {
    60_000
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Backoff {
    #[default]
    Fixed,
    Exponential,
}

/// How many times `apply` may run in one pass, and how long to wait between tries.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,
    pub backoff: Backoff,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            delay_ms: default_delay_ms(),
            backoff: Backoff::Fixed,
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay_ms: delay.as_millis() as u64,
            ..Self::default()
        }
    }

    pub fn exponential(mut self) -> Self {
        self.backoff = Backoff::Exponential;
        self
    }

    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Delay to sleep after failed attempt number `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let base = self.delay_ms;
        let ms = match self.backoff {
            Backoff::Fixed => base,
            Backoff::Exponential => {
                let shift = attempt.saturating_sub(1).min(20);
                base.saturating_mul(1u64 << shift)
            }
        };
        Duration::from_millis(ms.min(self.max_delay_ms.max(base)))
    }
}

/// Result of driving an operation through a [`RetryPolicy`].
#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub attempts: u32,
    pub result: Result<T>,
}

/// Run `op` until it succeeds, the budget is spent, or it returns a
/// non-retryable error. `op` receives the 1-based attempt number.
///
/// `sleep` is called between attempts and may abort the loop by returning an
/// error (used for cancellation).
pub fn retry<T, F, S>(policy: &RetryPolicy, mut op: F, mut sleep: S) -> RetryOutcome<T>
where
    F: FnMut(u32) -> Result<T>,
    S: FnMut(Duration) -> Result<()>,
{
    let max = policy.attempts();
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op(attempt) {
            Ok(v) => {
                return RetryOutcome {
                    attempts: attempt,
                    result: Ok(v),
                };
            }
            Err(e) => {
                if !e.is_retryable() || attempt >= max {
                    return RetryOutcome {
                        attempts: attempt,
                        result: Err(e),
                    };
                }
                tracing::debug!(attempt, max, error = %e, "attempt failed; retrying");
                if let Err(stop) = sleep(policy.delay_after(attempt)) {
                    return RetryOutcome {
                        attempts: attempt,
                        result: Err(stop),
                    };
                }
            }
        }
    }
}

/// Sleep in small slices so a cancellation flag is noticed promptly.
pub fn interruptible_sleep(d: Duration, cancelled: impl Fn() -> bool) -> Result<()> {
    const SLICE: Duration = Duration::from_millis(50);
    let mut left = d;
    while !left.is_zero() {
        if cancelled() {
            return Err(Error::cancelled());
        }
        let step = left.min(SLICE);
        std::thread::sleep(step);
        left = left.saturating_sub(step);
    }
    if cancelled() {
        return Err(Error::cancelled());
    }
    Ok(())
}
