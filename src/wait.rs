//! Poll-until-condition helper shared by every blocking wait.
//!
//! A [`Waiter`] polls on a fixed interval. Probe errors are treated as
//! transient and polling continues; only an explicit [`Probe::Failed`] or an
//! exhausted attempt ceiling ends the wait early.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::time::sleep;

/// Outcome of one poll.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Probe<T> {
    /// The awaited condition holds.
    Ready(T),
    /// Not yet; poll again.
    Pending,
    /// The condition can never hold.
    Failed(String),
}

/// Errors raised when a wait ends without the condition holding.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum WaitError {
    /// Raised when the attempt ceiling is reached.
    #[error(
        "gave up waiting for {what} after {attempts} attempts{}",
        last_error_suffix(.last_error.as_deref())
    )]
    Exhausted {
        /// Description of the awaited condition.
        what: String,
        /// Number of probes issued.
        attempts: u32,
        /// Most recent transient error, if any.
        last_error: Option<String>,
    },
    /// Raised when the probe reports a terminal failure.
    #[error("{what} failed: {reason}")]
    Failed {
        /// Description of the awaited condition.
        what: String,
        /// Reason reported by the probe.
        reason: String,
    },
}

fn last_error_suffix(last_error: Option<&str>) -> String {
    last_error.map_or_else(String::new, |err| format!(" (last error: {err})"))
}

/// Fixed-interval poller with an optional attempt ceiling.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Waiter {
    interval: Duration,
    max_attempts: Option<u32>,
}

impl Waiter {
    /// Creates an unbounded waiter polling every `interval`.
    #[must_use]
    pub const fn new(interval: Duration) -> Self {
        Self {
            interval,
            max_attempts: None,
        }
    }

    /// Caps the number of probes. `None` polls until the condition holds.
    #[must_use]
    pub const fn with_max_attempts(mut self, max_attempts: Option<u32>) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Returns the poll interval.
    #[must_use]
    pub const fn interval(&self) -> Duration {
        self.interval
    }

    /// Returns the attempt ceiling.
    #[must_use]
    pub const fn max_attempts(&self) -> Option<u32> {
        self.max_attempts
    }

    /// Polls `probe` until it reports [`Probe::Ready`].
    ///
    /// # Errors
    ///
    /// Returns [`WaitError::Failed`] when the probe reports a terminal failure
    /// and [`WaitError::Exhausted`] when the attempt ceiling is reached.
    pub async fn until<T, E, F, Fut>(&self, what: &str, mut probe: F) -> Result<T, WaitError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Probe<T>, E>>,
        E: Display,
    {
        let mut attempts: u32 = 0;
        let mut last_error = None;
        loop {
            attempts = attempts.saturating_add(1);
            match probe().await {
                Ok(Probe::Ready(value)) => return Ok(value),
                Ok(Probe::Pending) => {}
                Ok(Probe::Failed(reason)) => {
                    return Err(WaitError::Failed {
                        what: what.to_owned(),
                        reason,
                    });
                }
                Err(err) => {
                    tracing::debug!(
                        what,
                        attempts,
                        error = %err,
                        "transient read failure while waiting"
                    );
                    last_error = Some(err.to_string());
                }
            }

            if self.max_attempts.is_some_and(|max| attempts >= max) {
                return Err(WaitError::Exhausted {
                    what: what.to_owned(),
                    attempts,
                    last_error,
                });
            }
            sleep(self.interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn fast() -> Waiter {
        Waiter::new(Duration::from_millis(1))
    }

    #[tokio::test]
    async fn transient_errors_keep_polling() {
        let calls = Cell::new(0_u32);
        let value = fast()
            .until("counter", || {
                calls.set(calls.get() + 1);
                let current = calls.get();
                async move {
                    match current {
                        1 => Err("unavailable"),
                        2 => Ok(Probe::Pending),
                        _ => Ok(Probe::Ready(current)),
                    }
                }
            })
            .await
            .expect("wait should succeed");
        assert_eq!(value, 3);
    }

    #[tokio::test]
    async fn ceiling_reports_last_error() {
        let err = fast()
            .with_max_attempts(Some(2))
            .until("never", || async { Err::<Probe<()>, _>("boom") })
            .await
            .expect_err("ceiling should stop the wait");
        assert_eq!(
            err,
            WaitError::Exhausted {
                what: String::from("never"),
                attempts: 2,
                last_error: Some(String::from("boom")),
            }
        );
        assert!(err.to_string().contains("last error: boom"));
    }

    #[tokio::test]
    async fn failed_state_stops_immediately() {
        let err = fast()
            .until("image", || async {
                Ok::<_, String>(Probe::<()>::Failed(String::from("error state")))
            })
            .await
            .expect_err("failure should end the wait");
        assert!(matches!(err, WaitError::Failed { .. }));
    }
}
