//! Background watch over a spot request's interruption signal.
//!
//! One monitor runs per live spot-backed instance. It polls the request
//! status on a fixed interval and, on `marked-for-termination`, runs the
//! save-and-terminate callback exactly once. Any status outside
//! `fulfilled`/`terminated-by-user`, including a request that can no longer
//! be found, ends the watch quietly. The monitor only knows the machine's
//! name, never a live handle.

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::provider::{Provider, SpotStatus};

/// Default number of consecutive failed reads tolerated before giving up.
pub const DEFAULT_MAX_READ_FAILURES: u32 = 12;

/// Monitor states.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MonitorState {
    /// Polling the request status.
    Watching,
    /// Interruption notice seen; the callback runs next.
    Triggered,
    /// Nothing left to watch.
    Gone,
    /// Callback completed.
    Done,
}

impl MonitorState {
    /// State reached from `watching` after reading `status`.
    #[must_use]
    pub const fn on_status(status: &SpotStatus) -> Self {
        match status {
            SpotStatus::MarkedForTermination => Self::Triggered,
            SpotStatus::Fulfilled | SpotStatus::TerminatedByUser => Self::Watching,
            _ => Self::Gone,
        }
    }

    /// Returns `true` for states the loop exits from.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Gone | Self::Done)
    }
}

/// How a monitor task ended.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum MonitorExit {
    /// The callback ran and succeeded.
    Done,
    /// The callback ran and failed. The failure is logged, not propagated.
    CallbackFailed {
        /// Rendered callback error.
        message: String,
    },
    /// The request ended without an interruption notice.
    Gone {
        /// Why watching stopped.
        reason: String,
    },
    /// The foreground asked the monitor to stop.
    Cancelled,
    /// The task panicked or was aborted.
    Aborted {
        /// Join error text.
        message: String,
    },
}

/// Configuration for one monitor.
#[derive(Debug)]
pub struct InterruptionMonitor<P> {
    provider: Arc<P>,
    request_id: String,
    name: String,
    poll_interval: Duration,
    max_read_failures: u32,
}

impl<P: Provider + 'static> InterruptionMonitor<P> {
    /// Watches `request_id` for the machine called `name`.
    #[must_use]
    pub fn new(provider: Arc<P>, request_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            provider,
            request_id: request_id.into(),
            name: name.into(),
            poll_interval: Duration::from_secs(5),
            max_read_failures: DEFAULT_MAX_READ_FAILURES,
        }
    }

    /// Overrides the poll interval.
    #[must_use]
    pub const fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Overrides how many consecutive failed reads end the watch.
    #[must_use]
    pub const fn with_max_read_failures(mut self, max_read_failures: u32) -> Self {
        self.max_read_failures = max_read_failures;
        self
    }

    /// Starts the polling task. `on_interrupt` receives the machine name.
    ///
    /// The handle's cancellation token is cancelled when the task exits,
    /// whatever the exit reason.
    pub fn spawn<F, Fut, E>(self, on_interrupt: F) -> MonitorHandle
    where
        F: FnOnce(String) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let finished = cancel.clone();
        let task = tokio::spawn(async move {
            let exit = self.run(token, on_interrupt).await;
            finished.cancel();
            exit
        });
        MonitorHandle { cancel, task }
    }

    async fn run<F, Fut, E>(self, token: CancellationToken, on_interrupt: F) -> MonitorExit
    where
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: Display,
    {
        let name = self.name.as_str();
        let request_id = self.request_id.as_str();
        tracing::info!(name, request_id, "interruption monitor started");
        let mut failures: u32 = 0;
        loop {
            let read = tokio::select! {
                () = token.cancelled() => return self.cancelled(),
                read = self.provider.describe_spot_request(request_id) => read,
            };
            let (state, status) = match read {
                Ok(Some(record)) => {
                    failures = 0;
                    (MonitorState::on_status(&record.status), record.status)
                }
                Ok(None) => (MonitorState::Gone, SpotStatus::NotFound),
                Err(err) => {
                    failures = failures.saturating_add(1);
                    tracing::warn!(
                        name,
                        request_id,
                        failures,
                        error = %err,
                        "spot status read failed"
                    );
                    if failures > self.max_read_failures {
                        return self.gone(format!("status unreadable after {failures} attempts"));
                    }
                    (MonitorState::Watching, SpotStatus::Other(String::from("unknown")))
                }
            };

            match state {
                MonitorState::Watching => {}
                MonitorState::Triggered => {
                    tracing::warn!(name, request_id, "interruption notice received; saving");
                    return match on_interrupt(self.name.clone()).await {
                        Ok(()) => {
                            tracing::info!(name, "interruption handled");
                            MonitorExit::Done
                        }
                        Err(err) => {
                            tracing::error!(name, error = %err, "save after interruption failed");
                            MonitorExit::CallbackFailed {
                                message: err.to_string(),
                            }
                        }
                    };
                }
                MonitorState::Gone | MonitorState::Done => {
                    return self.gone(format!("request status {status}"));
                }
            }

            tokio::select! {
                () = token.cancelled() => return self.cancelled(),
                () = sleep(self.poll_interval) => {}
            }
        }
    }

    fn gone(&self, reason: String) -> MonitorExit {
        tracing::info!(
            name = %self.name,
            request_id = %self.request_id,
            %reason,
            "interruption monitor exiting"
        );
        MonitorExit::Gone { reason }
    }

    fn cancelled(&self) -> MonitorExit {
        tracing::debug!(name = %self.name, "interruption monitor cancelled");
        MonitorExit::Cancelled
    }
}

/// Handle to a running monitor task.
#[derive(Debug)]
pub struct MonitorHandle {
    cancel: CancellationToken,
    task: JoinHandle<MonitorExit>,
}

impl MonitorHandle {
    /// Asks the task to stop at its next poll boundary. A callback already
    /// running is not interrupted.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Token that cancels this monitor.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Returns `true` once the task has exited.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Waits for the task to exit on its own.
    pub async fn join(self) -> MonitorExit {
        self.task
            .await
            .unwrap_or_else(|err| MonitorExit::Aborted {
                message: err.to_string(),
            })
    }

    /// Cancels the task and waits for it to exit.
    pub async fn shutdown(self) -> MonitorExit {
        self.cancel();
        self.join().await
    }
}

#[cfg(test)]
mod tests;
