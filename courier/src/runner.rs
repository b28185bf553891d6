/// Runner module: executes a delivery task with a bounded, fixed-delay retry policy.
///
/// A `Runner` holds only its policy (`max_attempts`, `retry_delay`). Every call to
/// `execute` starts from a fresh attempt counter, so one runner can serve any number
/// of tasks one after another.
use crate::client::RequestError;
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// One attempt of a unit of retryable work. Called once per attempt.
pub type Task = Box<dyn FnMut() -> BoxFuture<'static, Result<(), RequestError>> + Send>;

/// Reasons a runner gives up on a task.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RunnerError {
    #[error("task is nil")]
    NilTask,

    /// Returned when the runner never got to invoke the task (zero attempts configured).
    #[error("task failed")]
    TaskFailed,

    #[error("runner cancelled")]
    Cancelled,

    #[error(transparent)]
    Request(#[from] RequestError),
}

/// Result of `Runner::execute`.
///
/// `attempts` is the zero-based index of the attempt that succeeded, or the
/// configured maximum when every attempt failed. Cancellation reports 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub attempts: u32,
    pub error: Option<RunnerError>,
}

impl Outcome {
    fn succeeded(attempts: u32) -> Self {
        Self {
            attempts,
            error: None,
        }
    }

    fn failed(attempts: u32, error: RunnerError) -> Self {
        Self {
            attempts,
            error: Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

#[async_trait]
pub trait Runner: Send + Sync {
    async fn execute(&self, cancel: &CancellationToken, task: Option<Task>) -> Outcome;
}

/// Creates runners for a pool. Decorators wrap another builder to wrap its runners.
pub trait RunnerBuilder: Send + Sync {
    fn create_runner(&self) -> Box<dyn Runner>;
}

/// Runner retrying a failed task `max_attempts` times with `retry_delay` between attempts.
#[derive(Debug, Clone)]
pub struct RetryRunner {
    max_attempts: u32,
    retry_delay: Duration,
}

impl RetryRunner {
    pub fn new(max_attempts: u32, retry_delay: Duration) -> Self {
        Self {
            max_attempts,
            retry_delay,
        }
    }
}

#[async_trait]
impl Runner for RetryRunner {
    async fn execute(&self, cancel: &CancellationToken, task: Option<Task>) -> Outcome {
        let Some(mut task) = task else {
            return Outcome::failed(0, RunnerError::NilTask);
        };

        // with zero attempts the task is never called and this is what gets reported
        let mut last_error = RunnerError::TaskFailed;

        for attempt in 0..self.max_attempts {
            match task().await {
                Ok(()) => return Outcome::succeeded(attempt),
                Err(e) => last_error = RunnerError::Request(e),
            }

            // cancellation is only observed between attempts
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::debug!(attempt, "runner cancelled while waiting to retry");
                    return Outcome::failed(0, RunnerError::Cancelled);
                }
                _ = tokio::time::sleep(self.retry_delay) => {}
            }

            tracing::info!(attempt, error = %last_error, "retrying");
        }

        Outcome::failed(self.max_attempts, last_error)
    }
}

/// Builds `RetryRunner`s sharing one retry policy.
#[derive(Debug, Clone)]
pub struct FixedDelayBuilder {
    max_attempts: u32,
    retry_delay: Duration,
}

impl FixedDelayBuilder {
    pub fn new(max_attempts: u32, retry_delay: Duration) -> Self {
        Self {
            max_attempts,
            retry_delay,
        }
    }
}

impl RunnerBuilder for FixedDelayBuilder {
    fn create_runner(&self) -> Box<dyn Runner> {
        Box::new(RetryRunner::new(self.max_attempts, self.retry_delay))
    }
}
