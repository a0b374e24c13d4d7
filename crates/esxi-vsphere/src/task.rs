//! Task waiter: turns a remote asynchronous task into a bounded, synchronous
//! [`OperationResult`].
//!
//! The polling loop is driven by [`transition`], a pure function of the
//! previous state, the latest observation and the elapsed time. The async
//! [`TaskWaiter::wait`] only performs I/O and sleeps.

use crate::api::TaskApi;
use crate::error::VsphereError;
use crate::outcome::OperationResult;
use crate::types::*;

use serde_json::{json, Value};
use std::time::Duration;
use tokio::time::Instant;

/// Upper bound for a single retry delay.
const MAX_RETRY_BACKOFF: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq)]
pub enum WaitState {
    Initial,
    /// Task still queued/running; `failures` counts consecutive failed queries.
    Polling { failures: u32 },
    TerminalOk(Option<Value>),
    TerminalTimeout,
    TerminalError(OperationResult),
}

impl WaitState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::TerminalOk(_) | Self::TerminalTimeout | Self::TerminalError(_))
    }
}

/// One status query outcome.
#[derive(Debug, Clone)]
pub enum Observation {
    Status(TaskStatus),
    /// Query failed in a way that may clear up if repeated.
    TransientFailure(VsphereError),
    PermanentFailure(VsphereError),
}

impl Observation {
    pub fn from_query(result: Result<TaskStatus, VsphereError>) -> Self {
        match result {
            Ok(status) => Self::Status(status),
            Err(e) if e.is_transient() => Self::TransientFailure(e),
            Err(e) => Self::PermanentFailure(e),
        }
    }
}

/// Next state of the wait loop.
///
/// A terminal task state wins over an expired deadline, so a task that
/// finished just as the deadline passed is still reported as finished.
pub fn transition(
    state: &WaitState,
    observation: Observation,
    elapsed: Duration,
    timeout: Duration,
    max_retries: u32,
) -> WaitState {
    if state.is_terminal() {
        return state.clone();
    }
    let failures = match state {
        WaitState::Polling { failures } => *failures,
        _ => 0,
    };

    match observation {
        Observation::Status(status) => match status.state {
            TaskState::Succeeded => WaitState::TerminalOk(status.result),
            TaskState::Failed => WaitState::TerminalError(OperationResult::remote_error(
                status
                    .error
                    .unwrap_or_else(|| "Task failed without an error message".to_string()),
            )),
            TaskState::Queued | TaskState::Running if elapsed >= timeout => WaitState::TerminalTimeout,
            TaskState::Queued | TaskState::Running => WaitState::Polling { failures: 0 },
        },
        Observation::TransientFailure(e) => {
            if failures + 1 > max_retries {
                WaitState::TerminalError(OperationResult::remote_error(e.message))
            } else if elapsed >= timeout {
                WaitState::TerminalTimeout
            } else {
                WaitState::Polling { failures: failures + 1 }
            }
        }
        Observation::PermanentFailure(e) => WaitState::TerminalError(e.into()),
    }
}

/// Delay before retry number `attempt` (1-based): `base * 2^(attempt - 1)`,
/// capped.
pub fn retry_backoff(base: Duration, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
    base.saturating_mul(factor).min(MAX_RETRY_BACKOFF)
}

/// Blocks a caller on a remote task with a bounded timeout.
#[derive(Debug, Clone)]
pub struct TaskWaiter {
    config: CoordinationConfig,
}

impl TaskWaiter {
    pub fn new(config: CoordinationConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CoordinationConfig {
        &self.config
    }

    /// Wait until `task` succeeds, fails or `timeout_secs` (default from
    /// config) elapses. The remote task is never cancelled.
    pub async fn wait<A: TaskApi + ?Sized>(
        &self,
        api: &A,
        task: &TaskRef,
        timeout_secs: Option<u64>,
    ) -> OperationResult {
        let timeout = Duration::from_secs(timeout_secs.unwrap_or(self.config.task_timeout_secs));
        let poll = self.config.poll_interval();
        let base_backoff = Duration::from_millis(self.config.task_retry_backoff_ms);
        let start = Instant::now();

        log::debug!("Waiting up to {}s for task {task}", timeout.as_secs());

        let mut state = WaitState::Initial;
        let mut last: Option<TaskStatus> = None;
        loop {
            let result = api.task_status(task).await;
            if let Ok(status) = &result {
                last = Some(status.clone());
            }
            let observation = Observation::from_query(result);
            if let Observation::TransientFailure(e) = &observation {
                log::warn!("Status query for task {task} failed: {e}");
            }

            state = transition(&state, observation, start.elapsed(), timeout, self.config.task_query_retries);
            match &state {
                WaitState::TerminalOk(payload) => {
                    log::info!("Task {task} succeeded after {:?}", start.elapsed());
                    let result = OperationResult::ok(format!("Task {task} completed successfully"));
                    return match payload {
                        Some(p) => result.with_payload(p.clone()),
                        None => result,
                    };
                }
                WaitState::TerminalError(err) => {
                    log::info!("Task {task} ended with {:?}: {}", err.kind, err.message);
                    return err.clone();
                }
                WaitState::TerminalTimeout => {
                    log::warn!("Task {task} still pending after {}s", timeout.as_secs());
                    return OperationResult::timeout(format!(
                        "Task {task} did not finish within {}s",
                        timeout.as_secs()
                    ))
                    .with_payload(json!({
                        "task_id": task.id,
                        "last_state": last.as_ref().map(|s| s.state),
                        "progress": last.as_ref().and_then(|s| s.progress),
                    }));
                }
                WaitState::Initial | WaitState::Polling { .. } => {
                    let delay = match &state {
                        WaitState::Polling { failures } if *failures > 0 => retry_backoff(base_backoff, *failures),
                        _ => poll,
                    };
                    let remaining = timeout.saturating_sub(start.elapsed());
                    tokio::time::sleep(delay.min(remaining)).await;
                }
            }
        }
    }

    /// Finish a submitted mutation: immediate results pass straight through,
    /// task handles are awaited.
    pub async fn complete<A: TaskApi + ?Sized>(
        &self,
        api: &A,
        submitted: Submitted,
        timeout_secs: Option<u64>,
    ) -> OperationResult {
        match submitted {
            Submitted::Done(Some(payload)) => OperationResult::ok("Operation completed").with_payload(payload),
            Submitted::Done(None) => OperationResult::ok("Operation completed"),
            Submitted::Task(task) => self.wait(api, &task, timeout_secs).await,
        }
    }
}
