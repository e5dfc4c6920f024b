//! Command execution through the session broker.
//!
//! Commands are submitted and then polled with exponential backoff until the
//! broker reports a terminal state or the per-invocation deadline passes. A
//! timeout is final; re-running is the caller's decision. Multi-target runs
//! use a fixed-size pool of tokio tasks and always report every target.

mod backoff;

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio::time::{Instant, sleep_until, timeout_at};
use tracing::{debug, info, warn};

use crate::cloud::{InvocationState, InvocationStatus, RemoteCommand, SessionBroker};

pub use backoff::PollPolicy;

use backoff::Backoff;

/// Output of a command that exited with status zero.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandOutcome {
    /// Instance the command ran on.
    pub target: String,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

/// Errors raised while running a command on one target.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ExecError {
    /// Raised when the command could not be delivered or observed.
    #[error("command on {target} failed: {message}")]
    Execution {
        /// Instance identifier.
        target: String,
        /// Description of the transport failure.
        message: String,
    },
    /// Raised when the command ran and exited non-zero.
    #[error("command on {target} exited with status {}: {}", code_text(.code), .stderr.trim())]
    RemoteExit {
        /// Instance identifier.
        target: String,
        /// Exit status, when the agent reported one.
        code: Option<i32>,
        /// Captured standard output.
        stdout: String,
        /// Captured standard error.
        stderr: String,
    },
    /// Raised when the command did not finish in time.
    #[error("command on {target} timed out after {}s", .waited.as_secs())]
    Timeout {
        /// Instance identifier.
        target: String,
        /// Deadline that elapsed.
        waited: Duration,
    },
}

fn code_text(code: &Option<i32>) -> String {
    code.map_or_else(|| String::from("unknown"), |value| value.to_string())
}

impl ExecError {
    /// Instance the error refers to.
    #[must_use]
    pub fn target(&self) -> &str {
        match self {
            Self::Execution { target, .. }
            | Self::RemoteExit { target, .. }
            | Self::Timeout { target, .. } => target,
        }
    }
}

/// Outcome of one target within a multi-target run.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TargetOutcome {
    /// Instance identifier.
    pub target: String,
    /// Result for this target.
    pub result: Result<CommandOutcome, ExecError>,
}

/// Per-target outcomes of [`CommandExecutor::run_many`], in target order.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RunManyReport {
    /// One outcome per requested target.
    pub outcomes: Vec<TargetOutcome>,
}

impl RunManyReport {
    /// Number of targets that succeeded.
    #[must_use]
    pub fn succeeded(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|outcome| outcome.result.is_ok())
            .count()
    }

    /// Number of targets that failed.
    #[must_use]
    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.succeeded()
    }

    /// Converts the report into a result that fails when any target failed.
    ///
    /// # Errors
    ///
    /// Returns [`PartialFailure`] carrying the full report when at least one
    /// target failed.
    pub fn into_result(self) -> Result<Self, PartialFailure> {
        if self.failed() == 0 {
            Ok(self)
        } else {
            Err(PartialFailure { report: self })
        }
    }
}

/// Aggregate failure of a multi-target operation.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("{} of {} targets failed", .report.failed(), .report.outcomes.len())]
pub struct PartialFailure {
    /// Every target's outcome, successful or not.
    pub report: RunManyReport,
}

impl PartialFailure {
    /// Returns `true` when at least one target succeeded.
    #[must_use]
    pub fn is_partial(&self) -> bool {
        self.report.succeeded() > 0
    }
}

/// Runs commands through a [`SessionBroker`].
pub struct CommandExecutor<B> {
    broker: Arc<B>,
    policy: PollPolicy,
}

impl<B> Clone for CommandExecutor<B> {
    fn clone(&self) -> Self {
        Self {
            broker: Arc::clone(&self.broker),
            policy: self.policy,
        }
    }
}

impl<B> fmt::Debug for CommandExecutor<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandExecutor")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl<B: SessionBroker + 'static> CommandExecutor<B> {
    /// Creates an executor with the default poll policy.
    #[must_use]
    pub fn new(broker: Arc<B>) -> Self {
        Self::with_policy(broker, PollPolicy::default())
    }

    /// Creates an executor with an explicit poll policy.
    #[must_use]
    pub const fn with_policy(broker: Arc<B>, policy: PollPolicy) -> Self {
        Self { broker, policy }
    }

    /// Runs `command` on `target`, waiting at most `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`ExecError::RemoteExit`] for a non-zero exit status,
    /// [`ExecError::Timeout`] when the deadline passes, and
    /// [`ExecError::Execution`] for delivery failures.
    pub async fn run(
        &self,
        target: &str,
        command: &RemoteCommand,
        timeout: Duration,
    ) -> Result<CommandOutcome, ExecError> {
        let deadline = Instant::now() + timeout;
        let timed_out = || ExecError::Timeout {
            target: target.to_owned(),
            waited: timeout,
        };
        let transport = |message: String| ExecError::Execution {
            target: target.to_owned(),
            message,
        };

        let handle = timeout_at(deadline, self.broker.send_command(target, command))
            .await
            .map_err(|_| timed_out())?
            .map_err(|err| transport(err.to_string()))?;
        debug!(target, command_id = %handle.command_id, "command submitted");

        let mut backoff = Backoff::new(&self.policy);
        let mut poll_failures = 0;
        loop {
            match timeout_at(deadline, self.broker.poll_command(&handle)).await {
                Err(_) => return Err(timed_out()),
                Ok(Ok(status)) if status.state.is_terminal() => {
                    return finish(target, status, timeout);
                }
                Ok(Ok(status)) => {
                    poll_failures = 0;
                    debug!(target, command_id = %handle.command_id, state = ?status.state, "command still running");
                }
                Ok(Err(err)) => {
                    poll_failures += 1;
                    if poll_failures >= self.policy.max_poll_failures {
                        return Err(transport(err.to_string()));
                    }
                    debug!(target, error = %err, "poll failed; retrying");
                }
            }

            let wake = (Instant::now() + backoff.next_delay()).min(deadline);
            sleep_until(wake).await;
            if Instant::now() >= deadline {
                return Err(timed_out());
            }
        }
    }

    /// Runs `command` on every target with at most `concurrency` in flight.
    ///
    /// One target's failure never cancels the others; the report lists an
    /// outcome for every target in the order given.
    pub async fn run_many(
        &self,
        targets: &[String],
        command: &RemoteCommand,
        timeout: Duration,
        concurrency: usize,
    ) -> RunManyReport {
        let workers = concurrency.clamp(1, targets.len().max(1));
        let queue = Arc::new(Mutex::new(
            targets.iter().cloned().enumerate().collect::<VecDeque<_>>(),
        ));
        info!(targets = targets.len(), workers, "running command on multiple targets");

        let mut pool = JoinSet::new();
        for _ in 0..workers {
            let worker_queue = Arc::clone(&queue);
            let executor = self.clone();
            let worker_command = command.clone();
            pool.spawn(async move {
                let mut finished = Vec::new();
                loop {
                    let next = worker_queue.lock().await.pop_front();
                    let Some((index, target)) = next else {
                        break;
                    };
                    let result = executor.run(&target, &worker_command, timeout).await;
                    finished.push((index, TargetOutcome { target, result }));
                }
                finished
            });
        }

        let mut slots = targets.iter().map(|_| None).collect::<Vec<Option<TargetOutcome>>>();
        while let Some(joined) = pool.join_next().await {
            match joined {
                Ok(finished) => {
                    for (index, outcome) in finished {
                        if let Some(slot) = slots.get_mut(index) {
                            *slot = Some(outcome);
                        }
                    }
                }
                Err(err) => warn!(error = %err, "command worker stopped unexpectedly"),
            }
        }

        let outcomes = slots
            .into_iter()
            .zip(targets)
            .map(|(slot, target)| {
                slot.unwrap_or_else(|| TargetOutcome {
                    target: target.clone(),
                    result: Err(ExecError::Execution {
                        target: target.clone(),
                        message: String::from("worker stopped before reporting a result"),
                    }),
                })
            })
            .collect();
        RunManyReport { outcomes }
    }
}

fn finish(
    target: &str,
    status: InvocationStatus,
    timeout: Duration,
) -> Result<CommandOutcome, ExecError> {
    match status.state {
        InvocationState::Success if status.exit_code.unwrap_or(0) == 0 => Ok(CommandOutcome {
            target: target.to_owned(),
            stdout: status.stdout,
            stderr: status.stderr,
        }),
        InvocationState::Success | InvocationState::Failed => Err(ExecError::RemoteExit {
            target: target.to_owned(),
            code: status.exit_code,
            stdout: status.stdout,
            stderr: status.stderr,
        }),
        InvocationState::TimedOut => Err(ExecError::Timeout {
            target: target.to_owned(),
            waited: timeout,
        }),
        other => Err(ExecError::Execution {
            target: target.to_owned(),
            message: format!("command ended in state {other:?}"),
        }),
    }
}
