//! Capability traits for the external services the transfer engine drives.
//!
//! The engine never talks to a provider SDK directly. Each collaborator
//! (session broker, authorization store, object store, instance catalog) is a
//! narrow trait here; [`crate::aws::AwsCli`] implements all four by shelling
//! out to the `aws` CLI and [`crate::test_support::FakeCloud`] implements them
//! in memory.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use camino::Utf8Path;
use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;

use crate::instance::Instance;
use crate::runner::RunnerError;

/// Future returned by capability operations.
pub type CloudFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, CloudError>> + Send + 'a>>;

/// Errors raised by capability implementations.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum CloudError {
    /// Raised when the addressed resource does not exist.
    #[error("{resource} not found")]
    NotFound {
        /// Description of the missing resource.
        resource: String,
    },
    /// Raised when the provider CLI returns a non-zero exit status.
    #[error("{program} exited with status {status_text}: {stderr}")]
    CommandFailure {
        /// Program that failed (typically `aws`).
        program: String,
        /// Exit status reported by the OS.
        status: Option<i32>,
        /// Human readable representation of the exit status.
        status_text: String,
        /// Stderr captured from the command.
        stderr: String,
    },
    /// Raised when provider output cannot be parsed.
    #[error("failed to parse {resource} output: {message}")]
    Parse {
        /// Resource type being parsed (for example `instances`).
        resource: String,
        /// Parser error message.
        message: String,
    },
    /// Raised when the service rejects an operation.
    #[error("{operation} rejected: {message}")]
    Service {
        /// Operation that was rejected.
        operation: String,
        /// Service supplied reason.
        message: String,
    },
    /// Raised when command execution fails before the service is reached.
    #[error(transparent)]
    Runner(#[from] RunnerError),
}

impl CloudError {
    /// Returns `true` when the error reports a missing resource.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// A shell script to run on a target through the session broker.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RemoteCommand {
    /// POSIX shell script passed to the target's agent.
    pub script: String,
    /// Upper bound the agent applies to the script's execution.
    pub execution_timeout: Duration,
}

impl RemoteCommand {
    /// Builds a command with the given script and agent-side timeout.
    #[must_use]
    pub fn new(script: impl Into<String>, execution_timeout: Duration) -> Self {
        Self {
            script: script.into(),
            execution_timeout,
        }
    }
}

/// Handle returned when a command has been submitted.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandHandle {
    /// Broker assigned command identifier.
    pub command_id: String,
    /// Instance the command was sent to.
    pub instance_id: String,
}

/// Broker side state of a submitted command.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum InvocationState {
    /// Accepted but not yet delivered.
    Pending,
    /// Delivered and running.
    InProgress,
    /// Completed with exit status zero.
    Success,
    /// Completed with a failure; see the exit code.
    Failed,
    /// Cancelled before completion.
    Cancelled,
    /// The agent-side execution timeout elapsed.
    TimedOut,
    /// The agent could not be reached.
    Undeliverable,
    /// A status string this crate does not recognise.
    Unknown(String),
}

impl InvocationState {
    /// Maps a broker status string onto a state, preserving unknown values.
    #[must_use]
    pub fn from_raw(raw: &str) -> Self {
        match raw {
            "Pending" | "Delayed" => Self::Pending,
            "InProgress" | "Cancelling" => Self::InProgress,
            "Success" => Self::Success,
            "Failed" => Self::Failed,
            "Cancelled" => Self::Cancelled,
            "TimedOut" | "ExecutionTimedOut" | "DeliveryTimedOut" => Self::TimedOut,
            "Undeliverable" | "Terminated" | "InvalidPlatform" | "AccessDenied" => {
                Self::Undeliverable
            }
            other => Self::Unknown(other.to_owned()),
        }
    }

    /// Returns `true` once the broker will not change the state again.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending | Self::InProgress)
    }
}

/// Snapshot of a submitted command.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InvocationStatus {
    /// Current broker state.
    pub state: InvocationState,
    /// Exit code reported by the agent, once known.
    pub exit_code: Option<i32>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl InvocationStatus {
    /// Builds a non-terminal status with no output.
    #[must_use]
    pub const fn pending() -> Self {
        Self {
            state: InvocationState::Pending,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
        }
    }
}

/// Inline authorization policy attached to a principal.
#[derive(Clone, Debug, PartialEq)]
pub struct GrantPolicy {
    /// Principal (role name) receiving the policy.
    pub principal: String,
    /// Policy name, unique per grant.
    pub name: String,
    /// Policy document.
    pub document: Value,
}

/// Object listing entry.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ObjectSummary {
    /// Object key.
    pub key: String,
    /// Object size in bytes.
    pub size: u64,
}

/// Incomplete multi-part upload.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MultipartUpload {
    /// Object key the upload targets.
    pub key: String,
    /// Provider upload identifier.
    pub upload_id: String,
    /// When the upload was started.
    pub initiated: DateTime<Utc>,
}

/// Expiry rule applied to a staging bucket.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LifecycleRule {
    /// Rule identifier.
    pub id: String,
    /// Key prefix the rule applies to.
    pub prefix: String,
    /// Objects are deleted this many days after creation.
    pub expiration_days: u32,
    /// Incomplete multi-part uploads are aborted after this many days.
    pub abort_incomplete_days: u32,
}

/// Session broker capability: send a command and poll its result.
pub trait SessionBroker: Send + Sync {
    /// Submits `command` to `instance_id` and returns immediately.
    fn send_command<'a>(
        &'a self,
        instance_id: &'a str,
        command: &'a RemoteCommand,
    ) -> CloudFuture<'a, CommandHandle>;

    /// Returns the current status of a submitted command.
    fn poll_command<'a>(&'a self, handle: &'a CommandHandle) -> CloudFuture<'a, InvocationStatus>;
}

/// Authorization store capability: attach and detach scoped policies.
pub trait AuthorizationStore: Send + Sync {
    /// Attaches `policy` to its principal, replacing any same-named policy.
    fn put_policy<'a>(&'a self, policy: &'a GrantPolicy) -> CloudFuture<'a, ()>;

    /// Detaches a policy, returning [`CloudError::NotFound`] when absent.
    fn delete_policy<'a>(&'a self, principal: &'a str, name: &'a str) -> CloudFuture<'a, ()>;
}

/// Object store capability used by the staging area.
pub trait ObjectStore: Send + Sync {
    /// Account that owns the buckets this store creates.
    fn account_id(&self) -> CloudFuture<'_, String>;

    /// Reports whether `bucket` exists and is accessible.
    fn bucket_exists<'a>(&'a self, bucket: &'a str) -> CloudFuture<'a, bool>;

    /// Creates `bucket` in `region` with public access blocked.
    fn create_bucket<'a>(&'a self, bucket: &'a str, region: &'a str) -> CloudFuture<'a, ()>;

    /// Replaces the bucket lifecycle configuration with `rule`.
    fn put_lifecycle<'a>(&'a self, bucket: &'a str, rule: &'a LifecycleRule)
    -> CloudFuture<'a, ()>;

    /// Uploads the local file at `source` to `bucket`/`key`.
    fn put_object<'a>(
        &'a self,
        bucket: &'a str,
        key: &'a str,
        source: &'a Utf8Path,
    ) -> CloudFuture<'a, ()>;

    /// Downloads `bucket`/`key` into the local file at `destination`.
    fn get_object<'a>(
        &'a self,
        bucket: &'a str,
        key: &'a str,
        destination: &'a Utf8Path,
    ) -> CloudFuture<'a, ()>;

    /// Deletes an object; deleting a missing object succeeds.
    fn delete_object<'a>(&'a self, bucket: &'a str, key: &'a str) -> CloudFuture<'a, ()>;

    /// Lists objects below `prefix`.
    fn list_objects<'a>(
        &'a self,
        bucket: &'a str,
        prefix: &'a str,
    ) -> CloudFuture<'a, Vec<ObjectSummary>>;

    /// Lists incomplete multi-part uploads below `prefix`.
    fn list_multipart_uploads<'a>(
        &'a self,
        bucket: &'a str,
        prefix: &'a str,
    ) -> CloudFuture<'a, Vec<MultipartUpload>>;

    /// Aborts one multi-part upload.
    fn abort_multipart_upload<'a>(
        &'a self,
        bucket: &'a str,
        key: &'a str,
        upload_id: &'a str,
    ) -> CloudFuture<'a, ()>;
}

/// Instance catalog capability.
pub trait InstanceCatalog: Send + Sync {
    /// Lists every instance visible to the caller.
    fn list_instances(&self) -> CloudFuture<'_, Vec<Instance>>;

    /// Describes one instance, returning `None` when it does not exist.
    fn describe_instance<'a>(&'a self, instance_id: &'a str) -> CloudFuture<'a, Option<Instance>>;
}

/// Every capability the transfer engine drives, provided by one value.
pub trait CloudServices: SessionBroker + AuthorizationStore + ObjectStore + InstanceCatalog {}

impl<T> CloudServices for T where T: SessionBroker + AuthorizationStore + ObjectStore + InstanceCatalog
{}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("Pending", InvocationState::Pending)]
    #[case("Delayed", InvocationState::Pending)]
    #[case("InProgress", InvocationState::InProgress)]
    #[case("Success", InvocationState::Success)]
    #[case("Failed", InvocationState::Failed)]
    #[case("TimedOut", InvocationState::TimedOut)]
    #[case("Undeliverable", InvocationState::Undeliverable)]
    #[case("Sideways", InvocationState::Unknown(String::from("Sideways")))]
    fn invocation_state_maps_raw_values(#[case] raw: &str, #[case] expected: InvocationState) {
        assert_eq!(InvocationState::from_raw(raw), expected);
    }

    #[test]
    fn unknown_states_are_terminal() {
        assert!(InvocationState::Unknown(String::from("x")).is_terminal());
        assert!(!InvocationState::InProgress.is_terminal());
    }
}
