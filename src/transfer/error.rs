//! Transfer errors.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::credentials::CredentialError;
use crate::executor::ExecError;
use crate::registry::RegistryError;
use crate::staging::StagingError;
use crate::transfer::script::CHECKSUM_MISMATCH_EXIT;

/// Classification of a [`TransferError`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TransferErrorKind {
    /// The request was malformed or the target unsuitable.
    Validation,
    /// A grant could not be issued or revoked.
    Credential,
    /// The object store failed.
    Staging,
    /// A command could not be delivered or observed.
    Execution,
    /// A command exited non-zero.
    RemoteExit,
    /// A command did not finish in time.
    Timeout,
    /// The ledger could not be read or written.
    Registry,
    /// The operator interrupted the transfer.
    Interrupted,
    /// A local file could not be read or written.
    LocalIo,
    /// The received bytes did not match the sent bytes.
    Integrity,
}

impl fmt::Display for TransferErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Validation => "validation",
            Self::Credential => "credential",
            Self::Staging => "staging",
            Self::Execution => "execution",
            Self::RemoteExit => "remote-exit",
            Self::Timeout => "timeout",
            Self::Registry => "registry",
            Self::Interrupted => "interrupted",
            Self::LocalIo => "local-io",
            Self::Integrity => "integrity",
        })
    }
}

/// What went wrong during a transfer.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum TransferFailure {
    /// Raised when the request or target is unsuitable.
    #[error("invalid transfer: {reason}")]
    Validation {
        /// Description of the problem.
        reason: String,
    },
    /// Raised when a grant operation fails.
    #[error(transparent)]
    Credential(Box<CredentialError>),
    /// Raised when an object store operation fails.
    #[error(transparent)]
    Staging(Box<StagingError>),
    /// Raised when a command could not be delivered or observed.
    #[error("command delivery failed: {message}")]
    Execution {
        /// Transport failure description.
        message: String,
    },
    /// Raised when a command on the target exited non-zero.
    #[error("remote command exited with status {}: {}", status_text(.code), .stderr.trim())]
    RemoteExit {
        /// Instance the command ran on.
        target: String,
        /// Exit status, when reported.
        code: Option<i32>,
        /// Captured standard output.
        stdout: String,
        /// Captured standard error.
        stderr: String,
    },
    /// Raised when a command did not finish in time.
    #[error("remote command timed out after {}s", .waited.as_secs())]
    Timeout {
        /// Deadline that elapsed.
        waited: Duration,
    },
    /// Raised when the ledger fails.
    #[error(transparent)]
    Registry(#[from] RegistryError),
    /// Raised when the operator interrupts the transfer.
    #[error("transfer interrupted")]
    Interrupted,
    /// Raised when a local file operation fails.
    #[error("local file {path}: {message}")]
    LocalIo {
        /// Local path.
        path: String,
        /// Operating system error message.
        message: String,
    },
    /// Raised when SHA-256 digests disagree.
    #[error("checksum mismatch: expected {expected}, received {actual}")]
    Integrity {
        /// Digest of the bytes sent.
        expected: String,
        /// Digest of the bytes received.
        actual: String,
    },
}

fn status_text(code: &Option<i32>) -> String {
    code.map_or_else(|| String::from("unknown"), |value| value.to_string())
}

impl TransferFailure {
    /// Classification of the failure.
    #[must_use]
    pub const fn kind(&self) -> TransferErrorKind {
        match self {
            Self::Validation { .. } => TransferErrorKind::Validation,
            Self::Credential(_) => TransferErrorKind::Credential,
            Self::Staging(_) => TransferErrorKind::Staging,
            Self::Execution { .. } => TransferErrorKind::Execution,
            Self::RemoteExit { .. } => TransferErrorKind::RemoteExit,
            Self::Timeout { .. } => TransferErrorKind::Timeout,
            Self::Registry(_) => TransferErrorKind::Registry,
            Self::Interrupted => TransferErrorKind::Interrupted,
            Self::LocalIo { .. } => TransferErrorKind::LocalIo,
            Self::Integrity { .. } => TransferErrorKind::Integrity,
        }
    }

    pub(super) fn validation(reason: impl Into<String>) -> Self {
        Self::Validation {
            reason: reason.into(),
        }
    }

    pub(super) fn local_io(path: impl fmt::Display, err: &std::io::Error) -> Self {
        Self::LocalIo {
            path: path.to_string(),
            message: err.to_string(),
        }
    }
}

impl From<CredentialError> for TransferFailure {
    fn from(err: CredentialError) -> Self {
        Self::Credential(Box::new(err))
    }
}

impl From<StagingError> for TransferFailure {
    fn from(err: StagingError) -> Self {
        Self::Staging(Box::new(err))
    }
}

impl From<ExecError> for TransferFailure {
    fn from(err: ExecError) -> Self {
        match err {
            ExecError::Execution { message, .. } => Self::Execution { message },
            ExecError::RemoteExit {
                target,
                code,
                stdout,
                stderr,
            } => Self::RemoteExit {
                target,
                code,
                stdout,
                stderr,
            },
            ExecError::Timeout { waited, .. } => Self::Timeout { waited },
        }
    }
}

/// A failed transfer, tagged with its request and any registry entry left
/// behind for cleanup.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("transfer {request_id} on {target} failed: {failure}{}", entry_note(.entry_id))]
pub struct TransferError {
    request_id: String,
    target: String,
    entry_id: Option<String>,
    #[source]
    failure: Box<TransferFailure>,
}

fn entry_note(entry_id: &Option<String>) -> String {
    entry_id
        .as_ref()
        .map_or_else(String::new, |id| format!(" (registry entry {id})"))
}

impl TransferError {
    /// Wraps `failure` for `request_id` against `target`.
    #[must_use]
    pub fn new(
        request_id: &str,
        target: &str,
        entry_id: Option<&str>,
        failure: TransferFailure,
    ) -> Self {
        Self {
            request_id: request_id.to_owned(),
            target: target.to_owned(),
            entry_id: entry_id.map(str::to_owned),
            failure: Box::new(failure),
        }
    }

    /// Request the error belongs to.
    #[must_use]
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Instance the transfer was aimed at.
    #[must_use]
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Registry entry left behind, when one exists.
    #[must_use]
    pub fn entry_id(&self) -> Option<&str> {
        self.entry_id.as_deref()
    }

    /// The underlying failure.
    #[must_use]
    pub fn failure(&self) -> &TransferFailure {
        &self.failure
    }

    /// Classification of the failure.
    #[must_use]
    pub fn kind(&self) -> TransferErrorKind {
        self.failure.kind()
    }
}

/// Maps the commit script's mismatch exit onto an integrity failure.
pub(super) fn commit_failure(err: ExecError, expected: &str) -> TransferFailure {
    match err {
        ExecError::RemoteExit {
            code: Some(CHECKSUM_MISMATCH_EXIT),
            ..
        } => TransferFailure::Integrity {
            expected: expected.to_owned(),
            actual: String::from("unknown (verified on target)"),
        },
        other => other.into(),
    }
}
