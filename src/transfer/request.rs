//! Transfer request model.

use std::fmt;

use camino::{Utf8Path, Utf8PathBuf};
use uuid::Uuid;

/// Which way the bytes move.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Direction {
    /// Local file to target.
    Upload,
    /// Target file to local.
    Download,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Upload => "upload",
            Self::Download => "download",
        })
    }
}

/// One file transfer between this machine and a target instance.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TransferRequest {
    /// Random request identifier.
    pub id: String,
    /// Target instance identifier.
    pub target: String,
    /// Transfer direction.
    pub direction: Direction,
    /// Path the bytes are read from.
    pub source: String,
    /// Path the bytes are written to.
    pub destination: String,
    /// Payload size in bytes.
    pub size: u64,
}

impl TransferRequest {
    /// Builds an upload of the local file `local` to `remote` on `target`.
    #[must_use]
    pub fn upload(
        target: impl Into<String>,
        local: impl AsRef<Utf8Path>,
        remote: impl Into<String>,
        size: u64,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            target: target.into(),
            direction: Direction::Upload,
            source: local.as_ref().to_string(),
            destination: remote.into(),
            size,
        }
    }

    /// Builds a download of `remote` on `target` to the local file `local`.
    #[must_use]
    pub fn download(
        target: impl Into<String>,
        remote: impl Into<String>,
        local: impl AsRef<Utf8Path>,
        size: u64,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            target: target.into(),
            direction: Direction::Download,
            source: remote.into(),
            destination: local.as_ref().to_string(),
            size,
        }
    }

    /// Returns a copy of the request carrying `size`.
    #[must_use]
    pub fn with_size(self, size: u64) -> Self {
        Self { size, ..self }
    }

    /// Path on the target.
    #[must_use]
    pub fn remote_path(&self) -> &str {
        match self.direction {
            Direction::Upload => &self.destination,
            Direction::Download => &self.source,
        }
    }

    /// Path on this machine.
    #[must_use]
    pub fn local_path(&self) -> Utf8PathBuf {
        Utf8PathBuf::from(match self.direction {
            Direction::Upload => &self.source,
            Direction::Download => &self.destination,
        })
    }

    /// Checks the request shape.
    ///
    /// # Errors
    ///
    /// Returns a description of the first problem found.
    pub fn validate(&self) -> Result<(), String> {
        if self.target.trim().is_empty() {
            return Err(String::from("target must not be empty"));
        }
        if self.local_path().as_str().is_empty() {
            return Err(String::from("local path must not be empty"));
        }
        let remote = self.remote_path();
        if !remote.starts_with('/') {
            return Err(format!("remote path must be absolute: {remote}"));
        }
        if remote.ends_with('/') {
            return Err(format!("remote path must name a file: {remote}"));
        }
        if remote.chars().any(char::is_control) {
            return Err(String::from("remote path must not contain control characters"));
        }
        Ok(())
    }
}
