//! Configuration loading via `ortho-config`.
//!
//! Every field can be set in `sluice.toml` (or `.sluice.toml`, or the file
//! named by `SLUICE_CONFIG_PATH`) and overridden as `SLUICE_<FIELD>` in the
//! environment. [`SluiceConfig::validate`] runs after the merge and names
//! both places a bad value can be fixed.

use std::ffi::OsString;
use std::time::Duration;

use camino::Utf8PathBuf;
use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

use crate::aws::{AwsCliConfig, DEFAULT_AWS_BIN};
use crate::credentials::{CredentialPolicy, DEFAULT_GRANT_TTL, MAX_GRANT_TTL};
use crate::executor::PollPolicy;
use crate::registry::{DEFAULT_LOCK_TIMEOUT, Registry};
use crate::staging::StagingPolicy;
use crate::transfer::{
    DEFAULT_COMMAND_TIMEOUT, DEFAULT_DIRECT_CHUNK_BYTES, DEFAULT_DIRECT_THRESHOLD,
    DEFAULT_GRANT_PROPAGATION, TransferPolicy,
};

/// Default number of targets a multi-target command runs on at once.
pub const DEFAULT_MAX_CONCURRENCY: u32 = 8;

const CONFIG_FILE: &str = "sluice.toml";

/// Settings for transfers, staging, grants, and the registry.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "SLUICE",
    discovery(
        app_name = "sluice",
        env_var = "SLUICE_CONFIG_PATH",
        config_file_name = "sluice.toml",
        dotfile_name = ".sluice.toml",
        project_file_name = "sluice.toml"
    )
)]
pub struct SluiceConfig {
    /// Region of the targets and the staging bucket. Required.
    #[ortho_config(default = String::new())]
    pub region: String,
    /// Local `aws` executable.
    #[ortho_config(default = DEFAULT_AWS_BIN.to_owned())]
    pub aws_bin: String,
    /// Named `aws` profile; the default credential chain is used when unset.
    pub aws_profile: Option<String>,
    /// `aws` executable on the targets, used by staged transfers.
    #[ortho_config(default = DEFAULT_AWS_BIN.to_owned())]
    pub remote_aws_bin: String,
    /// Payloads at or above this many bytes are staged.
    #[ortho_config(default = DEFAULT_DIRECT_THRESHOLD)]
    pub direct_threshold_bytes: u64,
    /// Raw bytes carried by each direct-path command.
    #[ortho_config(default = 12_288)]
    pub direct_chunk_bytes: u64,
    /// Deadline for each remote command, in seconds.
    #[ortho_config(default = 600)]
    pub command_timeout_secs: u64,
    /// Lifetime of an ephemeral grant, in seconds.
    #[ortho_config(default = 900)]
    pub grant_ttl_secs: u64,
    /// Upper bound on any grant lifetime, in seconds.
    #[ortho_config(default = 3_600)]
    pub max_grant_ttl_secs: u64,
    /// Wait after issuing a grant before the target uses it, in seconds.
    #[ortho_config(default = 5)]
    pub grant_propagation_secs: u64,
    /// Staging buckets are named `<prefix>-<region>`.
    #[ortho_config(default = "sluice-staging".to_owned())]
    pub staging_bucket_prefix: String,
    /// Explicit staging bucket name, replacing the `<prefix>-<account>-<region>`
    /// scheme.
    pub staging_bucket: Option<String>,
    /// Days after which staged objects expire.
    #[ortho_config(default = 1)]
    pub staging_expiry_days: u32,
    /// Age in hours at which cleanup aborts incomplete uploads.
    #[ortho_config(default = 24)]
    pub multipart_abort_after_hours: u64,
    /// Directory holding the registry ledger; defaults to the user data dir.
    pub registry_dir: Option<String>,
    /// Longest wait for the registry lock, in seconds.
    #[ortho_config(default = 30)]
    pub registry_lock_timeout_secs: u64,
    /// Most targets a multi-target command runs on at once.
    #[ortho_config(default = 8)]
    pub max_concurrency: u32,
}

/// Metadata for a configuration field, used to generate actionable error messages.
struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
}

impl FieldMetadata {
    const fn new(description: &'static str, env_var: &'static str, toml_key: &'static str) -> Self {
        Self {
            description,
            env_var,
            toml_key,
        }
    }

    fn hint(&self) -> String {
        format!(
            "set {} or add {} to {CONFIG_FILE}",
            self.env_var, self.toml_key
        )
    }
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// Indicates a field holds a value outside its allowed range.
    #[error("invalid configuration value: {0}")]
    InvalidValue(String),
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}

impl SluiceConfig {
    /// Configuration with every default applied and `region` set.
    #[must_use]
    pub fn with_region(region: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            aws_bin: DEFAULT_AWS_BIN.to_owned(),
            aws_profile: None,
            remote_aws_bin: DEFAULT_AWS_BIN.to_owned(),
            direct_threshold_bytes: DEFAULT_DIRECT_THRESHOLD,
            direct_chunk_bytes: DEFAULT_DIRECT_CHUNK_BYTES as u64,
            command_timeout_secs: DEFAULT_COMMAND_TIMEOUT.as_secs(),
            grant_ttl_secs: DEFAULT_GRANT_TTL.as_secs(),
            max_grant_ttl_secs: MAX_GRANT_TTL.as_secs(),
            grant_propagation_secs: DEFAULT_GRANT_PROPAGATION.as_secs(),
            staging_bucket_prefix: StagingPolicy::default().bucket_prefix,
            staging_bucket: None,
            staging_expiry_days: 1,
            multipart_abort_after_hours: 24,
            registry_dir: None,
            registry_lock_timeout_secs: DEFAULT_LOCK_TIMEOUT.as_secs(),
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
        }
    }

    /// Loads configuration without attempting to parse CLI arguments. Values
    /// still merge defaults, configuration files, and environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([OsString::from("sluice")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    fn require_field(value: &str, metadata: &FieldMetadata) -> Result<(), ConfigError> {
        if value.trim().is_empty() {
            return Err(ConfigError::MissingField(format!(
                "missing {}: {}",
                metadata.description,
                metadata.hint()
            )));
        }
        Ok(())
    }

    fn require_positive(value: u64, metadata: &FieldMetadata) -> Result<(), ConfigError> {
        if value == 0 {
            return Err(ConfigError::InvalidValue(format!(
                "{} must be greater than zero: {}",
                metadata.description,
                metadata.hint()
            )));
        }
        Ok(())
    }

    /// Performs semantic validation. Error messages name the environment
    /// variable and configuration key that supply each value.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] for empty required strings and
    /// [`ConfigError::InvalidValue`] for out-of-range numbers.
    pub fn validate(&self) -> Result<(), ConfigError> {
        Self::require_field(
            &self.region,
            &FieldMetadata::new("AWS region", "SLUICE_REGION", "region"),
        )?;
        Self::require_field(
            &self.aws_bin,
            &FieldMetadata::new("aws executable", "SLUICE_AWS_BIN", "aws_bin"),
        )?;
        Self::require_field(
            &self.remote_aws_bin,
            &FieldMetadata::new(
                "remote aws executable",
                "SLUICE_REMOTE_AWS_BIN",
                "remote_aws_bin",
            ),
        )?;
        Self::require_field(
            &self.staging_bucket_prefix,
            &FieldMetadata::new(
                "staging bucket prefix",
                "SLUICE_STAGING_BUCKET_PREFIX",
                "staging_bucket_prefix",
            ),
        )?;
        let positive = [
            (
                self.direct_threshold_bytes,
                FieldMetadata::new(
                    "direct threshold",
                    "SLUICE_DIRECT_THRESHOLD_BYTES",
                    "direct_threshold_bytes",
                ),
            ),
            (
                self.direct_chunk_bytes,
                FieldMetadata::new(
                    "direct chunk size",
                    "SLUICE_DIRECT_CHUNK_BYTES",
                    "direct_chunk_bytes",
                ),
            ),
            (
                self.command_timeout_secs,
                FieldMetadata::new(
                    "command timeout",
                    "SLUICE_COMMAND_TIMEOUT_SECS",
                    "command_timeout_secs",
                ),
            ),
            (
                self.grant_ttl_secs,
                FieldMetadata::new("grant lifetime", "SLUICE_GRANT_TTL_SECS", "grant_ttl_secs"),
            ),
            (
                u64::from(self.staging_expiry_days),
                FieldMetadata::new(
                    "staging expiry",
                    "SLUICE_STAGING_EXPIRY_DAYS",
                    "staging_expiry_days",
                ),
            ),
            (
                self.registry_lock_timeout_secs,
                FieldMetadata::new(
                    "registry lock timeout",
                    "SLUICE_REGISTRY_LOCK_TIMEOUT_SECS",
                    "registry_lock_timeout_secs",
                ),
            ),
            (
                u64::from(self.max_concurrency),
                FieldMetadata::new(
                    "concurrency limit",
                    "SLUICE_MAX_CONCURRENCY",
                    "max_concurrency",
                ),
            ),
        ];
        for (value, metadata) in &positive {
            Self::require_positive(*value, metadata)?;
        }
        if self.grant_ttl_secs > self.max_grant_ttl_secs {
            return Err(ConfigError::InvalidValue(format!(
                "grant lifetime of {}s exceeds the {}s maximum: {}",
                self.grant_ttl_secs,
                self.max_grant_ttl_secs,
                FieldMetadata::new("grant lifetime", "SLUICE_GRANT_TTL_SECS", "grant_ttl_secs")
                    .hint()
            )));
        }
        Ok(())
    }

    /// Grant lifetime bounds.
    #[must_use]
    pub const fn credential_policy(&self) -> CredentialPolicy {
        CredentialPolicy {
            default_ttl: Duration::from_secs(self.grant_ttl_secs),
            max_ttl: Duration::from_secs(self.max_grant_ttl_secs),
        }
    }

    /// Staging bucket naming and retention.
    #[must_use]
    pub fn staging_policy(&self) -> StagingPolicy {
        StagingPolicy {
            bucket_prefix: self.staging_bucket_prefix.clone(),
            bucket_override: self.staging_bucket.clone(),
            expiry_days: self.staging_expiry_days,
            multipart_abort_after: Duration::from_secs(
                self.multipart_abort_after_hours.saturating_mul(60 * 60),
            ),
            ..StagingPolicy::default()
        }
    }

    /// Full transfer policy.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when validation fails.
    pub fn transfer_policy(&self) -> Result<TransferPolicy, ConfigError> {
        self.validate()?;
        let direct_chunk_bytes = usize::try_from(self.direct_chunk_bytes).map_err(|_| {
            ConfigError::InvalidValue(format!(
                "direct chunk size {} does not fit in memory",
                self.direct_chunk_bytes
            ))
        })?;
        Ok(TransferPolicy {
            direct_threshold: self.direct_threshold_bytes,
            direct_chunk_bytes,
            command_timeout: self.command_timeout(),
            grant_ttl: Some(Duration::from_secs(self.grant_ttl_secs)),
            grant_propagation: Duration::from_secs(self.grant_propagation_secs),
            remote_aws_bin: self.remote_aws_bin.clone(),
            credentials: self.credential_policy(),
            staging: self.staging_policy(),
            polling: PollPolicy::default(),
            ..TransferPolicy::new(self.region.clone())
        })
    }

    /// Deadline for each remote command.
    #[must_use]
    pub const fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    /// Settings for the `aws` CLI adapter.
    #[must_use]
    pub fn aws_cli(&self) -> AwsCliConfig {
        AwsCliConfig {
            bin: self.aws_bin.clone(),
            profile: self.aws_profile.clone(),
            region: self.region.clone(),
        }
    }

    /// Directory holding the registry ledger.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when no directory is configured
    /// and the platform has no user data directory.
    pub fn registry_root(&self) -> Result<Utf8PathBuf, ConfigError> {
        match self.registry_dir.as_deref() {
            Some(dir) if !dir.trim().is_empty() => Ok(Utf8PathBuf::from(dir)),
            _ => Registry::default_location().map_err(|_| {
                ConfigError::MissingField(format!(
                    "missing registry directory: {}",
                    FieldMetadata::new("registry directory", "SLUICE_REGISTRY_DIR", "registry_dir")
                        .hint()
                ))
            }),
        }
    }

    /// Longest wait for the registry lock.
    #[must_use]
    pub const fn registry_lock_timeout(&self) -> Duration {
        Duration::from_secs(self.registry_lock_timeout_secs)
    }
}
