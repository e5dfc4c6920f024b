//! Capability implementations backed by the `aws` CLI.
//!
//! Every call shells out through a [`CommandRunner`], asks for JSON output,
//! and maps "does not exist" responses onto [`CloudError::NotFound`] so the
//! callers' idempotent paths work unchanged against the real services.

mod ec2;
mod iam;
mod s3;
mod ssm;

use std::ffi::OsString;

use serde::de::DeserializeOwned;

use crate::cloud::CloudError;
use crate::runner::{CommandOutput, CommandRunner, ProcessCommandRunner};

/// Default `aws` CLI binary name.
pub const DEFAULT_AWS_BIN: &str = "aws";

/// Error codes the services use for missing resources.
const NOT_FOUND_MARKERS: &[&str] = &[
    "NoSuchEntity",
    "NoSuchKey",
    "NoSuchBucket",
    "NoSuchUpload",
    "InvalidInstanceID.NotFound",
    "InvocationDoesNotExist",
    "(404)",
    "Not Found",
];

/// Settings for [`AwsCli`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AwsCliConfig {
    /// Path to the `aws` binary.
    pub bin: String,
    /// Named profile, when not using the default credential chain.
    pub profile: Option<String>,
    /// Region every call is made in.
    pub region: String,
}

impl AwsCliConfig {
    /// Configuration using the default binary and credential chain.
    #[must_use]
    pub fn new(region: impl Into<String>) -> Self {
        Self {
            bin: String::from(DEFAULT_AWS_BIN),
            profile: None,
            region: region.into(),
        }
    }
}

/// Reaches SSM, IAM, S3 and EC2 through the `aws` CLI.
#[derive(Clone, Debug)]
pub struct AwsCli<R> {
    config: AwsCliConfig,
    runner: R,
}

impl AwsCli<ProcessCommandRunner> {
    /// Creates an adapter wired to the real process runner.
    #[must_use]
    pub const fn with_process_runner(config: AwsCliConfig) -> Self {
        Self::new(config, ProcessCommandRunner)
    }
}

impl<R: CommandRunner> AwsCli<R> {
    /// Creates an adapter using `runner`.
    #[must_use]
    pub const fn new(config: AwsCliConfig, runner: R) -> Self {
        Self { config, runner }
    }

    /// Configuration in effect.
    #[must_use]
    pub const fn config(&self) -> &AwsCliConfig {
        &self.config
    }

    fn full_args(&self, args: &[&str]) -> Vec<OsString> {
        let mut full = args.iter().map(OsString::from).collect::<Vec<_>>();
        full.extend(["--region", self.config.region.as_str(), "--output", "json"].map(OsString::from));
        if let Some(profile) = &self.config.profile {
            full.push(OsString::from("--profile"));
            full.push(OsString::from(profile));
        }
        full
    }

    /// Runs one CLI call, describing `resource` in errors.
    async fn call(&self, resource: &str, args: &[&str]) -> Result<CommandOutput, CloudError> {
        let full = self.full_args(args);
        let output = self.runner.run(&self.config.bin, &full).await?;
        if output.is_success() {
            Ok(output)
        } else {
            Err(classify(&self.config.bin, resource, output))
        }
    }

    /// Runs one CLI call and parses its JSON output. Empty output parses as
    /// an empty object.
    async fn call_json<T: DeserializeOwned>(
        &self,
        resource: &str,
        args: &[&str],
    ) -> Result<T, CloudError> {
        let output = self.call(resource, args).await?;
        let body = if output.stdout.trim().is_empty() {
            "{}"
        } else {
            output.stdout.as_str()
        };
        serde_json::from_str(body).map_err(|err| CloudError::Parse {
            resource: resource.to_owned(),
            message: err.to_string(),
        })
    }
}

fn classify(program: &str, resource: &str, output: CommandOutput) -> CloudError {
    if NOT_FOUND_MARKERS
        .iter()
        .any(|marker| output.stderr.contains(marker))
    {
        return CloudError::NotFound {
            resource: resource.to_owned(),
        };
    }
    CloudError::CommandFailure {
        program: program.to_owned(),
        status: output.code,
        status_text: output.status_text(),
        stderr: output.stderr.trim().to_owned(),
    }
}
