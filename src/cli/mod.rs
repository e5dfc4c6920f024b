//! Command-line interface definitions for the `sluice` binary.
//!
//! This module centralises the clap parser structures so both the main binary
//! and the build script can reuse them when generating the manual page.

use clap::{Args, Parser, Subcommand};

/// Top-level CLI for the `sluice` binary.
#[derive(Debug, Parser)]
#[command(
    name = "sluice",
    version,
    about = "Move files and run commands on instances through the SSM channel",
    arg_required_else_help = true
)]
pub(crate) struct Cli {
    /// Region to operate in, overriding `SLUICE_REGION` and `sluice.toml`.
    #[arg(long, global = true, value_name = "REGION")]
    pub(crate) region: Option<String>,
    /// Operation to perform.
    #[command(subcommand)]
    pub(crate) command: Command,
}

/// Subcommands of `sluice`.
#[derive(Debug, Subcommand)]
pub(crate) enum Command {
    /// Copy a file to or from an instance.
    #[command(subcommand)]
    Transfer(TransferCommand),
    /// Reclaim resources left by finished, crashed, or expired transfers.
    Cleanup,
    /// Reclaim every recorded resource in the region, including live ones.
    #[command(name = "emergency-cleanup")]
    EmergencyCleanup,
    /// Run a shell command on one or more instances.
    Exec(ExecCommand),
    /// List running instances with their agent status.
    Instances,
}

/// Direction-specific arguments for `sluice transfer`.
#[derive(Debug, Subcommand)]
pub(crate) enum TransferCommand {
    /// Copy a local file to an instance.
    Upload(UploadArgs),
    /// Copy a file from an instance to this machine.
    Download(DownloadArgs),
}

/// Arguments for `sluice transfer upload`.
#[derive(Debug, Args)]
pub(crate) struct UploadArgs {
    /// Instance id (`i-…`) or `Name` tag.
    pub(crate) target: String,
    /// Local file to send.
    pub(crate) local: String,
    /// Absolute destination path on the instance.
    pub(crate) remote: String,
}

/// Arguments for `sluice transfer download`.
#[derive(Debug, Args)]
pub(crate) struct DownloadArgs {
    /// Instance id (`i-…`) or `Name` tag.
    pub(crate) target: String,
    /// Absolute source path on the instance.
    pub(crate) remote: String,
    /// Local destination file.
    pub(crate) local: String,
}

/// Arguments for `sluice exec`.
#[derive(Debug, Args)]
pub(crate) struct ExecCommand {
    /// Instance id or `Name` tag; repeat for several instances.
    #[arg(short = 't', long = "target", required = true, value_name = "TARGET")]
    pub(crate) targets: Vec<String>,
    /// Most instances to run on at once.
    #[arg(long, value_name = "N")]
    pub(crate) concurrency: Option<u32>,
    /// Per-instance deadline in seconds.
    #[arg(long, value_name = "SECONDS")]
    pub(crate) timeout: Option<u64>,
    /// Command to execute on the instances (use -- to separate flags).
    #[arg(required = true, trailing_var_arg = true)]
    pub(crate) command: Vec<String>,
}
