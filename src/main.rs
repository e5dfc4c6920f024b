//! Binary entry point for the Sluice CLI.

mod cli;

use std::io::{self, BufRead, Write};
use std::process;
use std::sync::Arc;
use std::time::Duration;

use camino::Utf8Path;
use clap::Parser;
use shell_escape::unix::escape;
use thiserror::Error;
use tracing::warn;

use sluice::AwsCli;
use sluice::cloud::{CloudError, CloudServices, InstanceCatalog, RemoteCommand};
use sluice::config::{ConfigError, SluiceConfig};
use sluice::executor::{CommandExecutor, ExecError, RunManyReport};
use sluice::instance::{Instance, ResolveError, SelectionCancelled, Selector, resolve_target};
use sluice::janitor::{Janitor, JanitorError, SweepMode, SweepSummary};
use sluice::logging::{self, LogSettings};
use sluice::registry::{OwnerRecord, Registry, RegistryError};
use sluice::transfer::{
    TransferError, TransferReport, TransferRequest, TransferRouter, local_file_size,
};

use cli::{Cli, Command, ExecCommand, TransferCommand};

const EXIT_FAILURE: i32 = 1;
const EXIT_PARTIAL: i32 = 2;

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error("instance catalog failed: {0}")]
    Catalog(#[from] CloudError),
    #[error(transparent)]
    Transfer(Box<TransferError>),
    #[error(transparent)]
    Janitor(Box<JanitorError>),
    #[error("failed to read {path}: {source}")]
    LocalFile {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("invalid command argument: {0}")]
    InvalidCommand(String),
    #[error("failed to write output: {0}")]
    Output(#[from] io::Error),
}

impl From<TransferError> for CliError {
    fn from(value: TransferError) -> Self {
        Self::Transfer(Box::new(value))
    }
}

impl From<JanitorError> for CliError {
    fn from(value: JanitorError) -> Self {
        Self::Janitor(Box::new(value))
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(err) = logging::init(&LogSettings::from_env()) {
        writeln!(io::stderr(), "{err}").ok();
    }

    let mut stdout = io::stdout();
    let exit_code = match dispatch(cli, &mut stdout).await {
        Ok(code) => code,
        Err(err) => {
            write_error(io::stderr(), &err);
            EXIT_FAILURE
        }
    };

    process::exit(exit_code);
}

async fn dispatch(cli: Cli, out: &mut impl Write) -> Result<i32, CliError> {
    let mut config = SluiceConfig::load_without_cli_args()?;
    if let Some(region) = cli.region {
        config.region = region;
    }
    config.validate()?;

    #[cfg(feature = "test-backdoors")]
    if let Some(cloud) = backdoor::fake_cloud_from_env() {
        return run(Arc::new(cloud), &config, cli.command, out).await;
    }

    let cloud = Arc::new(AwsCli::with_process_runner(config.aws_cli()));
    run(cloud, &config, cli.command, out).await
}

async fn run<C: CloudServices + 'static>(
    cloud: Arc<C>,
    config: &SluiceConfig,
    command: Command,
    out: &mut impl Write,
) -> Result<i32, CliError> {
    match command {
        Command::Transfer(transfer) => run_transfer(cloud, config, transfer, out).await,
        Command::Cleanup => run_sweep(cloud, config, SweepMode::Routine, out).await,
        Command::EmergencyCleanup => run_sweep(cloud, config, SweepMode::Emergency, out).await,
        Command::Exec(exec) => run_exec(cloud, config, exec, out).await,
        Command::Instances => list_instances(cloud.as_ref(), out).await,
    }
}

fn open_registry(config: &SluiceConfig) -> Result<Registry, CliError> {
    Ok(Registry::open(
        config.registry_root()?,
        config.registry_lock_timeout(),
    )?)
}

async fn run_transfer<C: CloudServices + 'static>(
    cloud: Arc<C>,
    config: &SluiceConfig,
    command: TransferCommand,
    out: &mut impl Write,
) -> Result<i32, CliError> {
    let registry = open_registry(config)?;
    let owner = OwnerRecord::for_current_process();
    let _lease = registry.owner_lease(&owner)?;
    let router = TransferRouter::new(
        Arc::clone(&cloud),
        registry,
        owner,
        config.transfer_policy()?,
    );

    let request = match command {
        TransferCommand::Upload(args) => {
            let instance = resolve_target(cloud.as_ref(), &PromptSelector, &args.target).await?;
            let size = local_file_size(Utf8Path::new(&args.local)).map_err(|source| {
                CliError::LocalFile {
                    path: args.local.clone(),
                    source,
                }
            })?;
            TransferRequest::upload(instance.id, &args.local, args.remote, size)
        }
        TransferCommand::Download(args) => {
            let instance = resolve_target(cloud.as_ref(), &PromptSelector, &args.target).await?;
            let probe = TransferRequest::download(instance.id, args.remote, &args.local, 0);
            let size = router.remote_size(&probe).await?;
            probe.with_size(size)
        }
    };

    let report = router.transfer_until(&request, interrupt()).await?;
    write_transfer_report(out, &request, &report)?;
    Ok(0)
}

/// Completes on Ctrl-C. Never completes when the handler cannot be installed.
async fn interrupt() {
    if tokio::signal::ctrl_c().await.is_err() {
        std::future::pending::<()>().await;
    }
    warn!("interrupt received; rolling back the transfer");
}

fn write_transfer_report(
    out: &mut impl Write,
    request: &TransferRequest,
    report: &TransferReport,
) -> io::Result<()> {
    writeln!(
        out,
        "{} {} -> {} ({} bytes, {} route, sha256 {})",
        request.direction,
        request.source,
        request.destination,
        report.bytes,
        report.route,
        report.sha256
    )
}

async fn run_sweep<C: CloudServices + 'static>(
    cloud: Arc<C>,
    config: &SluiceConfig,
    mode: SweepMode,
    out: &mut impl Write,
) -> Result<i32, CliError> {
    let janitor = Janitor::new(cloud, open_registry(config)?, config.staging_policy());
    let result = janitor.sweep(&config.region, mode).await;
    if let Ok(summary) | Err(JanitorError::NotClean { summary, .. }) = &result {
        write_sweep_summary(out, mode, summary)?;
    }
    result?;
    Ok(0)
}

fn write_sweep_summary(
    out: &mut impl Write,
    mode: SweepMode,
    summary: &SweepSummary,
) -> io::Result<()> {
    writeln!(
        out,
        "{mode}: removed {} entries, revoked {} grants, deleted {} objects, aborted {} uploads, skipped {} live",
        summary.removed_entries,
        summary.revoked_grants,
        summary.deleted_objects,
        summary.aborted_uploads,
        summary.skipped_live
    )
}

async fn run_exec<C: CloudServices + 'static>(
    cloud: Arc<C>,
    config: &SluiceConfig,
    args: ExecCommand,
    out: &mut impl Write,
) -> Result<i32, CliError> {
    validate_command_args(&args.command)?;
    let script = render_remote_command(&args.command);

    let mut targets = Vec::with_capacity(args.targets.len());
    for target in &args.targets {
        targets.push(resolve_target(cloud.as_ref(), &PromptSelector, target).await?.id);
    }

    let timeout = args
        .timeout
        .map_or_else(|| config.command_timeout(), Duration::from_secs);
    let concurrency = args.concurrency.unwrap_or(config.max_concurrency);
    let executor = CommandExecutor::new(cloud);
    let report = executor
        .run_many(
            &targets,
            &RemoteCommand::new(script, timeout),
            timeout,
            usize::try_from(concurrency).unwrap_or(usize::MAX),
        )
        .await;

    write_exec_report(out, &report)?;
    Ok(exit_code_for(report))
}

fn exit_code_for(report: RunManyReport) -> i32 {
    match report.into_result() {
        Ok(_) => 0,
        Err(failure) if failure.is_partial() => EXIT_PARTIAL,
        Err(_) => EXIT_FAILURE,
    }
}

fn write_exec_report(out: &mut impl Write, report: &RunManyReport) -> io::Result<()> {
    for outcome in &report.outcomes {
        let stdout = match &outcome.result {
            Ok(done) => done.stdout.as_str(),
            Err(ExecError::RemoteExit { stdout, .. }) => stdout.as_str(),
            Err(_) => "",
        };
        for line in stdout.lines() {
            writeln!(out, "[{}] {line}", outcome.target)?;
        }
    }

    writeln!(out, "{:<20} {:<8} DETAIL", "TARGET", "STATUS")?;
    for outcome in &report.outcomes {
        let (status, detail) = match &outcome.result {
            Ok(_) => ("ok", String::new()),
            Err(ExecError::RemoteExit { code, stderr, .. }) => (
                "exit",
                format!(
                    "status {} {}",
                    code.map_or_else(|| String::from("unknown"), |value| value.to_string()),
                    stderr.trim()
                ),
            ),
            Err(ExecError::Timeout { waited, .. }) => {
                ("timeout", format!("after {}s", waited.as_secs()))
            }
            Err(ExecError::Execution { message, .. }) => ("error", message.clone()),
        };
        writeln!(out, "{:<20} {status:<8} {}", outcome.target, detail.trim_end())?;
    }
    writeln!(
        out,
        "{} succeeded, {} failed",
        report.succeeded(),
        report.failed()
    )
}

async fn list_instances<C: InstanceCatalog + ?Sized>(
    catalog: &C,
    out: &mut impl Write,
) -> Result<i32, CliError> {
    let mut instances = catalog.list_instances().await?;
    instances.sort_by(|left, right| left.id.cmp(&right.id));
    writeln!(
        out,
        "{:<20} {:<24} {:<16} {:<10} ADDRESS",
        "ID", "NAME", "AGENT", "PLATFORM"
    )?;
    for instance in &instances {
        writeln!(
            out,
            "{:<20} {:<24} {:<16} {:<10} {}",
            instance.id,
            instance.name.as_deref().unwrap_or("-"),
            instance.reachability.to_string(),
            instance.platform.to_string(),
            instance
                .address
                .map_or_else(|| String::from("-"), |address| address.to_string())
        )?;
    }
    Ok(0)
}

/// Asks on stderr which of several same-named instances to use.
struct PromptSelector;

impl Selector for PromptSelector {
    fn select(&self, items: &[Instance]) -> Result<usize, SelectionCancelled> {
        choose(io::stdin().lock(), io::stderr(), items)
    }
}

fn choose(
    mut input: impl BufRead,
    mut prompt: impl Write,
    items: &[Instance],
) -> Result<usize, SelectionCancelled> {
    let cancelled = |_| SelectionCancelled;
    writeln!(prompt, "Several instances match; choose one:").map_err(cancelled)?;
    for (position, item) in items.iter().enumerate() {
        writeln!(
            prompt,
            "  {}) {} [{}]",
            position + 1,
            item.label(),
            item.reachability
        )
        .map_err(cancelled)?;
    }
    write!(prompt, "Selection (empty to cancel): ").map_err(cancelled)?;
    prompt.flush().map_err(cancelled)?;

    let mut line = String::new();
    input.read_line(&mut line).map_err(cancelled)?;
    line.trim()
        .parse::<usize>()
        .ok()
        .and_then(|choice| choice.checked_sub(1))
        .filter(|index| *index < items.len())
        .ok_or(SelectionCancelled)
}

fn render_remote_command(args: &[String]) -> String {
    args.iter()
        .map(|arg| escape(arg.as_str().into()).into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}

fn validate_command_args(args: &[String]) -> Result<(), CliError> {
    for arg in args {
        if arg
            .chars()
            .any(|ch| matches!(ch, '\u{0000}'..='\u{001F}' | '\u{007F}'))
        {
            return Err(CliError::InvalidCommand(String::from(concat!(
                "command arguments must not contain control characters (ASCII ",
                "0x00-0x1F or 0x7F, e.g. newline, carriage return, tab, NUL)"
            ))));
        }
    }
    Ok(())
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "error: {err}").ok();
    if let CliError::Transfer(transfer) = err
        && let Some(entry_id) = transfer.entry_id()
    {
        writeln!(
            target,
            "registry entry {entry_id} may still hold a grant or staged object; \
             run `sluice cleanup` to reclaim it, or `sluice emergency-cleanup` if no other transfer is running"
        )
        .ok();
    }
}

#[cfg(feature = "test-backdoors")]
mod backdoor {
    //! In-memory cloud for exercising the binary end to end.

    use std::env;

    use sluice::instance::{Instance, Reachability};
    use sluice::test_support::{FakeCloud, Fault, instance};

    /// Set to `1` to replace the `aws` CLI with an in-memory cloud.
    const FAKE_CLOUD_ENV: &str = "SLUICE_FAKE_CLOUD";
    /// Comma-separated faults to inject, e.g. `put-object,remote-copy`.
    const FAKE_FAULT_ENV: &str = "SLUICE_FAKE_FAULT";

    pub(crate) fn fake_cloud_from_env() -> Option<FakeCloud> {
        env::var(FAKE_CLOUD_ENV).ok().filter(|value| value == "1")?;
        let cloud = FakeCloud::new();
        cloud.add_instance(instance("i-0123456789abcdef0", Some("web-1")));
        cloud.add_instance(instance("i-0fedcba987654321f", Some("web-2")));
        cloud.add_instance(Instance {
            reachability: Reachability::ConnectionLost,
            ..instance("i-0000000000000dead", Some("db-1"))
        });
        let faults = env::var(FAKE_FAULT_ENV).unwrap_or_default();
        for fault in faults.split(',').filter_map(|name| parse_fault(name.trim())) {
            cloud.inject(fault);
        }
        Some(cloud)
    }

    fn parse_fault(name: &str) -> Option<Fault> {
        Some(match name {
            "put-policy" => Fault::PutPolicy,
            "delete-policy" => Fault::DeletePolicy,
            "create-bucket" => Fault::CreateBucket,
            "put-object" => Fault::PutObject,
            "get-object" => Fault::GetObject,
            "delete-object" => Fault::DeleteObject,
            "send-command" => Fault::SendCommand,
            "command-hang" => Fault::CommandHang,
            "remote-copy" => Fault::RemoteCopy,
            "list-instances" => Fault::ListInstances,
            _ => return None,
        })
    }
}

#[cfg(test)]
#[path = "main_tests.rs"]
mod tests;
