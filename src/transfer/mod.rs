//! Transfer routing between the command channel and the staging store.
//!
//! Small payloads travel through the command channel in base64 chunks and
//! never touch the registry. Payloads at or above the direct threshold are
//! staged through the object store under an ephemeral grant; the registry
//! entry for the transfer is written before any cloud resource exists and
//! removed only after every resource has been torn down. Both paths verify
//! a SHA-256 digest before the destination file appears.

mod direct;
mod error;
mod local;
mod request;
pub mod script;
mod staged;

use std::future::Future;
use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::cloud::{CloudServices, RemoteCommand};
use crate::credentials::{CredentialManager, CredentialPolicy};
use crate::executor::{CommandExecutor, CommandOutcome, ExecError, PollPolicy};
use crate::instance::{Instance, Platform, Reachability};
use crate::registry::{OwnerRecord, Registry};
use crate::staging::{StagingPolicy, StagingStore};

pub use error::{TransferError, TransferErrorKind, TransferFailure};
pub use local::file_size as local_file_size;
pub use request::{Direction, TransferRequest};

/// Payloads at or above this size are staged.
pub const DEFAULT_DIRECT_THRESHOLD: u64 = 1024 * 1024;

/// Raw bytes carried by one direct-path command.
///
/// Base64 output of a chunk stays under the broker's inline output limit.
pub const DEFAULT_DIRECT_CHUNK_BYTES: usize = 12 * 1024;

/// Deadline applied to each remote command of a transfer.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(600);

/// Wait after issuing a grant before the target uses it.
pub const DEFAULT_GRANT_PROPAGATION: Duration = Duration::from_secs(5);

const CLEANUP_TIMEOUT: Duration = Duration::from_secs(30);

/// Path chosen for a transfer.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Route {
    /// Through the command channel.
    Direct,
    /// Through the staging store.
    Staged,
}

impl std::fmt::Display for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Direct => "direct",
            Self::Staged => "staged",
        })
    }
}

/// Settings that shape how transfers are routed and executed.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TransferPolicy {
    /// Region of the staging bucket.
    pub region: String,
    /// Payloads at or above this size are staged.
    pub direct_threshold: u64,
    /// Raw bytes per direct-path command.
    pub direct_chunk_bytes: usize,
    /// Deadline for each remote command.
    pub command_timeout: Duration,
    /// Grant lifetime; `None` uses the credential policy default.
    pub grant_ttl: Option<Duration>,
    /// Wait between issuing a grant and using it.
    pub grant_propagation: Duration,
    /// `aws` executable on the target.
    pub remote_aws_bin: String,
    /// Grant lifetime bounds.
    pub credentials: CredentialPolicy,
    /// Staging bucket naming and retention.
    pub staging: StagingPolicy,
    /// Command polling schedule.
    pub polling: PollPolicy,
}

impl TransferPolicy {
    /// Default policy for `region`.
    #[must_use]
    pub fn new(region: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            direct_threshold: DEFAULT_DIRECT_THRESHOLD,
            direct_chunk_bytes: DEFAULT_DIRECT_CHUNK_BYTES,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            grant_ttl: None,
            grant_propagation: DEFAULT_GRANT_PROPAGATION,
            remote_aws_bin: String::from("aws"),
            credentials: CredentialPolicy::default(),
            staging: StagingPolicy::default(),
            polling: PollPolicy::default(),
        }
    }
}

/// Outcome of a successful transfer.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TransferReport {
    /// Request identifier.
    pub request_id: String,
    /// Path the bytes took.
    pub route: Route,
    /// Payload size in bytes.
    pub bytes: u64,
    /// Hex SHA-256 digest of the payload.
    pub sha256: String,
}

/// Moves files between this machine and targets.
pub struct TransferRouter<C> {
    cloud: Arc<C>,
    executor: CommandExecutor<C>,
    credentials: CredentialManager<C>,
    staging: StagingStore<C>,
    registry: Registry,
    owner: OwnerRecord,
    policy: TransferPolicy,
}

impl<C> std::fmt::Debug for TransferRouter<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferRouter")
            .field("registry", &self.registry)
            .field("owner", &self.owner)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl<C: CloudServices + 'static> TransferRouter<C> {
    /// Creates a router recording staged transfers in `registry` as `owner`.
    #[must_use]
    pub fn new(cloud: Arc<C>, registry: Registry, owner: OwnerRecord, policy: TransferPolicy) -> Self {
        Self {
            executor: CommandExecutor::with_policy(Arc::clone(&cloud), policy.polling),
            credentials: CredentialManager::new(Arc::clone(&cloud), policy.credentials),
            staging: StagingStore::new(Arc::clone(&cloud), policy.staging.clone()),
            cloud,
            registry,
            owner,
            policy,
        }
    }

    /// Policy in effect.
    #[must_use]
    pub const fn policy(&self) -> &TransferPolicy {
        &self.policy
    }

    /// Path `request` will take.
    #[must_use]
    pub const fn route(&self, request: &TransferRequest) -> Route {
        if request.size < self.policy.direct_threshold {
            Route::Direct
        } else {
            Route::Staged
        }
    }

    /// Size of the remote file a download request reads.
    ///
    /// # Errors
    ///
    /// Returns a [`TransferError`] when the probe fails or prints something
    /// other than a byte count.
    pub async fn remote_size(&self, request: &TransferRequest) -> Result<u64, TransferError> {
        let fail = |failure| TransferError::new(&request.id, &request.target, None, failure);
        let outcome = self
            .exec(request, script::file_size(request.remote_path()))
            .await
            .map_err(|err| fail(err.into()))?;
        outcome.stdout.trim().parse::<u64>().map_err(|err| {
            fail(TransferFailure::Execution {
                message: format!("unexpected size output {:?}: {err}", outcome.stdout.trim()),
            })
        })
    }

    /// Performs `request`.
    ///
    /// # Errors
    ///
    /// Returns a [`TransferError`] tagged with the request id and, for
    /// staged transfers, the registry entry left for cleanup.
    pub async fn transfer(&self, request: &TransferRequest) -> Result<TransferReport, TransferError> {
        self.transfer_until(request, std::future::pending()).await
    }

    /// Performs `request`, abandoning it when `interrupt` completes.
    ///
    /// An interrupted staged transfer is rolled back on a best-effort basis
    /// and its registry entry is left `Active`.
    ///
    /// # Errors
    ///
    /// As [`TransferRouter::transfer`], plus
    /// [`TransferErrorKind::Interrupted`].
    pub async fn transfer_until<I>(
        &self,
        request: &TransferRequest,
        interrupt: I,
    ) -> Result<TransferReport, TransferError>
    where
        I: Future<Output = ()>,
    {
        let fail = |failure| TransferError::new(&request.id, &request.target, None, failure);
        request
            .validate()
            .map_err(|reason| fail(TransferFailure::Validation { reason }))?;
        let instance = self.target(request).await.map_err(fail)?;

        let route = self.route(request);
        info!(
            request_id = %request.id,
            target = %request.target,
            direction = %request.direction,
            size = request.size,
            ?route,
            "starting transfer"
        );
        let interrupted = pin!(interrupt);
        let sha256 = match route {
            Route::Direct => self.run_direct(request, interrupted).await?,
            Route::Staged => self.run_staged(request, &instance, interrupted).await?,
        };
        info!(request_id = %request.id, sha256 = %sha256, "transfer complete");
        Ok(TransferReport {
            request_id: request.id.clone(),
            route,
            bytes: request.size,
            sha256,
        })
    }

    async fn target(&self, request: &TransferRequest) -> Result<Instance, TransferFailure> {
        let instance = self
            .cloud
            .describe_instance(&request.target)
            .await
            .map_err(|err| TransferFailure::Execution {
                message: err.to_string(),
            })?
            .ok_or_else(|| {
                TransferFailure::validation(format!("instance {} not found", request.target))
            })?;
        if instance.platform == Platform::Windows {
            return Err(TransferFailure::validation(format!(
                "{} is a Windows instance; only POSIX targets are supported",
                instance.label()
            )));
        }
        if instance.reachability != Reachability::Online {
            return Err(TransferFailure::validation(format!(
                "{} is not reachable (agent {})",
                instance.label(),
                instance.reachability
            )));
        }
        Ok(instance)
    }

    async fn exec(
        &self,
        request: &TransferRequest,
        script: String,
    ) -> Result<CommandOutcome, ExecError> {
        let command = RemoteCommand::new(script, self.policy.command_timeout);
        self.executor
            .run(&request.target, &command, self.policy.command_timeout)
            .await
    }

    /// Removes temporary files a failed transfer may have left behind.
    async fn discard_partial(&self, request: &TransferRequest) {
        match request.direction {
            Direction::Upload => {
                let tmp = script::temp_path(request.remote_path(), &request.id);
                let command = RemoteCommand::new(script::remove_file(&tmp), CLEANUP_TIMEOUT);
                if let Err(err) = self
                    .executor
                    .run(&request.target, &command, CLEANUP_TIMEOUT)
                    .await
                {
                    warn!(request_id = %request.id, path = %tmp, error = %err, "failed to remove remote temporary file");
                }
            }
            Direction::Download => {
                let tmp = local::temp_sibling(&request.local_path(), &request.id);
                if let Err(err) = local::discard(&tmp) {
                    warn!(request_id = %request.id, path = %tmp, error = %err, "failed to remove local temporary file");
                }
            }
        }
    }
}
