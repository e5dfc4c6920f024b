//! Core library for the Sluice transfer tool.
//!
//! The crate moves files to and from instances that are reachable only
//! through an agent-brokered command channel. Small payloads travel through
//! the channel itself; larger ones are staged through an object store under
//! a grant scoped to a single object and a short lifetime. Every grant and
//! staged object is recorded in a lock-guarded local registry before it
//! exists, so the janitor can reclaim whatever a crashed or interrupted
//! process leaves behind.

pub mod aws;
pub mod cloud;
pub mod config;
pub mod credentials;
pub mod executor;
pub mod instance;
pub mod janitor;
pub mod logging;
pub mod registry;
pub mod runner;
pub mod staging;
pub mod test_support;
pub mod transfer;

pub use aws::{AwsCli, AwsCliConfig};
pub use cloud::{CloudError, CloudServices};
pub use config::{ConfigError, SluiceConfig};
pub use credentials::{CredentialError, CredentialManager, CredentialPolicy, EphemeralGrant};
pub use executor::{CommandExecutor, ExecError, PartialFailure, RunManyReport};
pub use instance::{Instance, ResolveError, Selector, resolve_target};
pub use janitor::{Janitor, JanitorError, SweepMode, SweepSummary};
pub use registry::{EntryState, OwnerRecord, Registry, RegistryEntry, RegistryError};
pub use runner::{CommandOutput, CommandRunner, ProcessCommandRunner};
pub use staging::{StagingError, StagingPolicy, StagingStore};
pub use transfer::{
    Direction, Route, TransferError, TransferErrorKind, TransferPolicy, TransferReport,
    TransferRequest, TransferRouter,
};
