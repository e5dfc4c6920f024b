//! Registry-driven cleanup of orphaned transfer resources.
//!
//! Routine cleanup reclaims entries that are already `Released`, whose owning
//! process no longer holds its lease, or whose grant has expired; entries of
//! live transfers are skipped. Emergency cleanup reclaims every entry in the
//! region regardless of owner or age. Either sweep fails with
//! [`JanitorError::NotClean`] when anything it tried to reclaim remains.

use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::cloud::{AuthorizationStore, ObjectStore};
use crate::credentials::{CredentialManager, CredentialPolicy};
use crate::registry::{EntryState, Registry, RegistryEntry, RegistryError};
use crate::staging::{StagingPolicy, StagingStore};

/// Which entries a sweep reclaims.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SweepMode {
    /// Released, orphaned, or expired entries only.
    Routine,
    /// Every entry in the region.
    Emergency,
}

impl fmt::Display for SweepMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Routine => "cleanup",
            Self::Emergency => "emergency-cleanup",
        })
    }
}

/// Summary of janitor work.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SweepSummary {
    /// Registry entries removed.
    pub removed_entries: usize,
    /// Grants revoked.
    pub revoked_grants: usize,
    /// Staged objects deleted.
    pub deleted_objects: usize,
    /// Incomplete multi-part uploads aborted.
    pub aborted_uploads: usize,
    /// Entries left alone because their transfer is still running.
    pub skipped_live: usize,
}

impl SweepSummary {
    /// Returns `true` when the sweep changed nothing.
    #[must_use]
    pub const fn is_noop(&self) -> bool {
        self.removed_entries == 0
            && self.revoked_grants == 0
            && self.deleted_objects == 0
            && self.aborted_uploads == 0
    }
}

/// Errors returned by the janitor.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum JanitorError {
    /// Raised when the ledger cannot be read or updated.
    #[error(transparent)]
    Registry(#[from] RegistryError),
    /// Raised when resources remain after the sweep.
    #[error("resources remain after {mode}: {}", .failures.join("; "))]
    NotClean {
        /// Sweep that was run.
        mode: SweepMode,
        /// Work completed before giving up.
        summary: SweepSummary,
        /// One description per entry or bucket left behind.
        failures: Vec<String>,
    },
}

/// Reclaims resources recorded in the registry.
#[derive(Debug)]
pub struct Janitor<C> {
    credentials: CredentialManager<C>,
    staging: StagingStore<C>,
    registry: Registry,
}

impl<C: AuthorizationStore + ObjectStore> Janitor<C> {
    /// Creates a janitor over `registry` using `cloud` for teardown.
    #[must_use]
    pub fn new(cloud: Arc<C>, registry: Registry, staging: StagingPolicy) -> Self {
        Self {
            credentials: CredentialManager::new(Arc::clone(&cloud), CredentialPolicy::default()),
            staging: StagingStore::new(cloud, staging),
            registry,
        }
    }

    /// Reclaims released, orphaned, and expired entries in `region`, then
    /// aborts stale multi-part uploads.
    ///
    /// Running it twice in a row is a no-op the second time.
    ///
    /// # Errors
    ///
    /// Returns [`JanitorError::NotClean`] when any teardown fails, or
    /// [`JanitorError::Registry`] when the ledger is unavailable.
    pub async fn cleanup(&self, region: &str) -> Result<SweepSummary, JanitorError> {
        self.sweep(region, SweepMode::Routine).await
    }

    /// Reclaims every entry in `region` regardless of owner or age.
    ///
    /// # Errors
    ///
    /// As [`Janitor::cleanup`].
    pub async fn emergency_cleanup(&self, region: &str) -> Result<SweepSummary, JanitorError> {
        self.sweep(region, SweepMode::Emergency).await
    }

    /// Performs a sweep in the given mode.
    ///
    /// # Errors
    ///
    /// As [`Janitor::cleanup`].
    pub async fn sweep(&self, region: &str, mode: SweepMode) -> Result<SweepSummary, JanitorError> {
        let mut summary = SweepSummary::default();
        let mut failures = Vec::new();

        let entries = self.registry.blocking(Registry::list).await?;
        let in_region = entries
            .iter()
            .filter(|entry| entry.region.is_empty() || entry.region == region);
        for entry in in_region {
            if !self.reclaimable(entry, mode)? {
                debug!(entry_id = %entry.id, owner = %entry.owner.id, "skipping entry of live transfer");
                summary.skipped_live += 1;
                continue;
            }
            if let Err(reason) = self.teardown(entry, &mut summary).await {
                warn!(entry_id = %entry.id, error = %reason, "failed to reclaim registry entry");
                failures.push(format!("entry {}: {reason}", entry.id));
            }
        }

        match self.staging.sweep_incomplete_uploads(region).await {
            Ok(aborted) => summary.aborted_uploads += aborted,
            Err(err) => failures.push(err.to_string()),
        }

        info!(
            %mode,
            region,
            removed = summary.removed_entries,
            revoked = summary.revoked_grants,
            deleted = summary.deleted_objects,
            aborted = summary.aborted_uploads,
            skipped = summary.skipped_live,
            "sweep finished"
        );
        if failures.is_empty() {
            Ok(summary)
        } else {
            Err(JanitorError::NotClean {
                mode,
                summary,
                failures,
            })
        }
    }

    fn reclaimable(&self, entry: &RegistryEntry, mode: SweepMode) -> Result<bool, RegistryError> {
        if mode == SweepMode::Emergency
            || entry.state == EntryState::Released
            || entry.grant_expired_at(Utc::now())
        {
            return Ok(true);
        }
        Ok(!self.registry.owner_alive(&entry.owner.id)?)
    }

    /// Deletes the object, revokes the grant, then releases and removes the
    /// entry. The entry is kept when any step fails.
    async fn teardown(
        &self,
        entry: &RegistryEntry,
        summary: &mut SweepSummary,
    ) -> Result<(), String> {
        if let Some(object) = &entry.object {
            let aborted = self
                .staging
                .abort_uploads_for(object)
                .await
                .map_err(|err| err.to_string())?;
            summary.aborted_uploads += aborted;
            self.staging
                .unstage(object)
                .await
                .map_err(|err| err.to_string())?;
            summary.deleted_objects += 1;
        }
        if let Some(grant) = &entry.grant {
            self.credentials
                .revoke(grant)
                .await
                .map_err(|err| err.to_string())?;
            summary.revoked_grants += 1;
        }
        let id = entry.id.clone();
        let released = self
            .registry
            .blocking(move |registry| {
                match registry.update_state(&id, EntryState::Released) {
                    Ok(_) | Err(RegistryError::UnknownEntry { .. }) => {}
                    Err(err) => return Err(err),
                }
                registry.remove(&id)
            })
            .await
            .map_err(|err| err.to_string())?;
        if released {
            summary.removed_entries += 1;
        }
        info!(entry_id = %entry.id, request_id = %entry.request_id, "reclaimed registry entry");
        Ok(())
    }
}

#[cfg(test)]
mod tests;
