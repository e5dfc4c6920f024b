//! Staged path: bytes travel through the object store under an ephemeral
//! grant, tracked by one registry entry from intent to teardown.

use std::future::Future;
use std::pin::Pin;

use tracing::{info, warn};

use super::error::commit_failure;
use super::{
    Direction, TransferError, TransferFailure, TransferRequest, TransferRouter, local, script,
};
use crate::cloud::CloudServices;
use crate::credentials::{CredentialError, EphemeralGrant, GrantScope};
use crate::instance::Instance;
use crate::registry::{EntryState, RegistryEntry, RegistryError};
use crate::staging::StagingObject;

/// Resources planned for one staged transfer.
struct StagedPlan {
    entry_id: String,
    grant: EphemeralGrant,
    object: StagingObject,
}

impl<C: CloudServices + 'static> TransferRouter<C> {
    pub(super) async fn run_staged<I>(
        &self,
        request: &TransferRequest,
        instance: &Instance,
        interrupt: Pin<&mut I>,
    ) -> Result<String, TransferError>
    where
        I: Future<Output = ()>,
    {
        let plan = self
            .plan(request, instance)
            .await
            .map_err(|failure| {
                TransferError::new(&request.id, &request.target, None, failure)
            })?;
        let fail = |failure| {
            TransferError::new(&request.id, &request.target, Some(&plan.entry_id), failure)
        };

        let outcome = tokio::select! {
            biased;
            () = interrupt => Err(TransferFailure::Interrupted),
            result = self.staged_steps(request, &plan) => result,
        };
        match outcome {
            Ok(digest) => {
                self.release(&plan).await.map_err(fail)?;
                Ok(digest)
            }
            Err(failure) => {
                warn!(
                    request_id = %request.id,
                    entry_id = %plan.entry_id,
                    error = %failure,
                    "staged transfer failed; rolling back"
                );
                self.rollback(request, &plan).await;
                Err(fail(failure))
            }
        }
    }

    /// Plans the grant and object and records them as a `Pending` entry.
    async fn plan(
        &self,
        request: &TransferRequest,
        instance: &Instance,
    ) -> Result<StagedPlan, TransferFailure> {
        let principal =
            instance
                .iam_role
                .as_deref()
                .ok_or_else(|| CredentialError::MissingPrincipal {
                    instance_id: instance.id.clone(),
                })?;
        let bucket = self.staging.bucket_for(&self.policy.region).await?;
        let object = self.staging.plan_object(
            &bucket,
            &request.id,
            script::file_name(request.remote_path()),
            request.size,
        );
        let scope = match request.direction {
            Direction::Upload => GrantScope::target_read(&object.bucket, &object.key),
            Direction::Download => GrantScope::target_write(&object.bucket, &object.key),
        };
        let grant = self.credentials.request(
            scope,
            self.policy.grant_ttl,
            principal,
            &request.id,
            &self.owner,
        )?;

        let entry = RegistryEntry::pending(
            &request.id,
            &self.policy.region,
            self.owner.clone(),
            grant.clone(),
            object.clone(),
        );
        let entry_id = entry.id.clone();
        self.registry
            .blocking(move |registry| registry.put(entry))
            .await?;
        info!(
            request_id = %request.id,
            entry_id = %entry_id,
            grant_id = %grant.id,
            object = %object.url(),
            "recorded pending staged transfer"
        );
        Ok(StagedPlan {
            entry_id,
            grant,
            object,
        })
    }

    async fn staged_steps(
        &self,
        request: &TransferRequest,
        plan: &StagedPlan,
    ) -> Result<String, TransferFailure> {
        self.credentials.issue(&plan.grant).await?;
        self.set_state(&plan.entry_id, EntryState::Active).await?;
        info!(entry_id = %plan.entry_id, grant_id = %plan.grant.id, "staged transfer active");
        if !self.policy.grant_propagation.is_zero() {
            tokio::time::sleep(self.policy.grant_propagation).await;
        }

        self.staging.ensure_bucket(&self.policy.region).await?;
        match request.direction {
            Direction::Upload => self.staged_upload(request, plan).await,
            Direction::Download => self.staged_download(request, plan).await,
        }
    }

    async fn staged_upload(
        &self,
        request: &TransferRequest,
        plan: &StagedPlan,
    ) -> Result<String, TransferFailure> {
        let source = request.local_path();
        let digest =
            local::digest_file(&source).map_err(|err| TransferFailure::local_io(&source, &err))?;
        self.staging.stage(&plan.object, &source).await?;

        let destination = request.remote_path();
        let tmp = script::temp_path(destination, &request.id);
        self.exec(
            request,
            script::pull_object(
                &self.policy.remote_aws_bin,
                &plan.object.url(),
                &self.policy.region,
                destination,
                &tmp,
            ),
        )
        .await?;
        self.exec(request, script::commit_upload(&tmp, destination, &digest))
            .await
            .map_err(|err| commit_failure(err, &digest))?;
        Ok(digest)
    }

    async fn staged_download(
        &self,
        request: &TransferRequest,
        plan: &StagedPlan,
    ) -> Result<String, TransferFailure> {
        let expected = self.remote_digest(request).await?;
        self.exec(
            request,
            script::push_object(
                &self.policy.remote_aws_bin,
                request.remote_path(),
                &plan.object.url(),
                &self.policy.region,
            ),
        )
        .await?;

        let destination = request.local_path();
        let tmp = local::temp_sibling(&destination, &request.id);
        self.staging.fetch(&plan.object, &tmp).await?;
        let actual =
            local::digest_file(&tmp).map_err(|err| TransferFailure::local_io(&tmp, &err))?;
        if actual != expected {
            return Err(TransferFailure::Integrity { expected, actual });
        }
        local::rename(&tmp, &destination)
            .map_err(|err| TransferFailure::local_io(&destination, &err))?;
        Ok(actual)
    }

    /// Tears down a completed transfer. Both the object and the grant are
    /// attempted before the first failure is returned; `Released` is the last
    /// transition.
    async fn release(&self, plan: &StagedPlan) -> Result<(), TransferFailure> {
        let unstaged = self.staging.unstage(&plan.object).await;
        let revoked = self.credentials.revoke(&plan.grant).await;
        unstaged?;
        revoked?;
        self.set_state(&plan.entry_id, EntryState::Released).await?;
        let entry_id = plan.entry_id.clone();
        self.registry
            .blocking(move |registry| registry.remove(&entry_id))
            .await?;
        info!(entry_id = %plan.entry_id, "released staged transfer resources");
        Ok(())
    }

    async fn set_state(&self, entry_id: &str, next: EntryState) -> Result<(), RegistryError> {
        let id = entry_id.to_owned();
        self.registry
            .blocking(move |registry| registry.update_state(&id, next))
            .await
            .map(drop)
    }

    /// Best-effort teardown after a failure. The entry stays `Active`.
    async fn rollback(&self, request: &TransferRequest, plan: &StagedPlan) {
        if let Err(err) = self.set_state(&plan.entry_id, EntryState::Active).await {
            warn!(entry_id = %plan.entry_id, error = %err, "failed to mark entry active during rollback");
        }
        if let Err(err) = self.credentials.revoke(&plan.grant).await {
            warn!(grant_id = %plan.grant.id, error = %err, "rollback could not revoke grant");
        }
        if let Err(err) = self.staging.abort_uploads_for(&plan.object).await {
            warn!(object = %plan.object.url(), error = %err, "rollback could not abort uploads");
        }
        if let Err(err) = self.staging.unstage(&plan.object).await {
            warn!(object = %plan.object.url(), error = %err, "rollback could not delete object");
        }
        self.discard_partial(request).await;
        warn!(
            entry_id = %plan.entry_id,
            "registry entry kept until cleanup confirms its resources are gone"
        );
    }
}
