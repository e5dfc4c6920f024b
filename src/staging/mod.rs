//! Per-region staging bucket for transfers too large for the command channel.
//!
//! The bucket carries a lifecycle rule so that objects missed by the registry
//! are still reclaimed by the object store, and incomplete multi-part uploads
//! are aborted both when an upload fails and by a periodic sweep.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use camino::Utf8Path;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::cloud::{CloudError, LifecycleRule, ObjectStore};

/// Key prefix under which every staged object is written.
pub const STAGING_KEY_PREFIX: &str = "sluice/";

const LIFECYCLE_RULE_ID: &str = "sluice-staging-expiry";

/// A temporary object carrying one transfer's payload.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct StagingObject {
    /// Bucket holding the object.
    pub bucket: String,
    /// Object key.
    pub key: String,
    /// Payload size in bytes.
    pub size: u64,
    /// When the object was planned.
    pub created_at: DateTime<Utc>,
    /// When the bucket lifecycle rule will have removed it.
    pub expires_at: DateTime<Utc>,
    /// Transfer the object belongs to.
    pub request_id: String,
}

impl StagingObject {
    /// `s3://` URL of the object.
    #[must_use]
    pub fn url(&self) -> String {
        format!("s3://{}/{}", self.bucket, self.key)
    }
}

/// Naming and retention settings for staging buckets.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StagingPolicy {
    /// Prefix combined with the account and region to name the bucket.
    pub bucket_prefix: String,
    /// Explicit bucket name overriding the prefix scheme.
    ///
    /// Bucket names are global, so the default scheme embeds the caller's
    /// account id; setting this skips the account lookup.
    pub bucket_override: Option<String>,
    /// Days after which staged objects expire.
    pub expiry_days: u32,
    /// Days after which the bucket aborts incomplete uploads itself.
    pub abort_incomplete_days: u32,
    /// Age at which the sweep aborts incomplete uploads.
    pub multipart_abort_after: Duration,
}

impl Default for StagingPolicy {
    fn default() -> Self {
        Self {
            bucket_prefix: String::from("sluice-staging"),
            bucket_override: None,
            expiry_days: 1,
            abort_incomplete_days: 1,
            multipart_abort_after: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Errors raised by staging operations.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum StagingError {
    /// Raised when the account naming the default bucket cannot be resolved.
    #[error("failed to resolve the account for the staging bucket name: {source}")]
    Account {
        /// Underlying service error.
        #[source]
        source: CloudError,
    },
    /// Raised when the bucket cannot be created or configured.
    #[error("failed to prepare staging bucket {bucket}: {source}")]
    Bucket {
        /// Bucket name.
        bucket: String,
        /// Underlying service error.
        #[source]
        source: CloudError,
    },
    /// Raised when the payload cannot be written to the bucket.
    #[error("failed to stage s3://{bucket}/{key}: {source}")]
    Upload {
        /// Bucket name.
        bucket: String,
        /// Object key.
        key: String,
        /// Underlying service error.
        #[source]
        source: CloudError,
    },
    /// Raised when the staged payload cannot be read back.
    #[error("failed to fetch s3://{bucket}/{key}: {source}")]
    Download {
        /// Bucket name.
        bucket: String,
        /// Object key.
        key: String,
        /// Underlying service error.
        #[source]
        source: CloudError,
    },
    /// Raised when the staged object cannot be removed.
    #[error("failed to delete s3://{bucket}/{key}: {source}")]
    Delete {
        /// Bucket name.
        bucket: String,
        /// Object key.
        key: String,
        /// Underlying service error.
        #[source]
        source: CloudError,
    },
    /// Raised when incomplete uploads cannot be listed or aborted.
    #[error("failed to sweep incomplete uploads in {bucket}: {source}")]
    Sweep {
        /// Bucket name.
        bucket: String,
        /// Underlying service error.
        #[source]
        source: CloudError,
    },
}

/// Staging operations over an [`ObjectStore`].
#[derive(Debug)]
pub struct StagingStore<O> {
    store: Arc<O>,
    policy: StagingPolicy,
    account: OnceLock<String>,
}

impl<O: ObjectStore> StagingStore<O> {
    /// Creates a staging store.
    #[must_use]
    pub const fn new(store: Arc<O>, policy: StagingPolicy) -> Self {
        Self {
            store,
            policy,
            account: OnceLock::new(),
        }
    }

    /// Policy in effect.
    #[must_use]
    pub const fn policy(&self) -> &StagingPolicy {
        &self.policy
    }

    /// Name of the staging bucket used in `region`.
    ///
    /// Without an override the name is `<prefix>-<account>-<region>`; the
    /// account is looked up once per store.
    ///
    /// # Errors
    ///
    /// Returns [`StagingError::Account`] when the account lookup fails.
    pub async fn bucket_for(&self, region: &str) -> Result<String, StagingError> {
        if let Some(bucket) = &self.policy.bucket_override {
            return Ok(bucket.clone());
        }
        let account = match self.account.get() {
            Some(account) => account.clone(),
            None => {
                let account = self
                    .store
                    .account_id()
                    .await
                    .map_err(|source| StagingError::Account { source })?;
                debug!(account = %account, "resolved staging account");
                self.account.get_or_init(|| account).clone()
            }
        };
        Ok(format!("{}-{account}-{region}", self.policy.bucket_prefix).to_ascii_lowercase())
    }

    /// Creates the bucket when missing and (re)applies its lifecycle rule.
    ///
    /// # Errors
    ///
    /// Returns [`StagingError::Bucket`] when the bucket cannot be created or
    /// configured.
    pub async fn ensure_bucket(&self, region: &str) -> Result<String, StagingError> {
        let bucket = self.bucket_for(region).await?;
        let bucket_error = |source: CloudError| StagingError::Bucket {
            bucket: bucket.clone(),
            source,
        };

        if self
            .store
            .bucket_exists(&bucket)
            .await
            .map_err(bucket_error)?
        {
            debug!(bucket = %bucket, "staging bucket present");
        } else {
            self.store
                .create_bucket(&bucket, region)
                .await
                .map_err(bucket_error)?;
            info!(bucket = %bucket, region, "created staging bucket");
        }

        let rule = LifecycleRule {
            id: String::from(LIFECYCLE_RULE_ID),
            prefix: String::from(STAGING_KEY_PREFIX),
            expiration_days: self.policy.expiry_days,
            abort_incomplete_days: self.policy.abort_incomplete_days,
        };
        self.store
            .put_lifecycle(&bucket, &rule)
            .await
            .map_err(bucket_error)?;
        Ok(bucket)
    }

    /// Plans the object a transfer will stage through. Touches nothing.
    #[must_use]
    pub fn plan_object(
        &self,
        bucket: &str,
        request_id: &str,
        file_name: &str,
        size: u64,
    ) -> StagingObject {
        let created_at = Utc::now();
        StagingObject {
            bucket: bucket.to_owned(),
            key: format!(
                "{STAGING_KEY_PREFIX}{request_id}/{}",
                sanitize_file_name(file_name)
            ),
            size,
            created_at,
            expires_at: created_at + chrono::Duration::days(i64::from(self.policy.expiry_days)),
            request_id: request_id.to_owned(),
        }
    }

    /// Writes the local file at `source` to the staged object.
    ///
    /// On failure any multi-part upload left for the key is aborted before
    /// the error is returned.
    ///
    /// # Errors
    ///
    /// Returns [`StagingError::Upload`].
    pub async fn stage(&self, object: &StagingObject, source: &Utf8Path) -> Result<(), StagingError> {
        match self
            .store
            .put_object(&object.bucket, &object.key, source)
            .await
        {
            Ok(()) => {
                info!(bucket = %object.bucket, key = %object.key, size = object.size, "staged object");
                Ok(())
            }
            Err(source) => {
                if let Err(abort_err) = self.abort_uploads_for(object).await {
                    warn!(key = %object.key, error = %abort_err, "failed to abort partial upload");
                }
                Err(StagingError::Upload {
                    bucket: object.bucket.clone(),
                    key: object.key.clone(),
                    source,
                })
            }
        }
    }

    /// Reads the staged object into the local file at `destination`.
    ///
    /// # Errors
    ///
    /// Returns [`StagingError::Download`].
    pub async fn fetch(
        &self,
        object: &StagingObject,
        destination: &Utf8Path,
    ) -> Result<(), StagingError> {
        self.store
            .get_object(&object.bucket, &object.key, destination)
            .await
            .map_err(|source| StagingError::Download {
                bucket: object.bucket.clone(),
                key: object.key.clone(),
                source,
            })
    }

    /// Deletes the staged object. Deleting a missing object succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`StagingError::Delete`].
    pub async fn unstage(&self, object: &StagingObject) -> Result<(), StagingError> {
        match self.store.delete_object(&object.bucket, &object.key).await {
            Ok(()) => {
                info!(bucket = %object.bucket, key = %object.key, "deleted staged object");
                Ok(())
            }
            Err(err) if err.is_not_found() => Ok(()),
            Err(source) => Err(StagingError::Delete {
                bucket: object.bucket.clone(),
                key: object.key.clone(),
                source,
            }),
        }
    }

    /// Aborts every incomplete upload for the object's key. A missing bucket
    /// has none.
    ///
    /// # Errors
    ///
    /// Returns [`StagingError::Sweep`].
    pub async fn abort_uploads_for(&self, object: &StagingObject) -> Result<usize, StagingError> {
        let uploads = match self
            .store
            .list_multipart_uploads(&object.bucket, &object.key)
            .await
        {
            Ok(uploads) => uploads,
            Err(err) if err.is_not_found() => return Ok(0),
            Err(source) => return Err(sweep_error(&object.bucket, source)),
        };
        let mut aborted = 0;
        for upload in uploads.iter().filter(|upload| upload.key == object.key) {
            self.abort(&object.bucket, &upload.key, &upload.upload_id)
                .await?;
            aborted += 1;
        }
        Ok(aborted)
    }

    /// Aborts incomplete uploads older than the policy threshold.
    ///
    /// A bucket that does not exist yet has nothing to sweep.
    ///
    /// # Errors
    ///
    /// Returns [`StagingError::Sweep`], or [`StagingError::Account`] when the
    /// bucket name cannot be resolved.
    pub async fn sweep_incomplete_uploads(&self, region: &str) -> Result<usize, StagingError> {
        let bucket = self.bucket_for(region).await?;
        if !self
            .store
            .bucket_exists(&bucket)
            .await
            .map_err(|source| sweep_error(&bucket, source))?
        {
            return Ok(0);
        }

        let max_age = chrono::Duration::from_std(self.policy.multipart_abort_after)
            .unwrap_or_else(|_| chrono::Duration::days(1));
        let cutoff = Utc::now() - max_age;
        let uploads = self
            .store
            .list_multipart_uploads(&bucket, STAGING_KEY_PREFIX)
            .await
            .map_err(|source| sweep_error(&bucket, source))?;

        let mut aborted = 0;
        for upload in uploads.iter().filter(|upload| upload.initiated < cutoff) {
            self.abort(&bucket, &upload.key, &upload.upload_id).await?;
            aborted += 1;
        }
        if aborted > 0 {
            info!(bucket = %bucket, aborted, "aborted stale multi-part uploads");
        }
        Ok(aborted)
    }

    async fn abort(&self, bucket: &str, key: &str, upload_id: &str) -> Result<(), StagingError> {
        match self.store.abort_multipart_upload(bucket, key, upload_id).await {
            Ok(()) => {
                debug!(bucket, key, upload_id, "aborted multi-part upload");
                Ok(())
            }
            Err(err) if err.is_not_found() => Ok(()),
            Err(source) => Err(sweep_error(bucket, source)),
        }
    }
}

fn sweep_error(bucket: &str, source: CloudError) -> StagingError {
    StagingError::Sweep {
        bucket: bucket.to_owned(),
        source,
    }
}

fn sanitize_file_name(name: &str) -> String {
    let cleaned = name
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '.' | '-' | '_') {
                ch
            } else {
                '_'
            }
        })
        .collect::<String>();
    if cleaned.trim_matches('.').is_empty() {
        String::from("payload")
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests;
