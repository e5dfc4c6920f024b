//! `aws s3api` and `aws s3` backed [`ObjectStore`].

use camino::Utf8Path;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;

use super::AwsCli;
use crate::cloud::{
    CloudError, CloudFuture, LifecycleRule, MultipartUpload, ObjectStore, ObjectSummary,
};
use crate::runner::CommandRunner;

/// Region whose buckets reject an explicit location constraint.
const DEFAULT_BUCKET_REGION: &str = "us-east-1";

const BLOCK_PUBLIC_ACCESS: &str = "BlockPublicAcls=true,IgnorePublicAcls=true,\
BlockPublicPolicy=true,RestrictPublicBuckets=true";

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListObjectsOutput {
    #[serde(default)]
    contents: Vec<ListedObject>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListedObject {
    key: String,
    #[serde(default)]
    size: u64,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListUploadsOutput {
    #[serde(default)]
    uploads: Vec<ListedUpload>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListedUpload {
    key: String,
    upload_id: String,
    initiated: DateTime<Utc>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CallerIdentity {
    account: String,
}

fn object_url(bucket: &str, key: &str) -> String {
    format!("s3://{bucket}/{key}")
}

fn lifecycle_document(rule: &LifecycleRule) -> String {
    json!({
        "Rules": [{
            "ID": rule.id,
            "Filter": { "Prefix": rule.prefix },
            "Status": "Enabled",
            "Expiration": { "Days": rule.expiration_days },
            "AbortIncompleteMultipartUpload": {
                "DaysAfterInitiation": rule.abort_incomplete_days,
            },
        }],
    })
    .to_string()
}

impl<R: CommandRunner> ObjectStore for AwsCli<R> {
    fn account_id(&self) -> CloudFuture<'_, String> {
        Box::pin(async move {
            let identity: CallerIdentity = self
                .call_json("caller identity", &["sts", "get-caller-identity"])
                .await?;
            Ok(identity.account)
        })
    }

    fn bucket_exists<'a>(&'a self, bucket: &'a str) -> CloudFuture<'a, bool> {
        Box::pin(async move {
            let resource = format!("bucket {bucket}");
            match self
                .call(&resource, &["s3api", "head-bucket", "--bucket", bucket])
                .await
            {
                Ok(_) => Ok(true),
                Err(CloudError::NotFound { .. }) => Ok(false),
                Err(err) => Err(err),
            }
        })
    }

    fn create_bucket<'a>(&'a self, bucket: &'a str, region: &'a str) -> CloudFuture<'a, ()> {
        Box::pin(async move {
            let resource = format!("bucket {bucket}");
            let constraint = format!("LocationConstraint={region}");
            let mut args = vec!["s3api", "create-bucket", "--bucket", bucket];
            if region != DEFAULT_BUCKET_REGION {
                args.extend(["--create-bucket-configuration", constraint.as_str()]);
            }
            match self.call(&resource, &args).await {
                Ok(_) => {}
                Err(CloudError::CommandFailure { stderr, .. })
                    if stderr.contains("BucketAlreadyOwnedByYou") => {}
                Err(err) => return Err(err),
            }
            self.call(
                &resource,
                &[
                    "s3api",
                    "put-public-access-block",
                    "--bucket",
                    bucket,
                    "--public-access-block-configuration",
                    BLOCK_PUBLIC_ACCESS,
                ],
            )
            .await?;
            Ok(())
        })
    }

    fn put_lifecycle<'a>(
        &'a self,
        bucket: &'a str,
        rule: &'a LifecycleRule,
    ) -> CloudFuture<'a, ()> {
        Box::pin(async move {
            let resource = format!("bucket {bucket}");
            let document = lifecycle_document(rule);
            self.call(
                &resource,
                &[
                    "s3api",
                    "put-bucket-lifecycle-configuration",
                    "--bucket",
                    bucket,
                    "--lifecycle-configuration",
                    &document,
                ],
            )
            .await?;
            Ok(())
        })
    }

    fn put_object<'a>(
        &'a self,
        bucket: &'a str,
        key: &'a str,
        source: &'a Utf8Path,
    ) -> CloudFuture<'a, ()> {
        Box::pin(async move {
            let url = object_url(bucket, key);
            self.call(
                &url,
                &["s3", "cp", source.as_str(), &url, "--only-show-errors"],
            )
            .await?;
            Ok(())
        })
    }

    fn get_object<'a>(
        &'a self,
        bucket: &'a str,
        key: &'a str,
        destination: &'a Utf8Path,
    ) -> CloudFuture<'a, ()> {
        Box::pin(async move {
            let url = object_url(bucket, key);
            self.call(
                &url,
                &["s3", "cp", &url, destination.as_str(), "--only-show-errors"],
            )
            .await?;
            Ok(())
        })
    }

    fn delete_object<'a>(&'a self, bucket: &'a str, key: &'a str) -> CloudFuture<'a, ()> {
        Box::pin(async move {
            let url = object_url(bucket, key);
            self.call(
                &url,
                &["s3api", "delete-object", "--bucket", bucket, "--key", key],
            )
            .await?;
            Ok(())
        })
    }

    fn list_objects<'a>(
        &'a self,
        bucket: &'a str,
        prefix: &'a str,
    ) -> CloudFuture<'a, Vec<ObjectSummary>> {
        Box::pin(async move {
            let resource = format!("bucket {bucket}");
            let listed: ListObjectsOutput = self
                .call_json(
                    &resource,
                    &[
                        "s3api",
                        "list-objects-v2",
                        "--bucket",
                        bucket,
                        "--prefix",
                        prefix,
                    ],
                )
                .await?;
            Ok(listed
                .contents
                .into_iter()
                .map(|object| ObjectSummary {
                    key: object.key,
                    size: object.size,
                })
                .collect())
        })
    }

    fn list_multipart_uploads<'a>(
        &'a self,
        bucket: &'a str,
        prefix: &'a str,
    ) -> CloudFuture<'a, Vec<MultipartUpload>> {
        Box::pin(async move {
            let resource = format!("bucket {bucket}");
            let listed: ListUploadsOutput = self
                .call_json(
                    &resource,
                    &[
                        "s3api",
                        "list-multipart-uploads",
                        "--bucket",
                        bucket,
                        "--prefix",
                        prefix,
                    ],
                )
                .await?;
            Ok(listed
                .uploads
                .into_iter()
                .map(|upload| MultipartUpload {
                    key: upload.key,
                    upload_id: upload.upload_id,
                    initiated: upload.initiated,
                })
                .collect())
        })
    }

    fn abort_multipart_upload<'a>(
        &'a self,
        bucket: &'a str,
        key: &'a str,
        upload_id: &'a str,
    ) -> CloudFuture<'a, ()> {
        Box::pin(async move {
            let resource = format!("upload {upload_id} of {}", object_url(bucket, key));
            self.call(
                &resource,
                &[
                    "s3api",
                    "abort-multipart-upload",
                    "--bucket",
                    bucket,
                    "--key",
                    key,
                    "--upload-id",
                    upload_id,
                ],
            )
            .await?;
            Ok(())
        })
    }
}
