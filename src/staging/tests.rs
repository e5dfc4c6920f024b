//! Unit tests for the staging store.

use std::sync::Arc;
use std::time::Duration;

use camino::Utf8PathBuf;
use chrono::Utc;
use rstest::{fixture, rstest};
use tempfile::TempDir;

use super::*;
use crate::test_support::{Fault, FakeCloud, TEST_ACCOUNT, staging_bucket};

#[fixture]
fn cloud() -> Arc<FakeCloud> {
    Arc::new(FakeCloud::new())
}

fn store(cloud: &Arc<FakeCloud>) -> StagingStore<FakeCloud> {
    StagingStore::new(Arc::clone(cloud), StagingPolicy::default())
}

fn payload_file(tmp: &TempDir, bytes: &[u8]) -> Utf8PathBuf {
    let path = Utf8PathBuf::from_path_buf(tmp.path().join("payload.bin"))
        .unwrap_or_else(|path| panic!("temp path should be utf8: {}", path.display()));
    std::fs::write(&path, bytes).unwrap_or_else(|err| panic!("write payload: {err}"));
    path
}

#[rstest]
#[tokio::test]
async fn ensure_bucket_is_idempotent_and_applies_expiry(cloud: Arc<FakeCloud>) {
    let staging = store(&cloud);

    let first = staging.ensure_bucket("eu-west-1").await.expect("ensure");
    let second = staging.ensure_bucket("eu-west-1").await.expect("ensure again");

    assert_eq!(first, staging_bucket("eu-west-1"));
    assert_eq!(first, second);
    assert_eq!(cloud.buckets(), vec![first.clone()]);
    let rule = cloud.lifecycle(&first).expect("lifecycle rule applied");
    assert_eq!(rule.expiration_days, 1);
    assert_eq!(rule.abort_incomplete_days, 1);
    assert_eq!(rule.prefix, STAGING_KEY_PREFIX);
}

#[rstest]
#[tokio::test]
async fn default_bucket_name_carries_the_account(cloud: Arc<FakeCloud>) {
    let bucket = store(&cloud).bucket_for("EU-West-1").await.expect("bucket name");

    assert_eq!(bucket, format!("sluice-staging-{TEST_ACCOUNT}-eu-west-1"));
}

#[rstest]
#[tokio::test]
async fn bucket_override_wins_over_prefix(cloud: Arc<FakeCloud>) {
    let staging = StagingStore::new(
        cloud,
        StagingPolicy {
            bucket_override: Some(String::from("team-transfer-bucket")),
            ..StagingPolicy::default()
        },
    );
    assert_eq!(
        staging.bucket_for("us-east-1").await.expect("bucket name"),
        "team-transfer-bucket"
    );
}

#[rstest]
#[case("report.tar.gz", "report.tar.gz")]
#[case("my file (1).bin", "my_file__1_.bin")]
#[case("..", "payload")]
fn planned_keys_are_scoped_to_the_request(
    cloud: Arc<FakeCloud>,
    #[case] file_name: &str,
    #[case] expected: &str,
) {
    let object = store(&cloud).plan_object("sluice-staging-test", "req-9", file_name, 42);
    assert_eq!(object.bucket, "sluice-staging-test");
    assert_eq!(object.key, format!("sluice/req-9/{expected}"));
    assert_eq!(object.request_id, "req-9");
    assert!(object.expires_at > object.created_at);
    assert!(cloud.objects().is_empty());
}

#[rstest]
#[tokio::test]
async fn stage_fetch_unstage_round_trip(cloud: Arc<FakeCloud>) {
    let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
    let source = payload_file(&tmp, b"staged bytes");
    let staging = store(&cloud);
    let bucket = staging.ensure_bucket("eu-west-1").await.expect("bucket");
    let object = staging.plan_object(&bucket, "req-1", "payload.bin", 12);

    staging.stage(&object, &source).await.expect("stage");
    assert_eq!(cloud.objects(), vec![(object.bucket.clone(), object.key.clone())]);

    let destination = source.with_file_name("fetched.bin");
    staging.fetch(&object, &destination).await.expect("fetch");
    let fetched = std::fs::read(&destination).unwrap_or_else(|err| panic!("read: {err}"));
    assert_eq!(fetched, b"staged bytes");

    staging.unstage(&object).await.expect("unstage");
    staging.unstage(&object).await.expect("unstage is idempotent");
    assert!(cloud.objects().is_empty());
}

#[rstest]
#[tokio::test]
async fn failed_stage_aborts_partial_upload(cloud: Arc<FakeCloud>) {
    let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
    let source = payload_file(&tmp, b"partial");
    let staging = store(&cloud);
    let bucket = staging.ensure_bucket("eu-west-1").await.expect("bucket");
    let object = staging.plan_object(&bucket, "req-1", "payload.bin", 7);
    cloud.inject(Fault::PutObject);

    let err = staging
        .stage(&object, &source)
        .await
        .expect_err("stage should fail");

    assert!(matches!(err, StagingError::Upload { .. }));
    assert!(cloud.multipart_uploads(&object.bucket).is_empty());
    assert!(cloud.objects().is_empty());
}

#[rstest]
#[tokio::test]
async fn sweep_aborts_only_stale_uploads(cloud: Arc<FakeCloud>) {
    let staging = store(&cloud);
    let bucket = staging.ensure_bucket("eu-west-1").await.expect("bucket");
    let now = Utc::now();
    cloud.add_multipart_upload(&bucket, "sluice/old/payload", now - chrono::Duration::hours(30));
    cloud.add_multipart_upload(&bucket, "sluice/new/payload", now - chrono::Duration::hours(1));

    let aborted = staging
        .sweep_incomplete_uploads("eu-west-1")
        .await
        .expect("sweep");

    assert_eq!(aborted, 1);
    let remaining = cloud.multipart_uploads(&bucket);
    assert_eq!(remaining.len(), 1);
    assert_eq!(
        remaining.first().map(|upload| upload.key.as_str()),
        Some("sluice/new/payload")
    );
}

#[rstest]
#[tokio::test]
async fn sweep_of_missing_bucket_is_empty(cloud: Arc<FakeCloud>) {
    let staging = StagingStore::new(
        cloud,
        StagingPolicy {
            multipart_abort_after: Duration::ZERO,
            ..StagingPolicy::default()
        },
    );
    assert_eq!(
        staging
            .sweep_incomplete_uploads("ap-south-1")
            .await
            .expect("sweep"),
        0
    );
}
