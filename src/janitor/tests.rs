//! Unit tests for the janitor module.

use std::time::Duration;

use camino::Utf8PathBuf;
use chrono::Utc;
use rstest::{fixture, rstest};
use tempfile::TempDir;

use super::*;
use crate::cloud::AuthorizationStore;
use crate::registry::OwnerRecord;
use crate::test_support::{Fault, FakeCloud, sample_entry, staging_bucket};

const REGION: &str = "eu-west-1";

struct Harness {
    _tmp: TempDir,
    cloud: Arc<FakeCloud>,
    registry: Registry,
    janitor: Janitor<FakeCloud>,
}

impl Harness {
    async fn seed(&self, entry: RegistryEntry, state: EntryState) -> RegistryEntry {
        let grant = entry.grant.clone().expect("sample entries carry a grant");
        let object = entry.object.clone().expect("sample entries carry an object");
        self.cloud
            .put_policy(&grant.policy())
            .await
            .expect("attach policy");
        self.cloud
            .put_object_bytes(&object.bucket, &object.key, b"payload".to_vec());
        self.registry.put(entry.clone()).expect("record entry");
        if state != EntryState::Pending {
            self.registry
                .update_state(&entry.id, state)
                .expect("set state");
        }
        entry
    }
}

#[fixture]
fn harness() -> Harness {
    let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
    let root = Utf8PathBuf::from_path_buf(tmp.path().join("state"))
        .unwrap_or_else(|path| panic!("temp path should be utf8: {}", path.display()));
    let registry = Registry::open(root, Duration::from_secs(5)).expect("open registry");
    let cloud = Arc::new(FakeCloud::new());
    let janitor = Janitor::new(Arc::clone(&cloud), registry.clone(), StagingPolicy::default());
    Harness {
        _tmp: tmp,
        cloud,
        registry,
        janitor,
    }
}

fn dead_owner() -> OwnerRecord {
    OwnerRecord::new("owner-gone", 4242)
}

#[rstest]
#[tokio::test]
async fn cleanup_reclaims_entries_of_dead_owners(harness: Harness) {
    harness
        .seed(sample_entry("req-1", REGION, &dead_owner()), EntryState::Active)
        .await;

    let summary = harness.janitor.cleanup(REGION).await.expect("cleanup");

    assert_eq!(summary.removed_entries, 1);
    assert_eq!(summary.revoked_grants, 1);
    assert_eq!(summary.deleted_objects, 1);
    assert!(harness.registry.list().expect("list").is_empty());
    assert!(harness.cloud.policies().is_empty());
    assert!(harness.cloud.objects().is_empty());
}

#[rstest]
#[tokio::test]
async fn cleanup_skips_live_transfers(harness: Harness) {
    let owner = OwnerRecord::new("owner-live", 1);
    let _lease = harness.registry.owner_lease(&owner).expect("lease");
    harness
        .seed(sample_entry("req-1", REGION, &owner), EntryState::Active)
        .await;

    let summary = harness.janitor.cleanup(REGION).await.expect("cleanup");

    assert_eq!(summary.skipped_live, 1);
    assert!(summary.is_noop());
    assert_eq!(harness.registry.list_active().expect("active").len(), 1);
    assert_eq!(harness.cloud.policies().len(), 1);
}

#[rstest]
#[tokio::test]
async fn cleanup_reclaims_expired_and_released_entries_of_live_owners(harness: Harness) {
    let owner = OwnerRecord::new("owner-live", 1);
    let _lease = harness.registry.owner_lease(&owner).expect("lease");
    let mut expired = sample_entry("req-1", REGION, &owner);
    if let Some(grant) = expired.grant.as_mut() {
        grant.expires_at = Utc::now() - chrono::Duration::minutes(1);
    }
    harness.seed(expired, EntryState::Active).await;
    harness
        .seed(sample_entry("req-2", REGION, &owner), EntryState::Released)
        .await;

    let summary = harness.janitor.cleanup(REGION).await.expect("cleanup");

    assert_eq!(summary.removed_entries, 2);
    assert_eq!(summary.skipped_live, 0);
    assert!(harness.registry.list().expect("list").is_empty());
}

#[rstest]
#[tokio::test]
async fn second_cleanup_is_a_noop(harness: Harness) {
    harness
        .seed(sample_entry("req-1", REGION, &dead_owner()), EntryState::Active)
        .await;
    harness
        .seed(sample_entry("req-2", REGION, &dead_owner()), EntryState::Pending)
        .await;

    let first = harness.janitor.cleanup(REGION).await.expect("first cleanup");
    let second = harness.janitor.cleanup(REGION).await.expect("second cleanup");

    assert_eq!(first.removed_entries, 2);
    assert_eq!(second, SweepSummary::default());
}

#[rstest]
#[tokio::test]
async fn emergency_cleanup_ignores_owner_and_age(harness: Harness) {
    let owner = OwnerRecord::new("owner-live", 1);
    let _lease = harness.registry.owner_lease(&owner).expect("lease");
    harness
        .seed(sample_entry("req-1", REGION, &owner), EntryState::Active)
        .await;
    harness
        .seed(sample_entry("req-2", REGION, &dead_owner()), EntryState::Active)
        .await;

    let summary = harness
        .janitor
        .emergency_cleanup(REGION)
        .await
        .expect("emergency cleanup");

    assert_eq!(summary.removed_entries, 2);
    assert!(harness.registry.list_active().expect("active").is_empty());
    assert!(harness.cloud.policies().is_empty());
    assert!(harness.cloud.objects().is_empty());
}

#[rstest]
#[tokio::test]
async fn other_regions_are_untouched(harness: Harness) {
    harness
        .seed(sample_entry("req-1", "us-east-2", &dead_owner()), EntryState::Active)
        .await;

    let summary = harness
        .janitor
        .emergency_cleanup(REGION)
        .await
        .expect("cleanup");

    assert!(summary.is_noop());
    assert_eq!(harness.registry.list().expect("list").len(), 1);
}

#[rstest]
#[tokio::test]
async fn failed_teardown_keeps_the_entry(harness: Harness) {
    let entry = harness
        .seed(sample_entry("req-1", REGION, &dead_owner()), EntryState::Active)
        .await;
    harness.cloud.inject(Fault::DeletePolicy);

    let err = harness
        .janitor
        .cleanup(REGION)
        .await
        .expect_err("revoke failure should surface");

    let JanitorError::NotClean { failures, mode, .. } = err else {
        panic!("expected NotClean, got {err:?}");
    };
    assert_eq!(mode, SweepMode::Routine);
    assert_eq!(failures.len(), 1);
    assert!(failures.iter().all(|failure| failure.contains(&entry.id)));
    let remaining = harness.registry.list_active().expect("active");
    assert_eq!(remaining.len(), 1);

    harness.cloud.clear(Fault::DeletePolicy);
    let retry = harness.janitor.cleanup(REGION).await.expect("retry");
    assert_eq!(retry.removed_entries, 1);
}

#[rstest]
#[tokio::test]
async fn stale_multipart_uploads_are_aborted(harness: Harness) {
    let bucket = staging_bucket(REGION);
    harness.cloud.add_multipart_upload(
        &bucket,
        "sluice/req-old/payload.bin",
        Utc::now() - chrono::Duration::hours(30),
    );
    harness
        .cloud
        .add_multipart_upload(&bucket, "sluice/req-new/payload.bin", Utc::now());

    let summary = harness.janitor.cleanup(REGION).await.expect("cleanup");

    assert_eq!(summary.aborted_uploads, 1);
    let left = harness.cloud.multipart_uploads(&bucket);
    assert_eq!(left.len(), 1);
    assert!(left.iter().all(|upload| upload.key.contains("req-new")));
}
