//! Routine and emergency sweeps over entries left by other processes.

#[path = "common/harness.rs"]
mod harness;

use harness::{Harness, REGION};
use rstest::{fixture, rstest};
use sluice::registry::{EntryState, OwnerRecord};
use sluice::test_support::sample_entry;
use sluice::{JanitorError, SweepMode, SweepSummary};

#[fixture]
fn env() -> Harness {
    Harness::new()
}

/// Seeds an `Active` entry whose grant and object exist in the cloud.
async fn seed(env: &Harness, request_id: &str, owner: &OwnerRecord) -> String {
    let entry = sample_entry(request_id, REGION, owner);
    let id = entry.id.clone();
    let object = entry.object.clone().expect("sample entry has an object");
    let grant = entry.grant.clone().expect("sample entry has a grant");
    env.registry.put(entry).expect("put");
    env.registry
        .update_state(&id, EntryState::Active)
        .expect("activate");
    env.cloud
        .put_object_bytes(&object.bucket, &object.key, b"staged".to_vec());
    sluice::CredentialManager::new(
        std::sync::Arc::clone(&env.cloud),
        sluice::CredentialPolicy::default(),
    )
    .issue(&grant)
    .await
    .expect("issue grant");
    id
}

#[rstest]
#[tokio::test]
async fn routine_cleanup_waits_for_the_owner_to_exit(env: Harness) {
    let owner = OwnerRecord::new("owner-live", 4242);
    let lease = env.registry.owner_lease(&owner).expect("take lease");
    let id = seed(&env, "req-live", &owner).await;
    let janitor = env.janitor();

    let first = janitor.cleanup(REGION).await.expect("first sweep");

    assert_eq!(first.skipped_live, 1);
    assert_eq!(first.removed_entries, 0);
    assert!(env.registry.get(&id).expect("get").is_some());
    assert_eq!(env.cloud.policies().len(), 1);

    drop(lease);
    let second = janitor.cleanup(REGION).await.expect("second sweep");

    assert_eq!(second.removed_entries, 1);
    assert_eq!(second.revoked_grants, 1);
    assert_eq!(second.deleted_objects, 1);
    assert!(env.registry.list().expect("list").is_empty());
    assert!(env.cloud.policies().is_empty());
    assert!(env.cloud.objects().is_empty());
}

#[rstest]
#[tokio::test]
async fn emergency_cleanup_ignores_live_owners(env: Harness) {
    let owner = OwnerRecord::new("owner-stuck", 77);
    let _lease = env.registry.owner_lease(&owner).expect("take lease");
    seed(&env, "req-stuck", &owner).await;

    let summary = env
        .janitor()
        .sweep(REGION, SweepMode::Emergency)
        .await
        .expect("emergency sweep");

    assert_eq!(summary.skipped_live, 0);
    assert_eq!(summary.removed_entries, 1);
    assert!(env.registry.list().expect("list").is_empty());
}

#[rstest]
#[tokio::test]
async fn cleanup_is_idempotent(env: Harness) {
    seed(&env, "req-orphan", &OwnerRecord::new("owner-gone", 9)).await;
    let janitor = env.janitor();

    let first = janitor.cleanup(REGION).await.expect("first sweep");
    let second = janitor.cleanup(REGION).await.expect("second sweep");

    assert_eq!(first.removed_entries, 1);
    assert_eq!(second, SweepSummary::default());
}

#[rstest]
#[tokio::test]
async fn entries_in_other_regions_are_left_alone(env: Harness) {
    let other = sample_entry("req-elsewhere", "ap-south-1", &OwnerRecord::new("owner-gone", 9));
    let id = other.id.clone();
    env.registry.put(other).expect("put");

    let summary = env
        .janitor()
        .emergency_cleanup(REGION)
        .await
        .expect("sweep");

    assert_eq!(summary.removed_entries, 0);
    assert!(env.registry.get(&id).expect("get").is_some());
}

#[rstest]
#[tokio::test]
async fn failed_teardown_keeps_the_entry_and_reports_not_clean(env: Harness) {
    let id = seed(&env, "req-stubborn", &OwnerRecord::new("owner-gone", 9)).await;
    env.cloud.inject(sluice::test_support::Fault::DeletePolicy);

    let err = env
        .janitor()
        .cleanup(REGION)
        .await
        .expect_err("revocation fails");

    assert!(
        matches!(err, JanitorError::NotClean { ref failures, .. } if failures.len() == 1),
        "unexpected error: {err}"
    );
    assert!(env.registry.get(&id).expect("get").is_some());

    env.cloud.clear(sluice::test_support::Fault::DeletePolicy);
    let summary = env.janitor().cleanup(REGION).await.expect("retry");
    assert_eq!(summary.removed_entries, 1);
}
