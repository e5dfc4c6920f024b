//! End-to-end transfer scenarios against the in-memory cloud.

#[path = "common/harness.rs"]
mod harness;

use harness::{Harness, REGION, TARGET, payload};
use proptest::prelude::*;
use rstest::{fixture, rstest};
use sluice::registry::OwnerRecord;
use sluice::test_support::{Fault, staging_bucket};
use sluice::transfer::DEFAULT_DIRECT_THRESHOLD;
use sluice::{Route, TransferErrorKind, TransferRequest};

#[fixture]
fn env() -> Harness {
    Harness::new()
}

fn owner() -> OwnerRecord {
    OwnerRecord::new("owner-scenarios", 7)
}

#[rstest]
#[tokio::test]
async fn half_megabyte_upload_goes_direct_and_leaves_nothing(env: Harness) {
    let bytes = payload(500 * 1024);
    let local = env.local_file("small.bin", &bytes);
    let request = TransferRequest::upload(TARGET, &local, "/data/small.bin", bytes.len() as u64);

    let report = env
        .router(&owner())
        .transfer(&request)
        .await
        .expect("direct upload");

    assert_eq!(report.route, Route::Direct);
    assert_eq!(env.cloud.remote_file(TARGET, "/data/small.bin"), Some(bytes));
    assert!(env.registry.list().expect("list").is_empty());
    assert!(env.cloud.policies().is_empty());
    assert!(env.cloud.buckets().is_empty());
}

#[rstest]
#[tokio::test]
async fn five_megabyte_upload_is_staged_and_torn_down(env: Harness) {
    let bytes = payload(5 * 1024 * 1024);
    let local = env.local_file("large.bin", &bytes);
    let request = TransferRequest::upload(TARGET, &local, "/data/large.bin", bytes.len() as u64);

    let report = env
        .router(&owner())
        .transfer(&request)
        .await
        .expect("staged upload");

    assert_eq!(report.route, Route::Staged);
    assert_eq!(env.cloud.remote_file(TARGET, "/data/large.bin"), Some(bytes));
    assert!(env.registry.list().expect("list").is_empty());
    assert!(env.cloud.policies().is_empty());
    assert!(env.cloud.objects().is_empty());
    assert!(env.cloud.lifecycle(&staging_bucket(REGION)).is_some());
}

#[rstest]
#[tokio::test]
async fn failed_staging_is_reclaimed_by_emergency_cleanup(env: Harness) {
    let bytes = payload(2 * 1024 * 1024);
    let local = env.local_file("large.bin", &bytes);
    let request = TransferRequest::upload(TARGET, &local, "/data/large.bin", bytes.len() as u64);
    env.cloud.inject(Fault::RemoteCopy);

    let err = env
        .router(&owner())
        .transfer(&request)
        .await
        .expect_err("remote copy fails");

    assert_eq!(err.kind(), TransferErrorKind::RemoteExit);
    let entry_id = err.entry_id().expect("entry left for cleanup").to_owned();
    let active = env.registry.list_active().expect("active");
    assert_eq!(active.len(), 1);
    assert!(active.iter().all(|entry| entry.id == entry_id));

    env.cloud.clear(Fault::RemoteCopy);
    let summary = env
        .janitor()
        .emergency_cleanup(REGION)
        .await
        .expect("emergency cleanup");

    assert_eq!(summary.removed_entries, 1);
    assert!(env.registry.list().expect("list").is_empty());
    assert!(env.cloud.policies().is_empty());
    assert!(env.cloud.objects().is_empty());
    assert_eq!(env.cloud.remote_file(TARGET, "/data/large.bin"), None);
}

#[rstest]
#[tokio::test]
async fn staged_download_round_trips(env: Harness) {
    let bytes = payload(3 * 1024 * 1024 + 17);
    env.cloud.put_remote_file(TARGET, "/var/log/big.log", bytes.clone());
    let local = env.root.join("big.log");
    let router = env.router(&owner());
    let probe = TransferRequest::download(TARGET, "/var/log/big.log", &local, 0);
    let size = router.remote_size(&probe).await.expect("size probe");

    let report = router
        .transfer(&probe.with_size(size))
        .await
        .expect("staged download");

    assert_eq!(report.route, Route::Staged);
    assert_eq!(std::fs::read(&local).expect("read local"), bytes);
    assert!(env.registry.list().expect("list").is_empty());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(6))]

    #[test]
    fn payloads_below_the_threshold_never_touch_the_registry(
        len in 0..DEFAULT_DIRECT_THRESHOLD,
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .expect("runtime");
        let env = Harness::new();
        let bytes = payload(usize::try_from(len).expect("length fits in memory"));
        let local = env.local_file("p.bin", &bytes);
        let request = TransferRequest::upload(TARGET, &local, "/data/p.bin", len);

        let report = runtime
            .block_on(env.router(&owner()).transfer(&request))
            .expect("direct upload");

        prop_assert_eq!(report.route, Route::Direct);
        prop_assert!(env.registry.list().expect("list").is_empty());
        prop_assert!(env.cloud.policies().is_empty());
        prop_assert_eq!(env.cloud.remote_file(TARGET, "/data/p.bin"), Some(bytes));
    }
}
