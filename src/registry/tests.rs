//! Unit tests for the resource registry.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use camino::Utf8PathBuf;
use rstest::{fixture, rstest};
use tempfile::TempDir;

use super::lock::LedgerLock;
use super::*;
use crate::test_support::sample_entry;

struct Harness {
    _tmp: TempDir,
    registry: Registry,
}

#[fixture]
fn harness() -> Harness {
    let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
    let root = Utf8PathBuf::from_path_buf(tmp.path().join("state"))
        .unwrap_or_else(|path| panic!("temp path should be utf8: {}", path.display()));
    let registry = Registry::open(root, Duration::from_millis(200))
        .unwrap_or_else(|err| panic!("open registry: {err}"));
    Harness {
        _tmp: tmp,
        registry,
    }
}

fn owner() -> OwnerRecord {
    OwnerRecord::new("owner-a", 100)
}

#[rstest]
fn put_then_list_preserves_entries(harness: Harness) {
    let first = sample_entry("req-1", "eu-west-1", &owner());
    let second = sample_entry("req-2", "eu-west-1", &owner());
    harness.registry.put(first.clone()).expect("put first");
    harness.registry.put(second.clone()).expect("put second");

    let listed = harness.registry.list().expect("list");
    assert_eq!(listed, vec![first, second]);
    assert!(harness.registry.list_active().expect("active").is_empty());
}

#[rstest]
fn duplicate_identifiers_are_rejected(harness: Harness) {
    let entry = sample_entry("req-1", "eu-west-1", &owner());
    harness.registry.put(entry.clone()).expect("put");

    let err = harness
        .registry
        .put(entry)
        .expect_err("duplicate should fail");
    assert!(matches!(err, RegistryError::DuplicateEntry { .. }));
    assert_eq!(harness.registry.list().expect("list").len(), 1);
}

#[rstest]
fn state_follows_lifecycle_and_released_is_terminal(harness: Harness) {
    let entry = sample_entry("req-1", "eu-west-1", &owner());
    harness.registry.put(entry.clone()).expect("put");

    let active = harness
        .registry
        .update_state(&entry.id, EntryState::Active)
        .expect("activate");
    assert_eq!(active.state, EntryState::Active);
    assert_eq!(harness.registry.list_active().expect("active").len(), 1);

    harness
        .registry
        .update_state(&entry.id, EntryState::Active)
        .expect("same-state update is a no-op");
    harness
        .registry
        .update_state(&entry.id, EntryState::Released)
        .expect("release");

    let err = harness
        .registry
        .update_state(&entry.id, EntryState::Active)
        .expect_err("released is terminal");
    assert!(matches!(
        err,
        RegistryError::InvalidTransition {
            from: EntryState::Released,
            to: EntryState::Active,
            ..
        }
    ));
}

#[rstest]
fn pending_entries_may_be_released_directly(harness: Harness) {
    let entry = sample_entry("req-1", "eu-west-1", &owner());
    harness.registry.put(entry.clone()).expect("put");
    let released = harness
        .registry
        .update_state(&entry.id, EntryState::Released)
        .expect("release");
    assert_eq!(released.state, EntryState::Released);
}

#[rstest]
fn updating_a_missing_entry_fails(harness: Harness) {
    let err = harness
        .registry
        .update_state("missing", EntryState::Active)
        .expect_err("unknown entry");
    assert!(matches!(err, RegistryError::UnknownEntry { .. }));
}

#[rstest]
fn remove_is_idempotent(harness: Harness) {
    let entry = sample_entry("req-1", "eu-west-1", &owner());
    harness.registry.put(entry.clone()).expect("put");

    assert!(harness.registry.remove(&entry.id).expect("remove"));
    assert!(!harness.registry.remove(&entry.id).expect("second remove"));
    assert!(harness.registry.list().expect("list").is_empty());
}

#[rstest]
fn corrupt_ledger_is_moved_aside(harness: Harness) {
    std::fs::write(harness.registry.ledger_path(), "{ not json")
        .unwrap_or_else(|err| panic!("seed corrupt ledger: {err}"));

    assert!(harness.registry.list().expect("list").is_empty());

    assert_eq!(quarantined_ledgers(&harness.registry), 1);

    harness
        .registry
        .put(sample_entry("req-1", "eu-west-1", &owner()))
        .expect("fresh ledger accepts writes");
    assert_eq!(harness.registry.list().expect("list").len(), 1);
}

fn quarantined_ledgers(registry: &Registry) -> usize {
    std::fs::read_dir(registry.root())
        .unwrap_or_else(|err| panic!("read dir: {err}"))
        .filter_map(Result::ok)
        .filter(|item| {
            item.file_name()
                .to_string_lossy()
                .starts_with("registry.json.corrupt-")
        })
        .count()
}

#[rstest]
fn ledger_with_invalid_utf8_is_moved_aside(harness: Harness) {
    std::fs::write(harness.registry.ledger_path(), [0xff_u8, 0xfe, 0x00, 0x7b])
        .unwrap_or_else(|err| panic!("seed corrupt ledger: {err}"));

    assert!(harness.registry.list().expect("list").is_empty());
    assert_eq!(quarantined_ledgers(&harness.registry), 1);

    harness
        .registry
        .put(sample_entry("req-1", "eu-west-1", &owner()))
        .expect("fresh ledger accepts writes");
    assert_eq!(harness.registry.list().expect("list").len(), 1);
}

#[rstest]
fn entries_in_unknown_states_are_kept_aside(harness: Harness) {
    let known = sample_entry("req-1", "eu-west-1", &owner());
    harness.registry.put(known.clone()).expect("put");
    let path = harness.registry.ledger_path();
    let mut raw: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(&path).unwrap_or_else(|err| panic!("read ledger: {err}")),
    )
    .unwrap_or_else(|err| panic!("parse ledger: {err}"));
    let mut future = raw["entries"][0].clone();
    future["id"] = serde_json::json!("from-a-newer-release");
    future["state"] = serde_json::json!("archived");
    raw["entries"]
        .as_array_mut()
        .unwrap_or_else(|| panic!("entries should be an array"))
        .push(future);
    std::fs::write(&path, raw.to_string()).unwrap_or_else(|err| panic!("write ledger: {err}"));

    assert_eq!(harness.registry.list().expect("list"), vec![known.clone()]);

    let later = sample_entry("req-2", "eu-west-1", &owner());
    harness.registry.put(later.clone()).expect("put after unknown entry");
    assert_eq!(harness.registry.list().expect("list"), vec![known, later]);
    assert_eq!(quarantined_ledgers(&harness.registry), 0);
    let rewritten = std::fs::read_to_string(&path).unwrap_or_else(|err| panic!("read: {err}"));
    assert!(rewritten.contains("from-a-newer-release"), "ledger: {rewritten}");
    assert!(rewritten.contains("\"archived\""), "ledger: {rewritten}");
}

#[rstest]
#[tokio::test(flavor = "current_thread")]
async fn lock_waits_leave_the_runtime_free(harness: Harness) {
    let held = LedgerLock::acquire(
        &harness.registry.root().join(LOCK_FILE),
        Duration::from_secs(1),
    )
    .expect("hold lock");
    let ticks = Arc::new(AtomicUsize::new(0));
    let ticker = {
        let counter = Arc::clone(&ticks);
        tokio::spawn(async move {
            loop {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
    };
    let entry = sample_entry("req-1", "eu-west-1", &owner());
    let pending = {
        let registry = harness.registry.clone();
        tokio::spawn(async move { registry.blocking(move |inner| inner.put(entry)).await })
    };

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(ticks.load(Ordering::SeqCst) >= 5, "runtime stalled");
    assert!(!pending.is_finished());

    drop(held);
    pending
        .await
        .expect("join")
        .expect("put completes once the lock is free");
    ticker.abort();
    assert_eq!(harness.registry.list().expect("list").len(), 1);
}

#[rstest]
fn ledger_reads_tolerate_unknown_and_missing_fields(harness: Harness) {
    let ledger = r#"{
        "future_field": true,
        "entries": [{
            "id": "e-1",
            "request_id": "req-1",
            "owner": { "id": "owner-b" },
            "state": "active",
            "created_at": "2026-10-18T10:00:00Z",
            "annotations": { "ignored": 1 }
        }]
    }"#;
    std::fs::write(harness.registry.ledger_path(), ledger)
        .unwrap_or_else(|err| panic!("seed ledger: {err}"));

    let entries = harness.registry.list_active().expect("list");
    let [entry] = entries.as_slice() else {
        panic!("expected one entry, got {entries:?}");
    };
    assert_eq!(entry.owner.pid, 0);
    assert!(entry.grant.is_none());
    assert!(entry.object.is_none());
    assert_eq!(entry.region, "");
}

#[rstest]
fn owner_leases_report_liveness(harness: Harness) {
    let owner = owner();
    assert!(!harness.registry.owner_alive(&owner.id).expect("probe"));

    let lease = harness.registry.owner_lease(&owner).expect("lease");
    assert_eq!(lease.owner(), &owner);
    assert!(harness.registry.owner_alive(&owner.id).expect("probe"));

    let err = harness
        .registry
        .owner_lease(&owner)
        .expect_err("second lease should fail");
    assert!(matches!(err, RegistryError::LeaseHeld { .. }));

    drop(lease);
    assert!(!harness.registry.owner_alive(&owner.id).expect("probe"));
}

#[rstest]
fn mutations_time_out_while_the_lock_is_held(harness: Harness) {
    let held = LedgerLock::acquire(
        &harness.registry.root().join("registry.lock"),
        Duration::from_secs(1),
    )
    .expect("hold lock");

    let err = harness
        .registry
        .put(sample_entry("req-1", "eu-west-1", &owner()))
        .expect_err("lock should time out");
    assert!(matches!(err, RegistryError::LockTimeout { .. }));

    drop(held);
    harness
        .registry
        .put(sample_entry("req-1", "eu-west-1", &owner()))
        .expect("put after release");
}
