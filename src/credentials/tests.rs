//! Unit tests for the credential manager.

use std::sync::Arc;
use std::time::Duration;

use rstest::{fixture, rstest};

use super::*;
use crate::registry::OwnerRecord;
use crate::test_support::{Fault, FakeCloud};

const ROLE: &str = "sluice-target-role";

#[fixture]
fn cloud() -> Arc<FakeCloud> {
    Arc::new(FakeCloud::new())
}

fn owner() -> OwnerRecord {
    OwnerRecord::new("owner-1", 4242)
}

fn manager(cloud: &Arc<FakeCloud>) -> CredentialManager<FakeCloud> {
    CredentialManager::new(Arc::clone(cloud), CredentialPolicy::default())
}

fn read_scope() -> GrantScope {
    GrantScope::target_read("sluice-staging-eu-west-1", "transfers/req-1/payload")
}

#[rstest]
#[case(Some(Duration::ZERO))]
#[case(Some(MAX_GRANT_TTL + Duration::from_secs(1)))]
fn request_rejects_out_of_range_lifetimes(cloud: Arc<FakeCloud>, #[case] ttl: Option<Duration>) {
    let err = manager(&cloud)
        .request(read_scope(), ttl, ROLE, "req-1", &owner())
        .expect_err("lifetime should be rejected");
    assert!(matches!(err, CredentialError::InvalidTtl { .. }));
}

#[rstest]
fn request_defaults_lifetime_and_does_not_touch_the_store(cloud: Arc<FakeCloud>) {
    let credentials = manager(&cloud);
    let grant = credentials
        .request(read_scope(), None, ROLE, "req-1", &owner())
        .expect("request should succeed");

    let lifetime = grant.expires_at - grant.created_at;
    assert_eq!(lifetime.num_seconds(), 15 * 60);
    assert_eq!(credentials.state(&grant.id), Some(GrantState::Requested));
    assert!(cloud.policies().is_empty());
}

#[rstest]
fn request_rejects_blank_principal(cloud: Arc<FakeCloud>) {
    let err = manager(&cloud)
        .request(read_scope(), None, "  ", "req-1", &owner())
        .expect_err("blank principal should be rejected");
    assert!(matches!(err, CredentialError::InvalidScope { .. }));
}

#[rstest]
fn repeated_requests_never_reuse_identifiers(cloud: Arc<FakeCloud>) {
    let credentials = manager(&cloud);
    let first = credentials
        .request(read_scope(), None, ROLE, "req-1", &owner())
        .expect("first request");
    let second = credentials
        .request(read_scope(), None, ROLE, "req-1", &owner())
        .expect("second request");
    assert_ne!(first.id, second.id);
}

#[rstest]
#[tokio::test]
async fn issue_then_revoke_detaches_policy(cloud: Arc<FakeCloud>) {
    let credentials = manager(&cloud);
    let grant = credentials
        .request(read_scope(), None, ROLE, "req-1", &owner())
        .expect("request");

    credentials.issue(&grant).await.expect("issue");
    assert_eq!(credentials.state(&grant.id), Some(GrantState::Active));
    assert_eq!(cloud.policies(), vec![(ROLE.to_owned(), grant.policy_name())]);

    credentials.revoke(&grant).await.expect("revoke");
    credentials.revoke(&grant).await.expect("second revoke is a no-op");
    assert_eq!(credentials.state(&grant.id), Some(GrantState::Revoked));
    assert!(cloud.policies().is_empty());
}

#[rstest]
#[tokio::test]
async fn revoking_an_unknown_grant_succeeds(cloud: Arc<FakeCloud>) {
    let credentials = manager(&cloud);
    let grant = credentials
        .request(read_scope(), None, ROLE, "req-1", &owner())
        .expect("request");

    // Never issued: the store reports the policy as missing.
    credentials.revoke(&grant).await.expect("revoke");
    assert_eq!(credentials.state(&grant.id), Some(GrantState::Revoked));
}

#[rstest]
#[tokio::test]
async fn revoked_grants_cannot_be_reissued(cloud: Arc<FakeCloud>) {
    let credentials = manager(&cloud);
    let grant = credentials
        .request(read_scope(), None, ROLE, "req-1", &owner())
        .expect("request");
    credentials.issue(&grant).await.expect("issue");
    credentials.revoke(&grant).await.expect("revoke");

    let err = credentials
        .issue(&grant)
        .await
        .expect_err("revoked grant must not be reissued");
    assert!(matches!(err, CredentialError::AlreadyRevoked { .. }));
    assert!(cloud.policies().is_empty());
}

#[rstest]
#[tokio::test]
async fn issue_failure_leaves_grant_requested(cloud: Arc<FakeCloud>) {
    let credentials = manager(&cloud);
    let grant = credentials
        .request(read_scope(), None, ROLE, "req-1", &owner())
        .expect("request");
    cloud.inject(Fault::PutPolicy);

    let err = credentials
        .issue(&grant)
        .await
        .expect_err("issue should fail");
    assert!(matches!(err, CredentialError::Issue { .. }));
    assert_eq!(credentials.state(&grant.id), Some(GrantState::Requested));
}

#[rstest]
#[tokio::test]
async fn revoke_failure_is_reported(cloud: Arc<FakeCloud>) {
    let credentials = manager(&cloud);
    let grant = credentials
        .request(read_scope(), None, ROLE, "req-1", &owner())
        .expect("request");
    credentials.issue(&grant).await.expect("issue");
    cloud.inject(Fault::DeletePolicy);

    let err = credentials
        .revoke(&grant)
        .await
        .expect_err("revoke should fail");
    assert!(matches!(err, CredentialError::Revoke { .. }));
    assert_eq!(credentials.state(&grant.id), Some(GrantState::Active));
}

#[test]
fn revoked_is_terminal() {
    assert!(!GrantState::Revoked.can_transition_to(GrantState::Active));
    assert!(!GrantState::Revoked.can_transition_to(GrantState::Requested));
    assert!(GrantState::Requested.can_transition_to(GrantState::Revoked));
}
