//! Ephemeral, object-scoped authorization grants.
//!
//! A grant lets one target read or write one staged object for a bounded
//! time. It is rendered as an inline policy on the target's role and moves
//! through `Requested → Active → Revoked`. Revocation is idempotent so cleanup
//! paths can retry without branching on what already happened.

mod policy;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use crate::cloud::{AuthorizationStore, CloudError, GrantPolicy};
use crate::registry::OwnerRecord;

pub use policy::{GrantAction, GrantScope};

/// Grant lifetime used when the caller does not ask for one.
pub const DEFAULT_GRANT_TTL: Duration = Duration::from_secs(15 * 60);

/// Longest lifetime a grant may be issued with.
pub const MAX_GRANT_TTL: Duration = Duration::from_secs(60 * 60);

/// Prefix of every policy name this crate attaches.
pub const GRANT_POLICY_PREFIX: &str = "sluice-grant-";

/// A scoped, time-boxed authorization bound to one transfer.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct EphemeralGrant {
    /// Grant identifier; never reused.
    pub id: String,
    /// Role the policy is attached to.
    pub principal: String,
    /// Object and actions covered.
    pub scope: GrantScope,
    /// Process that requested the grant.
    pub owner: OwnerRecord,
    /// Transfer the grant was requested for.
    pub request_id: String,
    /// When the grant was requested.
    pub created_at: DateTime<Utc>,
    /// When the policy stops authorizing requests.
    pub expires_at: DateTime<Utc>,
}

impl EphemeralGrant {
    /// Name of the inline policy representing this grant.
    #[must_use]
    pub fn policy_name(&self) -> String {
        format!("{GRANT_POLICY_PREFIX}{}", self.id)
    }

    /// Policy attached when the grant is issued.
    #[must_use]
    pub fn policy(&self) -> GrantPolicy {
        GrantPolicy {
            principal: self.principal.clone(),
            name: self.policy_name(),
            document: self.scope.document(self.expires_at),
        }
    }

    /// Returns `true` once `now` has reached the expiry timestamp.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Lifecycle state of a grant within this process.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum GrantState {
    /// Planned and recorded, not yet attached.
    Requested,
    /// Attached to the principal.
    Active,
    /// Detached; terminal.
    Revoked,
}

impl GrantState {
    /// Returns `true` when moving from `self` to `next` is permitted.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Requested, Self::Active | Self::Revoked) | (Self::Active, Self::Revoked)
        )
    }
}

/// Lifetime bounds applied to new grants.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CredentialPolicy {
    /// Lifetime used when none is requested.
    pub default_ttl: Duration,
    /// Upper bound on any requested lifetime.
    pub max_ttl: Duration,
}

impl Default for CredentialPolicy {
    fn default() -> Self {
        Self {
            default_ttl: DEFAULT_GRANT_TTL,
            max_ttl: MAX_GRANT_TTL,
        }
    }
}

/// Errors raised while requesting, issuing, or revoking grants.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum CredentialError {
    /// Raised when the scope is broader than one object or empty.
    #[error("invalid grant scope: {reason}")]
    InvalidScope {
        /// Description of the violation.
        reason: String,
    },
    /// Raised when the requested lifetime is zero or above the maximum.
    #[error("grant lifetime of {requested_secs}s is outside 1..={max_secs}s")]
    InvalidTtl {
        /// Requested lifetime in seconds.
        requested_secs: u64,
        /// Configured maximum in seconds.
        max_secs: u64,
    },
    /// Raised when the target has no role to attach the grant to.
    #[error("target {instance_id} has no role to receive a grant")]
    MissingPrincipal {
        /// Target instance identifier.
        instance_id: String,
    },
    /// Raised when a grant is issued after its expiry.
    #[error("grant {grant_id} expired before it was issued")]
    Expired {
        /// Grant identifier.
        grant_id: String,
    },
    /// Raised when a revoked grant is issued again.
    #[error("grant {grant_id} was revoked; request a new grant")]
    AlreadyRevoked {
        /// Grant identifier.
        grant_id: String,
    },
    /// Raised when attaching the policy fails.
    #[error("failed to issue grant {grant_id}: {source}")]
    Issue {
        /// Grant identifier.
        grant_id: String,
        /// Underlying service error.
        #[source]
        source: CloudError,
    },
    /// Raised when detaching the policy fails.
    #[error("failed to revoke grant {grant_id}: {source}")]
    Revoke {
        /// Grant identifier.
        grant_id: String,
        /// Underlying service error.
        #[source]
        source: CloudError,
    },
}

/// Issues and revokes grants against an [`AuthorizationStore`].
#[derive(Debug)]
pub struct CredentialManager<A> {
    store: Arc<A>,
    policy: CredentialPolicy,
    states: Mutex<HashMap<String, GrantState>>,
}

impl<A: AuthorizationStore> CredentialManager<A> {
    /// Creates a manager using `store` and the given lifetime bounds.
    #[must_use]
    pub fn new(store: Arc<A>, policy: CredentialPolicy) -> Self {
        Self {
            store,
            policy,
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Plans a grant without touching the authorization store.
    ///
    /// The returned grant is `Requested`; it carries a fresh identifier even
    /// when an earlier grant exists for the same transfer.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError`] when the scope, principal, or lifetime is
    /// invalid.
    pub fn request(
        &self,
        scope: GrantScope,
        ttl: Option<Duration>,
        principal: &str,
        request_id: &str,
        owner: &OwnerRecord,
    ) -> Result<EphemeralGrant, CredentialError> {
        scope.validate()?;
        if principal.trim().is_empty() {
            return Err(CredentialError::InvalidScope {
                reason: String::from("principal must not be empty"),
            });
        }

        let lifetime = ttl.unwrap_or(self.policy.default_ttl);
        if lifetime.is_zero() || lifetime > self.policy.max_ttl {
            return Err(CredentialError::InvalidTtl {
                requested_secs: lifetime.as_secs(),
                max_secs: self.policy.max_ttl.as_secs(),
            });
        }
        let span = chrono::Duration::from_std(lifetime).map_err(|_| CredentialError::InvalidTtl {
            requested_secs: lifetime.as_secs(),
            max_secs: self.policy.max_ttl.as_secs(),
        })?;

        let created_at = Utc::now();
        let grant = EphemeralGrant {
            id: Uuid::new_v4().simple().to_string(),
            principal: principal.trim().to_owned(),
            scope,
            owner: owner.clone(),
            request_id: request_id.to_owned(),
            created_at,
            expires_at: created_at + span,
        };
        self.set_state(&grant.id, GrantState::Requested);
        Ok(grant)
    }

    /// Attaches the grant's policy to its principal.
    ///
    /// Issuing an already active grant is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError::AlreadyRevoked`] for revoked grants,
    /// [`CredentialError::Expired`] when the grant has lapsed, and
    /// [`CredentialError::Issue`] when the store rejects the policy.
    pub async fn issue(&self, grant: &EphemeralGrant) -> Result<(), CredentialError> {
        match self.state(&grant.id) {
            Some(GrantState::Active) => return Ok(()),
            Some(GrantState::Revoked) => {
                return Err(CredentialError::AlreadyRevoked {
                    grant_id: grant.id.clone(),
                });
            }
            Some(GrantState::Requested) | None => {}
        }
        if grant.is_expired_at(Utc::now()) {
            return Err(CredentialError::Expired {
                grant_id: grant.id.clone(),
            });
        }

        self.store
            .put_policy(&grant.policy())
            .await
            .map_err(|source| CredentialError::Issue {
                grant_id: grant.id.clone(),
                source,
            })?;
        self.set_state(&grant.id, GrantState::Active);
        info!(
            grant_id = %grant.id,
            principal = %grant.principal,
            resource = %grant.scope.resource_arn(),
            expires_at = %grant.expires_at,
            "issued ephemeral grant"
        );
        Ok(())
    }

    /// Detaches the grant's policy.
    ///
    /// Revoking a grant that is already revoked, or whose policy no longer
    /// exists, succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError::Revoke`] when the store fails for any
    /// other reason.
    pub async fn revoke(&self, grant: &EphemeralGrant) -> Result<(), CredentialError> {
        if self.state(&grant.id) == Some(GrantState::Revoked) {
            return Ok(());
        }

        match self
            .store
            .delete_policy(&grant.principal, &grant.policy_name())
            .await
        {
            Ok(()) => info!(grant_id = %grant.id, principal = %grant.principal, "revoked grant"),
            Err(err) if err.is_not_found() => {
                debug!(grant_id = %grant.id, "grant already absent; treating as revoked");
            }
            Err(source) => {
                return Err(CredentialError::Revoke {
                    grant_id: grant.id.clone(),
                    source,
                });
            }
        }
        self.set_state(&grant.id, GrantState::Revoked);
        Ok(())
    }

    /// Returns the state this manager has recorded for `grant_id`.
    #[must_use]
    pub fn state(&self, grant_id: &str) -> Option<GrantState> {
        self.states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(grant_id)
            .copied()
    }

    fn set_state(&self, grant_id: &str, next: GrantState) {
        let mut states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
        let permitted = states
            .get(grant_id)
            .is_none_or(|current| *current == next || current.can_transition_to(next));
        if permitted {
            states.insert(grant_id.to_owned(), next);
        }
    }
}

#[cfg(test)]
mod tests;
