//! On-disk ledger schema.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

use crate::credentials::EphemeralGrant;
use crate::staging::StagingObject;

/// Schema version written by this release.
pub const LEDGER_VERSION: u32 = 1;

const fn default_version() -> u32 {
    LEDGER_VERSION
}

/// Serialized form of `registry.json`.
///
/// Unknown fields are ignored and missing optional fields default. Entries
/// this release cannot parse, such as ones in a state added by a newer
/// release, are kept aside in [`Ledger::unrecognised`] and written back
/// unchanged, so they survive until a release that understands them runs.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(from = "RawLedger")]
pub struct Ledger {
    /// Schema version.
    pub version: u32,
    /// Outstanding entries in insertion order.
    pub entries: Vec<RegistryEntry>,
    /// Raw entries that failed to parse.
    pub unrecognised: Vec<Value>,
}

impl Ledger {
    /// Returns an empty ledger at the current schema version.
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            version: LEDGER_VERSION,
            entries: Vec::new(),
            unrecognised: Vec::new(),
        }
    }

    pub(super) fn position(&self, id: &str) -> Option<usize> {
        self.entries.iter().position(|entry| entry.id == id)
    }
}

#[derive(Deserialize)]
struct RawLedger {
    #[serde(default = "default_version")]
    version: u32,
    #[serde(default)]
    entries: Vec<Value>,
}

impl From<RawLedger> for Ledger {
    fn from(raw: RawLedger) -> Self {
        let mut ledger = Self {
            version: raw.version,
            ..Self::empty()
        };
        for value in raw.entries {
            match RegistryEntry::deserialize(&value) {
                Ok(entry) => ledger.entries.push(entry),
                Err(err) => {
                    warn!(
                        entry_id = value.get("id").and_then(serde_json::Value::as_str).unwrap_or("<none>"),
                        error = %err,
                        "registry entry not understood by this release; keeping it untouched"
                    );
                    ledger.unrecognised.push(value);
                }
            }
        }
        ledger
    }
}

impl Serialize for Ledger {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("Ledger", 2)?;
        state.serialize_field("version", &self.version)?;
        state.serialize_field("entries", &StoredEntries(self))?;
        state.end()
    }
}

struct StoredEntries<'a>(&'a Ledger);

impl Serialize for StoredEntries<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let known = self.0.entries.iter().map(StoredEntry::Known);
        let raw = self.0.unrecognised.iter().map(StoredEntry::Raw);
        serializer.collect_seq(known.chain(raw))
    }
}

#[derive(Serialize)]
#[serde(untagged)]
enum StoredEntry<'a> {
    Known(&'a RegistryEntry),
    Raw(&'a Value),
}

/// Process that created an entry.
#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub struct OwnerRecord {
    /// Random identifier chosen at process start.
    pub id: String,
    /// Operating system process identifier, informational only.
    #[serde(default)]
    pub pid: u32,
}

impl OwnerRecord {
    /// Builds an owner record from explicit values.
    #[must_use]
    pub fn new(id: impl Into<String>, pid: u32) -> Self {
        Self { id: id.into(), pid }
    }

    /// Builds a fresh owner record for the running process.
    #[must_use]
    pub fn for_current_process() -> Self {
        Self::new(Uuid::new_v4().simple().to_string(), std::process::id())
    }
}

/// Lifecycle state of a registry entry.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryState {
    /// Recorded before any cloud resource exists.
    Pending,
    /// Cloud resources may exist.
    Active,
    /// Every resource has been torn down.
    Released,
}

impl EntryState {
    /// Returns `true` when moving from `self` to `next` is permitted.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Active | Self::Released) | (Self::Active, Self::Released)
        )
    }
}

impl fmt::Display for EntryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Released => "released",
        })
    }
}

/// Durable record of the resources belonging to one staged transfer.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct RegistryEntry {
    /// Entry identifier.
    pub id: String,
    /// Transfer request the entry belongs to.
    pub request_id: String,
    /// Region of the staging bucket.
    #[serde(default)]
    pub region: String,
    /// Process that created the entry.
    pub owner: OwnerRecord,
    /// Current lifecycle state.
    pub state: EntryState,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Timestamp of the last state change.
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
    /// Grant issued for the transfer.
    #[serde(default)]
    pub grant: Option<EphemeralGrant>,
    /// Staging object used by the transfer.
    #[serde(default)]
    pub object: Option<StagingObject>,
}

impl RegistryEntry {
    /// Builds a `Pending` entry for a staged transfer.
    #[must_use]
    pub fn pending(
        request_id: impl Into<String>,
        region: impl Into<String>,
        owner: OwnerRecord,
        grant: EphemeralGrant,
        object: StagingObject,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().simple().to_string(),
            request_id: request_id.into(),
            region: region.into(),
            owner,
            state: EntryState::Pending,
            created_at: now,
            updated_at: now,
            grant: Some(grant),
            object: Some(object),
        }
    }

    /// Returns `true` when the entry's grant has passed its expiry.
    #[must_use]
    pub fn grant_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.grant
            .as_ref()
            .is_some_and(|grant| grant.is_expired_at(now))
    }
}
