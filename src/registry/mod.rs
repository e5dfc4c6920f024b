//! Durable, lock-guarded ledger of outstanding ephemeral resources.
//!
//! Every staged transfer records one [`RegistryEntry`] before it creates any
//! cloud resource and removes it only after teardown. The ledger is the only
//! state shared between concurrent processes; each mutation follows
//! lock → read → mutate → atomic write → unlock, and the lock is never held
//! across a network call.
//!
//! Processes additionally hold an [`OwnerLease`] for their lifetime so that
//! cleanup can tell an entry belonging to a live transfer from one orphaned by
//! a crash.

mod ledger;
mod lock;

use std::io::{self, Write};
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use chrono::Utc;
use thiserror::Error;
use tracing::{debug, warn};

pub use ledger::{EntryState, LEDGER_VERSION, Ledger, OwnerRecord, RegistryEntry};
pub use lock::OwnerLease;

use lock::{LedgerLock, lease_is_held};

const APP_DIR: &str = "sluice";
const LEDGER_FILE: &str = "registry.json";
const LEDGER_TMP_FILE: &str = "registry.json.tmp";
const LOCK_FILE: &str = "registry.lock";
const OWNERS_DIR: &str = "owners";

/// Default bound on how long a mutation waits for the ledger lock.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors raised by registry operations.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum RegistryError {
    /// Raised when a file system operation fails.
    #[error("failed to access {path}: {message}")]
    Io {
        /// Path that could not be accessed.
        path: Utf8PathBuf,
        /// Operating system error message.
        message: String,
    },
    /// Raised when the ledger cannot be encoded.
    #[error("failed to encode registry ledger: {message}")]
    Encode {
        /// Serializer error message.
        message: String,
    },
    /// Raised when the ledger lock is not obtained in time.
    #[error("timed out after {waited_secs}s waiting for registry lock {path}")]
    LockTimeout {
        /// Lock file path.
        path: Utf8PathBuf,
        /// Configured wait bound in seconds.
        waited_secs: u64,
    },
    /// Raised when no platform data directory can be determined.
    #[error("no local data directory available; set registry_dir explicitly")]
    NoDataDirectory,
    /// Raised when an entry with the same identifier already exists.
    #[error("registry entry {id} already exists")]
    DuplicateEntry {
        /// Entry identifier.
        id: String,
    },
    /// Raised when an update targets an entry that does not exist.
    #[error("registry entry {id} does not exist")]
    UnknownEntry {
        /// Entry identifier.
        id: String,
    },
    /// Raised when a state change is not permitted.
    #[error("registry entry {id} cannot move from {from} to {to}")]
    InvalidTransition {
        /// Entry identifier.
        id: String,
        /// Current state.
        from: EntryState,
        /// Requested state.
        to: EntryState,
    },
    /// Raised when a ledger operation on the blocking pool panics or is
    /// cancelled.
    #[error("registry task did not complete: {message}")]
    Task {
        /// Join error message.
        message: String,
    },
    /// Raised when another handle already holds an owner's lease.
    #[error("owner lease {owner_id} is already held")]
    LeaseHeld {
        /// Owner identifier.
        owner_id: String,
    },
}

impl RegistryError {
    fn io(path: &Utf8Path, err: &io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            message: err.to_string(),
        }
    }
}

/// Handle to a ledger directory.
///
/// Handles are cheap; separate handles (in one or many processes) pointing
/// at the same directory coordinate through the lock file.
#[derive(Clone, Debug)]
pub struct Registry {
    root: Utf8PathBuf,
    lock_timeout: Duration,
}

impl Registry {
    /// Opens the ledger directory at `root`, creating it when missing.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Io`] when the directory cannot be created.
    pub fn open(root: impl Into<Utf8PathBuf>, lock_timeout: Duration) -> Result<Self, RegistryError> {
        let root_dir = root.into();
        let owners = root_dir.join(OWNERS_DIR);
        Dir::create_ambient_dir_all(&owners, ambient_authority())
            .map_err(|err| RegistryError::io(&owners, &err))?;
        Ok(Self {
            root: root_dir,
            lock_timeout,
        })
    }

    /// Platform data directory used when no override is configured.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NoDataDirectory`] when the platform has no
    /// local data directory or it is not valid UTF-8.
    pub fn default_location() -> Result<Utf8PathBuf, RegistryError> {
        let base = dirs::data_local_dir().ok_or(RegistryError::NoDataDirectory)?;
        Utf8PathBuf::from_path_buf(base)
            .map(|utf8| utf8.join(APP_DIR))
            .map_err(|_| RegistryError::NoDataDirectory)
    }

    /// Directory holding the ledger.
    #[must_use]
    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    /// Path of the ledger file.
    #[must_use]
    pub fn ledger_path(&self) -> Utf8PathBuf {
        self.root.join(LEDGER_FILE)
    }

    /// Records a new entry.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::DuplicateEntry`] when the identifier is
    /// already present, or a lock or I/O error.
    pub fn put(&self, entry: RegistryEntry) -> Result<(), RegistryError> {
        self.mutate(|ledger| {
            if ledger.position(&entry.id).is_some() {
                return Err(RegistryError::DuplicateEntry { id: entry.id });
            }
            debug!(entry_id = %entry.id, request_id = %entry.request_id, "registry entry recorded");
            ledger.entries.push(entry);
            Ok(((), true))
        })
    }

    /// Moves an entry to `next`, returning the updated entry.
    ///
    /// Setting the current state again is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::UnknownEntry`] or
    /// [`RegistryError::InvalidTransition`], or a lock or I/O error.
    pub fn update_state(&self, id: &str, next: EntryState) -> Result<RegistryEntry, RegistryError> {
        self.mutate(|ledger| {
            let entry = ledger
                .entries
                .iter_mut()
                .find(|entry| entry.id == id)
                .ok_or_else(|| RegistryError::UnknownEntry { id: id.to_owned() })?;
            if entry.state == next {
                return Ok((entry.clone(), false));
            }
            if !entry.state.can_transition_to(next) {
                return Err(RegistryError::InvalidTransition {
                    id: id.to_owned(),
                    from: entry.state,
                    to: next,
                });
            }
            entry.state = next;
            entry.updated_at = Utc::now();
            Ok((entry.clone(), true))
        })
    }

    /// Removes an entry, returning whether it was present.
    ///
    /// # Errors
    ///
    /// Returns a lock or I/O error.
    pub fn remove(&self, id: &str) -> Result<bool, RegistryError> {
        self.mutate(|ledger| {
            let Some(index) = ledger.position(id) else {
                return Ok((false, false));
            };
            ledger.entries.remove(index);
            Ok((true, true))
        })
    }

    /// Returns the entry with `id`, if present.
    ///
    /// # Errors
    ///
    /// Returns a lock or I/O error.
    pub fn get(&self, id: &str) -> Result<Option<RegistryEntry>, RegistryError> {
        Ok(self.list()?.into_iter().find(|entry| entry.id == id))
    }

    /// Returns every entry.
    ///
    /// # Errors
    ///
    /// Returns a lock or I/O error.
    pub fn list(&self) -> Result<Vec<RegistryEntry>, RegistryError> {
        let _lock = self.lock()?;
        Ok(self.load()?.entries)
    }

    /// Returns the entries whose resources may still exist.
    ///
    /// # Errors
    ///
    /// Returns a lock or I/O error.
    pub fn list_active(&self) -> Result<Vec<RegistryEntry>, RegistryError> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|entry| entry.state == EntryState::Active)
            .collect())
    }

    /// Runs `operation` against this registry on tokio's blocking pool.
    ///
    /// Async callers go through here for every ledger access; waiting for
    /// the lock then suspends the calling task, not its worker thread.
    ///
    /// # Errors
    ///
    /// Returns whatever `operation` returns, or [`RegistryError::Task`] when
    /// the blocking task panics or is cancelled.
    pub async fn blocking<T, F>(&self, operation: F) -> Result<T, RegistryError>
    where
        F: FnOnce(&Self) -> Result<T, RegistryError> + Send + 'static,
        T: Send + 'static,
    {
        let registry = self.clone();
        tokio::task::spawn_blocking(move || operation(&registry))
            .await
            .map_err(|err| RegistryError::Task {
                message: err.to_string(),
            })?
    }

    /// Takes the liveness lease for `owner`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::LeaseHeld`] when another handle holds it.
    pub fn owner_lease(&self, owner: &OwnerRecord) -> Result<OwnerLease, RegistryError> {
        OwnerLease::acquire(self.lease_path(&owner.id), owner.clone())
    }

    /// Reports whether the process owning `owner_id` still holds its lease.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Io`] when the lease cannot be probed.
    pub fn owner_alive(&self, owner_id: &str) -> Result<bool, RegistryError> {
        lease_is_held(&self.lease_path(owner_id))
    }

    fn lease_path(&self, owner_id: &str) -> Utf8PathBuf {
        let safe = owner_id
            .chars()
            .map(|ch| if ch.is_ascii_alphanumeric() || ch == '-' { ch } else { '_' })
            .collect::<String>();
        self.root.join(OWNERS_DIR).join(format!("{safe}.lock"))
    }

    fn lock(&self) -> Result<LedgerLock, RegistryError> {
        LedgerLock::acquire(&self.root.join(LOCK_FILE), self.lock_timeout)
    }

    fn dir(&self) -> Result<Dir, RegistryError> {
        Dir::open_ambient_dir(&self.root, ambient_authority())
            .map_err(|err| RegistryError::io(&self.root, &err))
    }

    /// Runs `change` under the lock; the ledger is written back only when
    /// the closure reports a modification.
    fn mutate<T>(
        &self,
        change: impl FnOnce(&mut Ledger) -> Result<(T, bool), RegistryError>,
    ) -> Result<T, RegistryError> {
        let _lock = self.lock()?;
        let mut ledger = self.load()?;
        let (value, modified) = change(&mut ledger)?;
        if modified {
            self.store(&ledger)?;
        }
        Ok(value)
    }

    fn load(&self) -> Result<Ledger, RegistryError> {
        let dir = self.dir()?;
        let bytes = match dir.read(LEDGER_FILE) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Ledger::empty()),
            Err(err) => return Err(RegistryError::io(&self.ledger_path(), &err)),
        };
        let contents = match String::from_utf8(bytes) {
            Ok(contents) => contents,
            Err(err) => {
                self.quarantine(&dir, &err.to_string())?;
                return Ok(Ledger::empty());
            }
        };
        if contents.trim().is_empty() {
            return Ok(Ledger::empty());
        }
        match serde_json::from_str::<Ledger>(&contents) {
            Ok(ledger) => Ok(ledger),
            Err(err) => {
                self.quarantine(&dir, &err.to_string())?;
                Ok(Ledger::empty())
            }
        }
    }

    fn quarantine(&self, dir: &Dir, reason: &str) -> Result<(), RegistryError> {
        let aside = format!(
            "{LEDGER_FILE}.corrupt-{}",
            Utc::now().format("%Y%m%dT%H%M%S%.3fZ")
        );
        dir.rename(LEDGER_FILE, dir, &aside)
            .map_err(|err| RegistryError::io(&self.ledger_path(), &err))?;
        warn!(
            ledger = %self.ledger_path(),
            moved_to = %self.root.join(&aside),
            reason,
            "registry ledger was unreadable; moved it aside and started a fresh ledger. \
             Resources it listed may need manual cleanup"
        );
        Ok(())
    }

    fn store(&self, ledger: &Ledger) -> Result<(), RegistryError> {
        let rendered = serde_json::to_string_pretty(ledger).map_err(|err| RegistryError::Encode {
            message: err.to_string(),
        })?;
        let dir = self.dir()?;
        let tmp_path = self.root.join(LEDGER_TMP_FILE);
        let mut file = dir
            .create(LEDGER_TMP_FILE)
            .map_err(|err| RegistryError::io(&tmp_path, &err))?;
        file.write_all(rendered.as_bytes())
            .and_then(|()| file.sync_all())
            .map_err(|err| RegistryError::io(&tmp_path, &err))?;
        drop(file);
        dir.rename(LEDGER_TMP_FILE, &dir, LEDGER_FILE)
            .map_err(|err| RegistryError::io(&self.ledger_path(), &err))
    }
}

#[cfg(test)]
mod tests;
