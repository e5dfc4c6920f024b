//! Advisory file locks guarding the ledger and marking live owners.

use std::fs::{File, OpenOptions};
use std::io;
use std::thread;
use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};
use fs2::FileExt;
use tracing::debug;

use super::{OwnerRecord, RegistryError};

const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(20);

fn open_lock_file(path: &Utf8Path) -> Result<File, RegistryError> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .map_err(|err| RegistryError::io(path, &err))
}

fn is_contended(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

/// Exclusive hold on `registry.lock`, released on drop.
#[derive(Debug)]
pub(super) struct LedgerLock {
    file: File,
}

impl LedgerLock {
    /// Waits up to `timeout` for the exclusive lock.
    pub(super) fn acquire(path: &Utf8Path, timeout: Duration) -> Result<Self, RegistryError> {
        let file = open_lock_file(path)?;
        let started = Instant::now();
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => return Ok(Self { file }),
                Err(err) if is_contended(&err) => {
                    if started.elapsed() >= timeout {
                        return Err(RegistryError::LockTimeout {
                            path: path.to_path_buf(),
                            waited_secs: timeout.as_secs(),
                        });
                    }
                    thread::sleep(LOCK_RETRY_INTERVAL);
                }
                Err(err) => return Err(RegistryError::io(path, &err)),
            }
        }
    }
}

impl Drop for LedgerLock {
    fn drop(&mut self) {
        if let Err(err) = FileExt::unlock(&self.file) {
            debug!(error = %err, "failed to unlock registry; closing the handle releases it");
        }
    }
}

/// Lease proving that an owner process is alive.
///
/// The lease file stays locked for as long as this value lives. Dropping it
/// unlocks and removes the file.
#[derive(Debug)]
pub struct OwnerLease {
    owner: OwnerRecord,
    path: Utf8PathBuf,
    file: File,
}

impl OwnerLease {
    pub(super) fn acquire(path: Utf8PathBuf, owner: OwnerRecord) -> Result<Self, RegistryError> {
        let file = open_lock_file(&path)?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Self { owner, path, file }),
            Err(err) if is_contended(&err) => Err(RegistryError::LeaseHeld {
                owner_id: owner.id,
            }),
            Err(err) => Err(RegistryError::io(&path, &err)),
        }
    }

    /// Owner the lease belongs to.
    #[must_use]
    pub const fn owner(&self) -> &OwnerRecord {
        &self.owner
    }
}

impl Drop for OwnerLease {
    fn drop(&mut self) {
        if let Err(err) = FileExt::unlock(&self.file) {
            debug!(owner_id = %self.owner.id, error = %err, "failed to unlock owner lease");
        }
        if let Err(err) = std::fs::remove_file(&self.path) {
            debug!(owner_id = %self.owner.id, error = %err, "failed to remove owner lease");
        }
    }
}

/// Reports whether some process currently holds the lease at `path`.
pub(super) fn lease_is_held(path: &Utf8Path) -> Result<bool, RegistryError> {
    let file = match OpenOptions::new().read(true).write(true).open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(err) => return Err(RegistryError::io(path, &err)),
    };
    match file.try_lock_exclusive() {
        Ok(()) => {
            // Nobody holds it; the owner exited without removing the file.
            if let Err(err) = FileExt::unlock(&file) {
                debug!(path = %path, error = %err, "failed to unlock probed lease");
            }
            Ok(false)
        }
        Err(err) if is_contended(&err) => Ok(true),
        Err(err) => Err(RegistryError::io(path, &err)),
    }
}
