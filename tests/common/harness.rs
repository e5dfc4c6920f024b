//! Shared in-memory environment for transfer and cleanup tests.
//!
//! Integration tests are compiled as separate crates (one per top-level file in
//! `tests/`). Reuse via:
//!
//! ```rust
//! #[path = "common/harness.rs"]
//! mod harness;
//! ```

use std::sync::Arc;
use std::time::Duration;

use camino::Utf8PathBuf;
use sluice::registry::{OwnerRecord, Registry};
use sluice::test_support::{FakeCloud, instance};
use sluice::{Janitor, StagingPolicy, TransferPolicy, TransferRouter};
use tempfile::TempDir;

/// Region every harness operates in.
pub const REGION: &str = "eu-west-1";

/// Instance seeded into every harness.
pub const TARGET: &str = "i-0123456789abcdef0";

pub struct Harness {
    _tmp: TempDir,
    pub root: Utf8PathBuf,
    pub cloud: Arc<FakeCloud>,
    pub registry: Registry,
}

impl Harness {
    pub fn new() -> Self {
        let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
        let root = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf())
            .unwrap_or_else(|path| panic!("temp path should be utf8: {}", path.display()));
        let registry = Registry::open(root.join("state"), Duration::from_secs(5))
            .unwrap_or_else(|err| panic!("open registry: {err}"));
        let cloud = Arc::new(FakeCloud::new());
        cloud.add_instance(instance(TARGET, Some("web-1")));
        Self {
            _tmp: tmp,
            root,
            cloud,
            registry,
        }
    }

    pub fn policy() -> TransferPolicy {
        TransferPolicy {
            grant_propagation: Duration::ZERO,
            ..TransferPolicy::new(REGION)
        }
    }

    pub fn router(&self, owner: &OwnerRecord) -> TransferRouter<FakeCloud> {
        TransferRouter::new(
            Arc::clone(&self.cloud),
            self.registry.clone(),
            owner.clone(),
            Self::policy(),
        )
    }

    pub fn janitor(&self) -> Janitor<FakeCloud> {
        Janitor::new(
            Arc::clone(&self.cloud),
            self.registry.clone(),
            StagingPolicy::default(),
        )
    }

    /// Writes `bytes` to a fresh local file and returns its path.
    pub fn local_file(&self, name: &str, bytes: &[u8]) -> Utf8PathBuf {
        let path = self.root.join(name);
        std::fs::write(&path, bytes).unwrap_or_else(|err| panic!("write {path}: {err}"));
        path
    }
}

/// Deterministic payload of `len` bytes.
pub fn payload(len: usize) -> Vec<u8> {
    (0..=250_u8).cycle().take(len).collect()
}
