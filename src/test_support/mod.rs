//! Test support utilities shared across unit and integration tests.
//!
//! [`FakeCloud`] implements every capability trait in memory, including a
//! small simulator for the remote shell snippets the transfer paths send, and
//! enforces ephemeral grants when a target reads or writes a staged object.
//! [`ScriptedRunner`] replays canned CLI output for adapter tests.

mod fake_cloud;
mod remote_shell;

use std::collections::{BTreeSet, VecDeque};
use std::env;
use std::ffi::OsString;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use tokio::sync::{Mutex as AsyncMutex, MutexGuard};

use crate::credentials::{EphemeralGrant, GrantScope};
use crate::instance::{Instance, Platform, Reachability};
use crate::registry::{OwnerRecord, RegistryEntry};
use crate::runner::{CommandOutput, CommandRunner, RunnerError, RunnerFuture};
use crate::staging::StagingObject;

pub use fake_cloud::{Fault, FakeCloud};

/// Role attached to instances built by [`instance`].
pub const TEST_ROLE: &str = "sluice-test-role";

/// Account the in-memory cloud reports as its caller.
pub const TEST_ACCOUNT: &str = "123456789012";

/// Default staging bucket name in `region` for [`TEST_ACCOUNT`].
#[must_use]
pub fn staging_bucket(region: &str) -> String {
    format!("sluice-staging-{TEST_ACCOUNT}-{region}")
}

/// Builds an online Linux instance with [`TEST_ROLE`] attached.
#[must_use]
pub fn instance(id: &str, name: Option<&str>) -> Instance {
    Instance {
        id: id.to_owned(),
        name: name.map(str::to_owned),
        reachability: Reachability::Online,
        platform: Platform::Linux,
        address: "10.0.0.10".parse().ok(),
        iam_role: Some(String::from(TEST_ROLE)),
    }
}

/// Builds a `Pending` registry entry with a plausible grant and object.
#[must_use]
pub fn sample_entry(request_id: &str, region: &str, owner: &OwnerRecord) -> RegistryEntry {
    let now = Utc::now();
    let bucket = staging_bucket(region);
    let key = format!("sluice/{request_id}/payload.bin");
    let grant = EphemeralGrant {
        id: format!("grant-{request_id}"),
        principal: String::from(TEST_ROLE),
        scope: GrantScope::target_read(bucket.clone(), key.clone()),
        owner: owner.clone(),
        request_id: request_id.to_owned(),
        created_at: now,
        expires_at: now + chrono::Duration::minutes(15),
    };
    let object = StagingObject {
        bucket,
        key,
        size: 5 * 1024 * 1024,
        created_at: now,
        expires_at: now + chrono::Duration::days(1),
        request_id: request_id.to_owned(),
    };
    RegistryEntry::pending(request_id, region, owner.clone(), grant, object)
}

/// Scripted command runner that returns pre-seeded outputs in FIFO order.
///
/// Used to drive deterministic command outcomes without spawning processes.
#[derive(Clone, Debug, Default)]
pub struct ScriptedRunner {
    responses: Arc<Mutex<VecDeque<CommandOutput>>>,
    invocations: Arc<Mutex<Vec<CommandInvocation>>>,
}

/// Records a single invocation made through [`ScriptedRunner`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandInvocation {
    /// Program name as passed to the runner.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<OsString>,
}

impl CommandInvocation {
    /// Returns a shell-like command string for assertions.
    #[must_use]
    pub fn command_string(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.clone());
        parts.extend(
            self.args
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned()),
        );
        parts.join(" ")
    }

    /// Returns the value following `flag`, if present.
    #[must_use]
    pub fn flag_value(&self, flag: &str) -> Option<String> {
        self.args
            .iter()
            .skip_while(|arg| arg.as_os_str() != flag)
            .nth(1)
            .map(|arg| arg.to_string_lossy().into_owned())
    }
}

impl ScriptedRunner {
    /// Creates a new runner with no queued responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of all invocations recorded so far.
    #[must_use]
    pub fn invocations(&self) -> Vec<CommandInvocation> {
        self.invocations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Pushes a successful response with the given stdout.
    pub fn push_success(&self, stdout: impl Into<String>) {
        self.push_output(Some(0), stdout, "");
    }

    /// Pushes a failing exit code with stderr text.
    pub fn push_failure(&self, code: i32, stderr: impl Into<String>) {
        self.push_output(Some(code), "", stderr);
    }

    /// Pushes an explicit command output response.
    pub fn push_output(
        &self,
        code: Option<i32>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) {
        self.responses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(CommandOutput {
                code,
                stdout: stdout.into(),
                stderr: stderr.into(),
            });
    }
}

impl CommandRunner for ScriptedRunner {
    fn run<'a>(&'a self, program: &'a str, args: &'a [OsString]) -> RunnerFuture<'a> {
        self.invocations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(CommandInvocation {
                program: program.to_owned(),
                args: args.to_vec(),
            });
        let next = self
            .responses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .ok_or_else(|| RunnerError::Spawn {
                program: program.to_owned(),
                message: String::from("no scripted response available"),
            });
        Box::pin(std::future::ready(next))
    }
}

/// Global mutex used to serialise environment mutation in tests.
pub static ENV_LOCK: AsyncMutex<()> = AsyncMutex::const_new(());

/// Guard that holds the env mutex and cleans up variables on drop.
pub struct EnvGuard {
    previous: Vec<(String, Option<OsString>)>,
    _guard: MutexGuard<'static, ()>,
}

impl EnvGuard {
    /// Sets multiple environment variables while holding a global mutex.
    pub async fn set_vars(pairs: &[(&str, &str)]) -> Self {
        debug_assert!(
            {
                let mut seen = BTreeSet::new();
                pairs.iter().all(|(key, _)| seen.insert(*key))
            },
            "duplicate environment variable keys passed to EnvGuard::set_vars"
        );

        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            let old = env::var_os(key);
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`, preventing races.
            unsafe { env::set_var(key, value) };
            previous.push(((*key).to_owned(), old));
        }

        Self {
            previous,
            _guard: guard,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, old) in &self.previous {
            // SAFETY: Environment mutation is serialised by holding `_guard`.
            unsafe {
                match old {
                    Some(val) => env::set_var(key, val),
                    None => env::remove_var(key),
                }
            }
        }
    }
}
