//! In-memory implementation of every capability trait.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use camino::Utf8Path;
use chrono::{DateTime, Utc};
use serde_json::Value;

use super::{TEST_ACCOUNT, remote_shell};
use crate::cloud::{
    AuthorizationStore, CloudError, CloudFuture, CommandHandle, GrantPolicy, InstanceCatalog,
    InvocationState, InvocationStatus, LifecycleRule, MultipartUpload, ObjectStore, ObjectSummary,
    RemoteCommand, SessionBroker,
};
use crate::instance::{Instance, Reachability};

/// Failure that can be injected into [`FakeCloud`].
///
/// Injected faults persist until cleared.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Fault {
    /// Attaching a policy fails.
    PutPolicy,
    /// Detaching a policy fails.
    DeletePolicy,
    /// Creating a bucket fails.
    CreateBucket,
    /// Uploading an object fails, leaving a partial multi-part upload.
    PutObject,
    /// Downloading an object fails.
    GetObject,
    /// Deleting an object fails.
    DeleteObject,
    /// Submitting a command fails.
    SendCommand,
    /// Submitted commands never finish.
    CommandHang,
    /// The target's own object-store copy fails.
    RemoteCopy,
    /// Listing instances fails.
    ListInstances,
}

type Observer = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug)]
pub(super) struct Invocation {
    pub(super) status: InvocationStatus,
    pub(super) polls_remaining: u32,
}

#[derive(Default)]
pub(super) struct FakeState {
    pub(super) instances: BTreeMap<String, Instance>,
    pub(super) files: HashMap<(String, String), Vec<u8>>,
    pub(super) buckets: BTreeMap<String, Option<LifecycleRule>>,
    pub(super) objects: BTreeMap<(String, String), Vec<u8>>,
    pub(super) policies: BTreeMap<(String, String), Value>,
    pub(super) uploads: Vec<(String, MultipartUpload)>,
    pub(super) faults: HashSet<Fault>,
    pub(super) invocations: HashMap<String, Invocation>,
    pub(super) scripts: Vec<(String, String)>,
    pub(super) pending_polls: u32,
    next_id: u64,
    observer: Option<Observer>,
}

impl FakeState {
    fn fail_if(&self, fault: Fault, operation: &str) -> Result<(), CloudError> {
        if self.faults.contains(&fault) {
            return Err(CloudError::Service {
                operation: operation.to_owned(),
                message: String::from("injected failure"),
            });
        }
        Ok(())
    }

    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{:08}", self.next_id)
    }
}

/// In-memory cloud used by unit and integration tests.
///
/// Clones share state.
#[derive(Clone, Default)]
pub struct FakeCloud {
    state: Arc<Mutex<FakeState>>,
}

impl fmt::Debug for FakeCloud {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FakeCloud").finish_non_exhaustive()
    }
}

fn settled<'a, T: Send + 'a>(result: Result<T, CloudError>) -> CloudFuture<'a, T> {
    Box::pin(std::future::ready(result))
}

impl FakeCloud {
    /// Creates an empty cloud.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers an instance.
    pub fn add_instance(&self, instance: Instance) {
        self.state().instances.insert(instance.id.clone(), instance);
    }

    /// Injects a persistent fault.
    pub fn inject(&self, fault: Fault) {
        self.state().faults.insert(fault);
    }

    /// Clears a previously injected fault.
    pub fn clear(&self, fault: Fault) {
        self.state().faults.remove(&fault);
    }

    /// Number of `InProgress` polls reported before a command completes.
    pub fn set_pending_polls(&self, polls: u32) {
        self.state().pending_polls = polls;
    }

    /// Calls `observer` each time a target copies to or from the object
    /// store, before the copy runs.
    pub fn on_remote_copy(&self, observer: impl Fn() + Send + Sync + 'static) {
        self.state().observer = Some(Arc::new(observer));
    }

    /// Writes a file on a target.
    pub fn put_remote_file(&self, instance_id: &str, path: &str, bytes: impl Into<Vec<u8>>) {
        self.state()
            .files
            .insert((instance_id.to_owned(), path.to_owned()), bytes.into());
    }

    /// Reads a file from a target.
    #[must_use]
    pub fn remote_file(&self, instance_id: &str, path: &str) -> Option<Vec<u8>> {
        self.state()
            .files
            .get(&(instance_id.to_owned(), path.to_owned()))
            .cloned()
    }

    /// Lists the paths of every file on a target.
    #[must_use]
    pub fn remote_paths(&self, instance_id: &str) -> Vec<String> {
        let mut paths = self
            .state()
            .files
            .keys()
            .filter(|(owner, _)| owner == instance_id)
            .map(|(_, path)| path.clone())
            .collect::<Vec<_>>();
        paths.sort();
        paths
    }

    /// Scripts submitted so far as `(instance_id, script)` pairs.
    #[must_use]
    pub fn sent_scripts(&self) -> Vec<(String, String)> {
        self.state().scripts.clone()
    }

    /// Attached policies as `(principal, name)` pairs.
    #[must_use]
    pub fn policies(&self) -> Vec<(String, String)> {
        self.state().policies.keys().cloned().collect()
    }

    /// Existing buckets.
    #[must_use]
    pub fn buckets(&self) -> Vec<String> {
        self.state().buckets.keys().cloned().collect()
    }

    /// Lifecycle rule applied to `bucket`.
    #[must_use]
    pub fn lifecycle(&self, bucket: &str) -> Option<LifecycleRule> {
        self.state().buckets.get(bucket).cloned().flatten()
    }

    /// Stored objects as `(bucket, key)` pairs.
    #[must_use]
    pub fn objects(&self) -> Vec<(String, String)> {
        self.state().objects.keys().cloned().collect()
    }

    /// Stores an object directly, creating the bucket when needed.
    pub fn put_object_bytes(&self, bucket: &str, key: &str, bytes: impl Into<Vec<u8>>) {
        let mut state = self.state();
        state.buckets.entry(bucket.to_owned()).or_insert(None);
        state
            .objects
            .insert((bucket.to_owned(), key.to_owned()), bytes.into());
    }

    /// Records an incomplete multi-part upload.
    pub fn add_multipart_upload(&self, bucket: &str, key: &str, initiated: DateTime<Utc>) {
        let mut state = self.state();
        let upload_id = state.next_id("upload");
        state.buckets.entry(bucket.to_owned()).or_insert(None);
        state.uploads.push((
            bucket.to_owned(),
            MultipartUpload {
                key: key.to_owned(),
                upload_id,
                initiated,
            },
        ));
    }

    /// Incomplete multi-part uploads in `bucket`.
    #[must_use]
    pub fn multipart_uploads(&self, bucket: &str) -> Vec<MultipartUpload> {
        self.state()
            .uploads
            .iter()
            .filter(|(owner, _)| owner == bucket)
            .map(|(_, upload)| upload.clone())
            .collect()
    }
}

impl SessionBroker for FakeCloud {
    fn send_command<'a>(
        &'a self,
        instance_id: &'a str,
        command: &'a RemoteCommand,
    ) -> CloudFuture<'a, CommandHandle> {
        let observer = {
            let state = self.state();
            if remote_shell::is_remote_copy(&command.script) {
                state.observer.clone()
            } else {
                None
            }
        };
        if let Some(observe) = observer {
            observe();
        }

        let mut state = self.state();
        settled(submit(&mut state, instance_id, command))
    }

    fn poll_command<'a>(&'a self, handle: &'a CommandHandle) -> CloudFuture<'a, InvocationStatus> {
        let mut state = self.state();
        let hang = state.faults.contains(&Fault::CommandHang);
        let result = match state.invocations.get_mut(&handle.command_id) {
            None => Err(CloudError::NotFound {
                resource: format!("command {}", handle.command_id),
            }),
            Some(_) if hang => Ok(InvocationStatus {
                state: InvocationState::InProgress,
                ..InvocationStatus::pending()
            }),
            Some(invocation) if invocation.polls_remaining > 0 => {
                invocation.polls_remaining -= 1;
                Ok(InvocationStatus {
                    state: InvocationState::InProgress,
                    ..InvocationStatus::pending()
                })
            }
            Some(invocation) => Ok(invocation.status.clone()),
        };
        settled(result)
    }
}

impl AuthorizationStore for FakeCloud {
    fn put_policy<'a>(&'a self, policy: &'a GrantPolicy) -> CloudFuture<'a, ()> {
        let mut state = self.state();
        let result = state.fail_if(Fault::PutPolicy, "put-role-policy").map(|()| {
            state.policies.insert(
                (policy.principal.clone(), policy.name.clone()),
                policy.document.clone(),
            );
        });
        settled(result)
    }

    fn delete_policy<'a>(&'a self, principal: &'a str, name: &'a str) -> CloudFuture<'a, ()> {
        let mut state = self.state();
        let result = state
            .fail_if(Fault::DeletePolicy, "delete-role-policy")
            .and_then(|()| {
                state
                    .policies
                    .remove(&(principal.to_owned(), name.to_owned()))
                    .map(|_| ())
                    .ok_or_else(|| CloudError::NotFound {
                        resource: format!("policy {name} on role {principal}"),
                    })
            });
        settled(result)
    }
}

impl ObjectStore for FakeCloud {
    fn account_id(&self) -> CloudFuture<'_, String> {
        settled(Ok(String::from(TEST_ACCOUNT)))
    }

    fn bucket_exists<'a>(&'a self, bucket: &'a str) -> CloudFuture<'a, bool> {
        settled(Ok(self.state().buckets.contains_key(bucket)))
    }

    fn create_bucket<'a>(&'a self, bucket: &'a str, _region: &'a str) -> CloudFuture<'a, ()> {
        let mut state = self.state();
        let result = state.fail_if(Fault::CreateBucket, "create-bucket").map(|()| {
            state.buckets.entry(bucket.to_owned()).or_insert(None);
        });
        settled(result)
    }

    fn put_lifecycle<'a>(
        &'a self,
        bucket: &'a str,
        rule: &'a LifecycleRule,
    ) -> CloudFuture<'a, ()> {
        let mut state = self.state();
        let result = match state.buckets.get_mut(bucket) {
            Some(slot) => {
                *slot = Some(rule.clone());
                Ok(())
            }
            None => Err(CloudError::NotFound {
                resource: format!("bucket {bucket}"),
            }),
        };
        settled(result)
    }

    fn put_object<'a>(
        &'a self,
        bucket: &'a str,
        key: &'a str,
        source: &'a Utf8Path,
    ) -> CloudFuture<'a, ()> {
        let mut state = self.state();
        settled(store_object(&mut state, bucket, key, source))
    }

    fn get_object<'a>(
        &'a self,
        bucket: &'a str,
        key: &'a str,
        destination: &'a Utf8Path,
    ) -> CloudFuture<'a, ()> {
        let state = self.state();
        let result = state.fail_if(Fault::GetObject, "get-object").and_then(|()| {
            let bytes = state
                .objects
                .get(&(bucket.to_owned(), key.to_owned()))
                .ok_or_else(|| CloudError::NotFound {
                    resource: format!("s3://{bucket}/{key}"),
                })?;
            std::fs::write(destination, bytes).map_err(|err| CloudError::Service {
                operation: String::from("get-object"),
                message: format!("cannot write {destination}: {err}"),
            })
        });
        settled(result)
    }

    fn delete_object<'a>(&'a self, bucket: &'a str, key: &'a str) -> CloudFuture<'a, ()> {
        let mut state = self.state();
        let result = state.fail_if(Fault::DeleteObject, "delete-object").map(|()| {
            state.objects.remove(&(bucket.to_owned(), key.to_owned()));
        });
        settled(result)
    }

    fn list_objects<'a>(
        &'a self,
        bucket: &'a str,
        prefix: &'a str,
    ) -> CloudFuture<'a, Vec<ObjectSummary>> {
        let state = self.state();
        let listed = state
            .objects
            .iter()
            .filter(|((owner, key), _)| owner == bucket && key.starts_with(prefix))
            .map(|((_, key), bytes)| ObjectSummary {
                key: key.clone(),
                size: u64::try_from(bytes.len()).unwrap_or(u64::MAX),
            })
            .collect();
        settled(Ok(listed))
    }

    fn list_multipart_uploads<'a>(
        &'a self,
        bucket: &'a str,
        prefix: &'a str,
    ) -> CloudFuture<'a, Vec<MultipartUpload>> {
        let state = self.state();
        let listed = state
            .uploads
            .iter()
            .filter(|(owner, upload)| owner == bucket && upload.key.starts_with(prefix))
            .map(|(_, upload)| upload.clone())
            .collect();
        settled(Ok(listed))
    }

    fn abort_multipart_upload<'a>(
        &'a self,
        bucket: &'a str,
        key: &'a str,
        upload_id: &'a str,
    ) -> CloudFuture<'a, ()> {
        let mut state = self.state();
        let before = state.uploads.len();
        state.uploads.retain(|(owner, upload)| {
            !(owner == bucket && upload.key == key && upload.upload_id == upload_id)
        });
        let result = if state.uploads.len() == before {
            Err(CloudError::NotFound {
                resource: format!("upload {upload_id}"),
            })
        } else {
            Ok(())
        };
        settled(result)
    }
}

impl InstanceCatalog for FakeCloud {
    fn list_instances(&self) -> CloudFuture<'_, Vec<Instance>> {
        let state = self.state();
        let result = state
            .fail_if(Fault::ListInstances, "describe-instances")
            .map(|()| state.instances.values().cloned().collect());
        settled(result)
    }

    fn describe_instance<'a>(&'a self, instance_id: &'a str) -> CloudFuture<'a, Option<Instance>> {
        settled(Ok(self.state().instances.get(instance_id).cloned()))
    }
}

fn submit(
    state: &mut FakeState,
    instance_id: &str,
    command: &RemoteCommand,
) -> Result<CommandHandle, CloudError> {
    state.fail_if(Fault::SendCommand, "send-command")?;
    let target = state
        .instances
        .get(instance_id)
        .cloned()
        .ok_or_else(|| CloudError::NotFound {
            resource: format!("instance {instance_id}"),
        })?;
    if target.reachability != Reachability::Online {
        return Err(CloudError::Service {
            operation: String::from("send-command"),
            message: format!("InvalidInstanceId: {instance_id} is not connected"),
        });
    }

    state
        .scripts
        .push((instance_id.to_owned(), command.script.clone()));
    let outcome = remote_shell::execute(state, &target, &command.script);
    let command_id = state.next_id("cmd");
    let polls_remaining = state.pending_polls;
    state.invocations.insert(
        command_id.clone(),
        Invocation {
            status: outcome.into_status(),
            polls_remaining,
        },
    );
    Ok(CommandHandle {
        command_id,
        instance_id: instance_id.to_owned(),
    })
}

fn store_object(
    state: &mut FakeState,
    bucket: &str,
    key: &str,
    source: &Utf8Path,
) -> Result<(), CloudError> {
    if !state.buckets.contains_key(bucket) {
        return Err(CloudError::NotFound {
            resource: format!("bucket {bucket}"),
        });
    }
    if state.faults.contains(&Fault::PutObject) {
        let upload_id = state.next_id("upload");
        state.uploads.push((
            bucket.to_owned(),
            MultipartUpload {
                key: key.to_owned(),
                upload_id,
                initiated: Utc::now(),
            },
        ));
        return state.fail_if(Fault::PutObject, "put-object");
    }
    let bytes = std::fs::read(source).map_err(|err| CloudError::Service {
        operation: String::from("put-object"),
        message: format!("cannot read {source}: {err}"),
    })?;
    state
        .objects
        .insert((bucket.to_owned(), key.to_owned()), bytes);
    Ok(())
}
