//! In-memory collaborator fakes shared by the unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use crate::backend::Backend;
use crate::config::DriverConfig;
use crate::error::{DriverError, DriverResult};
use crate::ssh::SshTransport;
use crate::types::{
    BackendFault, CloneRequest, CmdOutcome, DatastoreSpace, GuestOp, ObjectKind, ObjectRef,
    PowerOp, ScriptOutput, SnapshotNode, SshCredentials, SshTarget, TaskRef, TaskStatus,
    TransferOutcome, VmRuntime, WinRmCredentials, WinRmTarget,
};
use crate::winrm::WinRmTransport;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Fake backend
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Default)]
pub(crate) struct FakeState {
    pub objects: Vec<ObjectRef>,
    pub datastore_space: DatastoreSpace,
    pub runtime: VmRuntime,
    pub summary: String,
    pub change_version: Option<String>,
    pub snapshots: Vec<SnapshotNode>,
    /// Scripted statuses per task id; the last entry repeats.
    pub tasks: HashMap<String, VecDeque<TaskStatus>>,
    /// Each task submission consumes one fault; empty means success.
    pub submit_faults: VecDeque<BackendFault>,
    /// Payload of successful clone tasks.
    pub clone_result: Option<String>,
    pub clone_requests: Vec<CloneRequest>,
    pub power_ops: Vec<PowerOp>,
    pub destroy_tasks: u32,
    pub guest_ops: Vec<GuestOp>,
    pub autostart_registrations: u32,
    pub snapshot_creates: Vec<(String, bool)>,
    pub snapshot_reverts: Vec<String>,
    pub snapshot_removes: Vec<String>,
    pub connects: u32,
    pub closes: u32,
    /// Name-filtered lookups served.
    pub finds: u32,
    next_task_id: u32,
}

#[derive(Default)]
pub(crate) struct FakeBackend {
    state: Mutex<FakeState>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub fn add_object(&self, obj: ObjectRef) {
        self.state().objects.push(obj);
    }

    pub fn set_space(&self, free: u64, capacity: u64) {
        self.state().datastore_space = DatastoreSpace { free, capacity };
    }

    pub fn set_runtime(&self, runtime: VmRuntime) {
        self.state().runtime = runtime;
    }

    pub fn set_snapshots(&self, snapshots: Vec<SnapshotNode>) {
        self.state().snapshots = snapshots;
    }

    pub fn queue_submit_fault(&self, fault: BackendFault) {
        self.state().submit_faults.push_back(fault);
    }

    pub fn set_clone_result(&self, id: &str) {
        self.state().clone_result = Some(id.to_string());
    }

    pub fn script_task(&self, id: &str, status: TaskStatus) {
        self.script_task_sequence(id, vec![status]);
    }

    pub fn script_task_sequence(&self, id: &str, statuses: Vec<TaskStatus>) {
        self.state().tasks.insert(id.to_string(), statuses.into());
    }

    fn submit_task(&self, payload: Option<String>) -> TaskRef {
        let mut state = self.state();
        state.next_task_id += 1;
        let id = format!("task-{}", state.next_task_id);
        let status = match state.submit_faults.pop_front() {
            Some(fault) => TaskStatus::Failed(fault),
            None => TaskStatus::Succeeded(payload),
        };
        state.tasks.insert(id.clone(), VecDeque::from(vec![status]));
        TaskRef::new(id)
    }
}

#[async_trait]
impl Backend for FakeBackend {
    async fn connect(&self) -> DriverResult<String> {
        self.state().connects += 1;
        Ok("fake-session".to_string())
    }

    async fn close(&self) -> DriverResult<()> {
        self.state().closes += 1;
        Ok(())
    }

    async fn find_objects(
        &self,
        kind: ObjectKind,
        name: Option<&str>,
    ) -> DriverResult<Vec<ObjectRef>> {
        let mut state = self.state();
        if name.is_some() {
            state.finds += 1;
        }
        Ok(state
            .objects
            .iter()
            .filter(|obj| obj.kind == kind && name.map_or(true, |n| obj.name == n))
            .cloned()
            .collect())
    }

    async fn vms_in_folder(&self, _folder: &ObjectRef) -> DriverResult<Vec<ObjectRef>> {
        self.find_objects(ObjectKind::VirtualMachine, None).await
    }

    async fn datastore_space(&self, _datastore: &ObjectRef) -> DriverResult<DatastoreSpace> {
        Ok(self.state().datastore_space)
    }

    async fn clone_from_template(&self, request: &CloneRequest) -> DriverResult<TaskRef> {
        let payload = self.state().clone_result.clone();
        self.state().clone_requests.push(request.clone());
        Ok(self.submit_task(payload))
    }

    async fn power_task(&self, _vm: &ObjectRef, op: PowerOp) -> DriverResult<TaskRef> {
        self.state().power_ops.push(op);
        Ok(self.submit_task(None))
    }

    async fn destroy_task(&self, _vm: &ObjectRef) -> DriverResult<TaskRef> {
        self.state().destroy_tasks += 1;
        Ok(self.submit_task(None))
    }

    async fn task_status(&self, task: &TaskRef) -> DriverResult<TaskStatus> {
        let mut state = self.state();
        let queue = state
            .tasks
            .get_mut(&task.id)
            .ok_or_else(|| DriverError::other(format!("unknown task '{}'", task.id)))?;
        if queue.len() > 1 {
            Ok(queue.pop_front().unwrap())
        } else {
            queue
                .front()
                .cloned()
                .ok_or_else(|| DriverError::other("task status queue drained"))
        }
    }

    async fn guest_action(&self, _vm: &ObjectRef, op: GuestOp) -> DriverResult<()> {
        self.state().guest_ops.push(op);
        Ok(())
    }

    async fn register_autostart(&self, _vm: &ObjectRef) -> DriverResult<()> {
        self.state().autostart_registrations += 1;
        Ok(())
    }

    async fn vm_runtime(&self, _vm: &ObjectRef) -> DriverResult<VmRuntime> {
        Ok(self.state().runtime.clone())
    }

    async fn vm_summary(&self, _vm: &ObjectRef) -> DriverResult<String> {
        Ok(self.state().summary.clone())
    }

    async fn vm_change_version(&self, _vm: &ObjectRef) -> DriverResult<Option<String>> {
        Ok(self.state().change_version.clone())
    }

    async fn snapshot_tree(&self, _vm: &ObjectRef) -> DriverResult<Vec<SnapshotNode>> {
        Ok(self.state().snapshots.clone())
    }

    async fn create_snapshot_task(
        &self,
        _vm: &ObjectRef,
        name: &str,
        memory: bool,
    ) -> DriverResult<TaskRef> {
        self.state()
            .snapshot_creates
            .push((name.to_string(), memory));
        Ok(self.submit_task(None))
    }

    async fn revert_snapshot_task(
        &self,
        _vm: &ObjectRef,
        snapshot: &SnapshotNode,
    ) -> DriverResult<TaskRef> {
        self.state().snapshot_reverts.push(snapshot.id.clone());
        Ok(self.submit_task(None))
    }

    async fn remove_snapshot_task(
        &self,
        _vm: &ObjectRef,
        snapshot: &SnapshotNode,
    ) -> DriverResult<TaskRef> {
        self.state().snapshot_removes.push(snapshot.id.clone());
        Ok(self.submit_task(None))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Fake transports
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Default)]
pub(crate) struct FakeSshState {
    pub run_results: VecDeque<DriverResult<CmdOutcome>>,
    pub upload_results: VecDeque<DriverResult<TransferOutcome>>,
    pub download_results: VecDeque<DriverResult<TransferOutcome>>,
    pub commands: Vec<String>,
    pub uploads: Vec<(String, String)>,
    pub downloads: Vec<(String, String)>,
}

#[derive(Default)]
pub(crate) struct FakeSsh {
    state: Mutex<FakeSshState>,
}

impl FakeSsh {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> MutexGuard<'_, FakeSshState> {
        self.state.lock().unwrap()
    }

    pub fn queue_run(&self, result: DriverResult<CmdOutcome>) {
        self.state().run_results.push_back(result);
    }

    pub fn queue_upload(&self, result: DriverResult<TransferOutcome>) {
        self.state().upload_results.push_back(result);
    }

    pub fn queue_download(&self, result: DriverResult<TransferOutcome>) {
        self.state().download_results.push_back(result);
    }
}

fn next_result<T: Clone + Default>(queue: &mut VecDeque<DriverResult<T>>) -> DriverResult<T> {
    if queue.len() > 1 {
        queue.pop_front().unwrap()
    } else {
        queue.front().cloned().unwrap_or_else(|| Ok(T::default()))
    }
}

#[async_trait]
impl SshTransport for FakeSsh {
    async fn run(&self, _target: &SshTarget, command: &str) -> DriverResult<CmdOutcome> {
        let mut state = self.state();
        state.commands.push(command.to_string());
        next_result(&mut state.run_results)
    }

    async fn upload(
        &self,
        _target: &SshTarget,
        local: &str,
        remote: &str,
    ) -> DriverResult<TransferOutcome> {
        let mut state = self.state();
        state.uploads.push((local.to_string(), remote.to_string()));
        next_result(&mut state.upload_results)
    }

    async fn download(
        &self,
        _target: &SshTarget,
        remote: &str,
        local: &str,
    ) -> DriverResult<TransferOutcome> {
        let mut state = self.state();
        state.downloads.push((remote.to_string(), local.to_string()));
        next_result(&mut state.download_results)
    }
}

#[derive(Default)]
pub(crate) struct FakeWinRmState {
    pub results: VecDeque<DriverResult<ScriptOutput>>,
    pub scripts: Vec<String>,
}

#[derive(Default)]
pub(crate) struct FakeWinRm {
    state: Mutex<FakeWinRmState>,
}

impl FakeWinRm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> MutexGuard<'_, FakeWinRmState> {
        self.state.lock().unwrap()
    }

    pub fn queue(&self, result: DriverResult<ScriptOutput>) {
        self.state().results.push_back(result);
    }
}

#[async_trait]
impl WinRmTransport for FakeWinRm {
    async fn run_script(&self, _target: &WinRmTarget, script: &str) -> DriverResult<ScriptOutput> {
        let mut state = self.state();
        state.scripts.push(script.to_string());
        next_result(&mut state.results)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Harness helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub(crate) fn test_config() -> DriverConfig {
    DriverConfig {
        host: "vcenter.test".into(),
        username: "admin".into(),
        password: "secret".into(),
        resource_pool: Some("pool-1".into()),
        datastore: Some("ds-1".into()),
        folder: Some("folder-1".into()),
        datastore_threshold: 0.2,
        timeout_secs: 2,
        poll_interval_secs: 1,
        ssh: Some(SshCredentials {
            username: "root".into(),
            password: Some("toor".into()),
            key_path: None,
            port: 22,
        }),
        winrm: Some(WinRmCredentials {
            username: "administrator".into(),
            password: "pw".into(),
            port: 5985,
            https: false,
        }),
        ..Default::default()
    }
}

/// Inventory the default [`test_config`] placement resolves against.
pub(crate) fn seed_inventory(backend: &FakeBackend) {
    backend.add_object(ObjectRef::new(ObjectKind::VirtualMachine, "vm-tpl", "tpl"));
    backend.add_object(ObjectRef::new(ObjectKind::ResourcePool, "rp-1", "pool-1"));
    backend.add_object(ObjectRef::new(ObjectKind::Datastore, "ds-1", "ds-1"));
    backend.add_object(ObjectRef::new(ObjectKind::Folder, "f-1", "folder-1"));
    backend.set_space(100, 100);
}

pub(crate) fn vm_object(id: &str, name: &str) -> ObjectRef {
    ObjectRef::new(ObjectKind::VirtualMachine, id, name)
}
