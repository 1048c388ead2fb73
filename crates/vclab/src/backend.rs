//! Control-plane trait: the driver core talks to vCenter only through
//! this interface, which keeps the state machine testable against
//! in-memory fakes and the REST client swappable.

use async_trait::async_trait;

use crate::error::DriverResult;
use crate::types::{
    CloneRequest, DatastoreSpace, GuestOp, ObjectKind, ObjectRef, PowerOp, SnapshotNode, TaskRef,
    TaskStatus, VmRuntime,
};

#[async_trait]
pub trait Backend: Send + Sync {
    /// Open a session if none exists and return its id.
    async fn connect(&self) -> DriverResult<String>;

    /// Close the session. No-op when already closed.
    async fn close(&self) -> DriverResult<()>;

    /// List objects of a kind, optionally pre-filtered by name. Exact
    /// cardinality is enforced by the resolver, not here.
    async fn find_objects(
        &self,
        kind: ObjectKind,
        name: Option<&str>,
    ) -> DriverResult<Vec<ObjectRef>>;

    /// Every VM placed directly in the given folder.
    async fn vms_in_folder(&self, folder: &ObjectRef) -> DriverResult<Vec<ObjectRef>>;

    /// Free space and capacity of a datastore.
    async fn datastore_space(&self, datastore: &ObjectRef) -> DriverResult<DatastoreSpace>;

    /// Submit a clone-from-template task.
    async fn clone_from_template(&self, request: &CloneRequest) -> DriverResult<TaskRef>;

    /// Submit a power task.
    async fn power_task(&self, vm: &ObjectRef, op: PowerOp) -> DriverResult<TaskRef>;

    /// Submit a delete task.
    async fn destroy_task(&self, vm: &ObjectRef) -> DriverResult<TaskRef>;

    /// Current status of a previously submitted task.
    async fn task_status(&self, task: &TaskRef) -> DriverResult<TaskStatus>;

    /// Guest-level soft action. Fire-and-forget: guest-initiated
    /// operations have no task handle.
    async fn guest_action(&self, vm: &ObjectRef, op: GuestOp) -> DriverResult<()>;

    /// Register the VM with the host autostart manager using default
    /// delay and priority.
    async fn register_autostart(&self, vm: &ObjectRef) -> DriverResult<()>;

    /// Power state, tools state, and guest address, read live.
    async fn vm_runtime(&self, vm: &ObjectRef) -> DriverResult<VmRuntime>;

    /// Free-text status snapshot of the VM.
    async fn vm_summary(&self, vm: &ObjectRef) -> DriverResult<String>;

    /// Change-tracking version string from the VM config, if exposed.
    async fn vm_change_version(&self, vm: &ObjectRef) -> DriverResult<Option<String>>;

    /// The VM's snapshot forest; empty when the VM has none.
    async fn snapshot_tree(&self, vm: &ObjectRef) -> DriverResult<Vec<SnapshotNode>>;

    async fn create_snapshot_task(
        &self,
        vm: &ObjectRef,
        name: &str,
        memory: bool,
    ) -> DriverResult<TaskRef>;

    async fn revert_snapshot_task(
        &self,
        vm: &ObjectRef,
        snapshot: &SnapshotNode,
    ) -> DriverResult<TaskRef>;

    /// Removal is not recursive; children stay in place.
    async fn remove_snapshot_task(
        &self,
        vm: &ObjectRef,
        snapshot: &SnapshotNode,
    ) -> DriverResult<TaskRef>;
}
