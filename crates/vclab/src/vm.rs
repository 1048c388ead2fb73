//! VM lifecycle state machine.
//!
//! A [`VirtualMachine`] is an in-memory handle over one backend entity.
//! It is either unresolved (no backend reference) or resolved; power and
//! tools state are read fresh from the backend on every query. Every
//! operation is idempotent with respect to "already effectively in the
//! target state": lifecycle calls no-op when there is nothing to do, and
//! power tasks tolerate the backend's already-in-state fault.

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info};
use uuid::Uuid;

use crate::backend::Backend;
use crate::config::DriverConfig;
use crate::error::{DriverError, DriverResult, FaultKind};
use crate::inventory;
use crate::retry::{retry_until, Attempt};
use crate::snapshot;
use crate::ssh::SshTransport;
use crate::task::wait_for_task;
use crate::types::{
    CloneRequest, GuestOp, ObjectKind, ObjectRef, PowerOp, PowerState, SnapshotNode,
    SshCredentials, WinRmCredentials,
};
use crate::winrm::WinRmTransport;

/// Faults swallowed by idempotent power and lifecycle operations.
pub const POWER_SWALLOW_FAULTS: &[FaultKind] = &[FaultKind::InvalidPowerState];

/// Provisioning parameters. Unset placement fields fall back to the
/// driver configuration when the handle is assembled.
#[derive(Debug, Clone, Default)]
pub struct VmSpec {
    /// Generated (`vm-<uuid>`) when not supplied.
    pub name: Option<String>,
    pub template: Option<String>,
    pub resource_pool: Option<String>,
    pub datastore: Option<String>,
    pub datastore_threshold: Option<f64>,
    pub folder: Option<String>,
    pub compute_host: Option<String>,
    pub cpu_count: Option<u32>,
    pub memory_mib: Option<u64>,
    pub annotation: Option<String>,
    /// Power the VM on once the clone completes. Defaults to true.
    pub power_on: Option<bool>,
    pub ssh: Option<SshCredentials>,
    pub winrm: Option<WinRmCredentials>,
    pub timeout_secs: Option<u64>,
}

/// Handle over one guest instance.
pub struct VirtualMachine {
    pub(crate) backend: Arc<dyn Backend>,
    pub(crate) ssh_transport: Arc<dyn SshTransport>,
    pub(crate) winrm_transport: Arc<dyn WinRmTransport>,
    pub(crate) name: String,
    pub(crate) template: Option<String>,
    pub(crate) resource_pool: Option<String>,
    pub(crate) datastore: Option<String>,
    pub(crate) datastore_threshold: f64,
    pub(crate) folder: Option<String>,
    pub(crate) compute_host: Option<String>,
    pub(crate) cpu_count: Option<u32>,
    pub(crate) memory_mib: Option<u64>,
    pub(crate) annotation: Option<String>,
    pub(crate) power_on_after_create: bool,
    pub(crate) ssh_credentials: Option<SshCredentials>,
    pub(crate) winrm_credentials: Option<WinRmCredentials>,
    pub(crate) timeout: Duration,
    pub(crate) poll_interval: Duration,
    pub(crate) winrm_busy_markers: Vec<String>,
    pub(crate) vm_ref: Option<ObjectRef>,
}

impl std::fmt::Debug for VirtualMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualMachine")
            .field("name", &self.name)
            .field("template", &self.template)
            .field("resource_pool", &self.resource_pool)
            .field("datastore", &self.datastore)
            .field("datastore_threshold", &self.datastore_threshold)
            .field("folder", &self.folder)
            .field("compute_host", &self.compute_host)
            .field("cpu_count", &self.cpu_count)
            .field("memory_mib", &self.memory_mib)
            .field("annotation", &self.annotation)
            .field("power_on_after_create", &self.power_on_after_create)
            .field("timeout", &self.timeout)
            .field("poll_interval", &self.poll_interval)
            .field("winrm_busy_markers", &self.winrm_busy_markers)
            .field("vm_ref", &self.vm_ref)
            .finish_non_exhaustive()
    }
}

impl VirtualMachine {
    pub(crate) fn assemble(
        spec: VmSpec,
        config: &DriverConfig,
        backend: Arc<dyn Backend>,
        ssh_transport: Arc<dyn SshTransport>,
        winrm_transport: Arc<dyn WinRmTransport>,
    ) -> Self {
        Self {
            backend,
            ssh_transport,
            winrm_transport,
            name: spec
                .name
                .unwrap_or_else(|| format!("vm-{}", Uuid::new_v4())),
            template: spec.template,
            resource_pool: spec.resource_pool.or_else(|| config.resource_pool.clone()),
            datastore: spec.datastore.or_else(|| config.datastore.clone()),
            datastore_threshold: spec
                .datastore_threshold
                .unwrap_or(config.datastore_threshold),
            folder: spec.folder.or_else(|| config.folder.clone()),
            compute_host: spec.compute_host.or_else(|| config.compute_host.clone()),
            cpu_count: spec.cpu_count,
            memory_mib: spec.memory_mib,
            annotation: spec.annotation,
            power_on_after_create: spec.power_on.unwrap_or(true),
            ssh_credentials: spec.ssh.or_else(|| config.ssh.clone()),
            winrm_credentials: spec.winrm.or_else(|| config.winrm.clone()),
            timeout: Duration::from_secs(spec.timeout_secs.unwrap_or(config.timeout_secs)),
            poll_interval: Duration::from_secs(config.poll_interval_secs),
            winrm_busy_markers: config.winrm_busy_markers.clone(),
            vm_ref: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The attached backend reference, when resolved.
    pub fn object_ref(&self) -> Option<&ObjectRef> {
        self.vm_ref.as_ref()
    }

    pub(crate) fn attach(&mut self, obj: ObjectRef) {
        self.vm_ref = Some(obj);
    }

    /// Change the polling bound for subsequent operations.
    pub fn set_timeout(&mut self, secs: u64) {
        self.timeout = Duration::from_secs(secs);
    }

    /// Rename the handle. Only allowed before the VM exists.
    pub fn rename(&mut self, name: impl Into<String>) -> DriverResult<()> {
        if self.vm_ref.is_some() {
            return Err(DriverError::other(format!(
                "cannot rename '{}': already attached to a backend object",
                self.name
            )));
        }
        self.name = name.into();
        Ok(())
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Clone this VM from its template. No-op when already resolved.
    ///
    /// Placement objects are resolved by name, the datastore free-space
    /// threshold is checked before the clone task is issued, and the
    /// backend reference is attached only after the task succeeds.
    pub async fn create(&mut self) -> DriverResult<()> {
        if self.vm_ref.is_some() {
            return Ok(());
        }
        let template_name = self
            .template
            .clone()
            .ok_or_else(|| DriverError::config("no template configured"))?;
        let pool_name = self
            .resource_pool
            .clone()
            .ok_or_else(|| DriverError::config("no resource pool configured"))?;
        let datastore_name = self
            .datastore
            .clone()
            .ok_or_else(|| DriverError::config("no datastore configured"))?;
        let folder_name = self
            .folder
            .clone()
            .ok_or_else(|| DriverError::config("no folder configured"))?;

        let backend = self.backend.clone();
        let template =
            inventory::find_one(backend.as_ref(), ObjectKind::VirtualMachine, &template_name)
                .await?;
        let resource_pool =
            inventory::find_one(backend.as_ref(), ObjectKind::ResourcePool, &pool_name).await?;
        let datastore =
            inventory::find_one(backend.as_ref(), ObjectKind::Datastore, &datastore_name).await?;
        let folder = inventory::find_one(backend.as_ref(), ObjectKind::Folder, &folder_name).await?;
        let host = match &self.compute_host {
            Some(name) => Some(inventory::find_one(backend.as_ref(), ObjectKind::Host, name).await?),
            None => None,
        };

        let space = backend.datastore_space(&datastore).await?;
        let reserved = (space.capacity as f64 * self.datastore_threshold) as u64;
        if space.free < reserved {
            return Err(DriverError::insufficient_space(format!(
                "datastore '{}' has {} bytes free but the threshold reserves {}",
                datastore.name, space.free, reserved
            )));
        }

        info!("cloning '{}' from template '{}'", self.name, template.name);
        let request = CloneRequest {
            name: self.name.clone(),
            template,
            resource_pool,
            datastore,
            folder,
            host,
            cpu_count: self.cpu_count,
            memory_mib: self.memory_mib,
            annotation: self.annotation.clone(),
        };
        let clone_task = backend.clone_from_template(&request).await?;
        let result = wait_for_task(
            backend.as_ref(),
            &clone_task,
            &format!("clone of '{}'", self.name),
            self.timeout,
            &[],
        )
        .await?;

        let vm_ref = match result {
            Some(id) => ObjectRef::new(ObjectKind::VirtualMachine, id, self.name.clone()),
            None => {
                inventory::find_one(backend.as_ref(), ObjectKind::VirtualMachine, &self.name)
                    .await?
            }
        };
        self.vm_ref = Some(vm_ref);
        info!("virtual machine '{}' created", self.name);

        if self.power_on_after_create {
            self.power_on().await?;
        }
        Ok(())
    }

    /// Power off and delete the VM. No-op when unresolved. The reference
    /// is detached only once the delete task has succeeded.
    pub async fn destroy(&mut self) -> DriverResult<()> {
        let Some(vm_ref) = self.vm_ref.clone() else {
            return Ok(());
        };
        let backend = self.backend.clone();
        let off_task = backend.power_task(&vm_ref, PowerOp::Off).await?;
        wait_for_task(
            backend.as_ref(),
            &off_task,
            &format!("power off of '{}'", self.name),
            self.timeout,
            POWER_SWALLOW_FAULTS,
        )
        .await?;
        let destroy_task = backend.destroy_task(&vm_ref).await?;
        wait_for_task(
            backend.as_ref(),
            &destroy_task,
            &format!("destruction of '{}'", self.name),
            self.timeout,
            &[],
        )
        .await?;
        self.vm_ref = None;
        info!("virtual machine '{}' destroyed", self.name);
        Ok(())
    }

    /// Attach to a pre-existing VM by name. No-op when already resolved.
    pub async fn find(&mut self) -> DriverResult<()> {
        if self.vm_ref.is_some() {
            return Ok(());
        }
        let found =
            inventory::find_one(self.backend.as_ref(), ObjectKind::VirtualMachine, &self.name)
                .await?;
        self.vm_ref = Some(found);
        Ok(())
    }

    /// Re-resolve the backend reference through a fresh session. Guards
    /// against stale handles after long-lived sessions. No-op when
    /// unresolved.
    pub async fn refresh(&mut self) -> DriverResult<()> {
        if self.vm_ref.is_none() {
            return Ok(());
        }
        self.backend.close().await?;
        self.vm_ref = None;
        self.find().await
    }

    // ── Power ───────────────────────────────────────────────────────

    pub async fn power_on(&self) -> DriverResult<()> {
        self.power(PowerOp::On, "power on").await
    }

    pub async fn power_off(&self) -> DriverResult<()> {
        self.power(PowerOp::Off, "power off").await
    }

    pub async fn reset(&self) -> DriverResult<()> {
        self.power(PowerOp::Reset, "reset").await
    }

    async fn power(&self, op: PowerOp, what: &str) -> DriverResult<()> {
        let Some(vm_ref) = &self.vm_ref else {
            return Ok(());
        };
        let task = self.backend.power_task(vm_ref, op).await?;
        wait_for_task(
            self.backend.as_ref(),
            &task,
            &format!("{what} of '{}'", self.name),
            self.timeout,
            POWER_SWALLOW_FAULTS,
        )
        .await?;
        Ok(())
    }

    /// Soft guest reboot. No-op unless the VM is resolved, powered on,
    /// and guest tools are running. Guest-initiated, so there is no task
    /// handle to confirm completion on.
    pub async fn reboot(&self) -> DriverResult<()> {
        self.guest(GuestOp::Reboot, "reboot").await
    }

    /// Soft guest shutdown. Same preconditions and limitation as
    /// [`VirtualMachine::reboot`].
    pub async fn shutdown(&self) -> DriverResult<()> {
        self.guest(GuestOp::Shutdown, "shutdown").await
    }

    async fn guest(&self, op: GuestOp, what: &str) -> DriverResult<()> {
        let Some(vm_ref) = &self.vm_ref else {
            return Ok(());
        };
        let runtime = self.backend.vm_runtime(vm_ref).await?;
        if runtime.power_state != PowerState::PoweredOn || !runtime.tools_running {
            debug!(
                "skipping {what} of '{}': power={:?} tools_running={}",
                self.name, runtime.power_state, runtime.tools_running
            );
            return Ok(());
        }
        self.backend.guest_action(vm_ref, op).await
    }

    // ── Guest address / metadata ────────────────────────────────────

    /// The guest's IP address. Unresolved handles yield `None`. When the
    /// live field is empty and `dhcp_wait` is set, polls until the
    /// address appears or the timeout elapses.
    pub async fn ip(&self, dhcp_wait: bool) -> DriverResult<Option<IpAddr>> {
        let Some(vm_ref) = &self.vm_ref else {
            return Ok(None);
        };
        let current = self.backend.vm_runtime(vm_ref).await?.ip_address;
        if let Some(raw) = current.filter(|addr| !addr.is_empty()) {
            return parse_ip(&raw).map(Some);
        }
        if !dhcp_wait {
            return Ok(None);
        }
        let backend = self.backend.clone();
        let target = vm_ref.clone();
        let what = format!("IP address of '{}'", self.name);
        let raw = retry_until(self.timeout, self.poll_interval, &what, move || {
            let backend = backend.clone();
            let target = target.clone();
            async move {
                match backend.vm_runtime(&target).await {
                    Ok(runtime) => match runtime.ip_address.filter(|addr| !addr.is_empty()) {
                        Some(addr) => Ok(addr),
                        None => Err(Attempt::Transient(DriverError::other(
                            "no guest address reported yet",
                        ))),
                    },
                    Err(err) => Err(Attempt::Transient(err)),
                }
            }
        })
        .await?;
        parse_ip(&raw).map(Some)
    }

    /// Register this VM with the host autostart manager using default
    /// delay and priority. Fire-and-forget; no-op when unresolved.
    pub async fn set_autostart(&self) -> DriverResult<()> {
        let Some(vm_ref) = &self.vm_ref else {
            return Ok(());
        };
        self.backend.register_autostart(vm_ref).await
    }

    /// Free-text status snapshot from the backend. Read-only.
    pub async fn summary(&self) -> DriverResult<Option<String>> {
        let Some(vm_ref) = &self.vm_ref else {
            return Ok(None);
        };
        self.backend.vm_summary(vm_ref).await.map(Some)
    }

    /// Creation time derived from the backend change-tracking metadata.
    pub async fn created_at(&self) -> DriverResult<Option<DateTime<Utc>>> {
        let Some(vm_ref) = &self.vm_ref else {
            return Ok(None);
        };
        match self.backend.vm_change_version(vm_ref).await? {
            Some(raw) => DateTime::parse_from_rfc3339(&raw)
                .map(|stamp| Some(stamp.with_timezone(&Utc)))
                .map_err(|e| {
                    DriverError::parse(format!("invalid change version '{raw}': {e}"))
                }),
            None => Ok(None),
        }
    }

    // ── Snapshots ───────────────────────────────────────────────────

    /// Find the single snapshot named `name` anywhere in the forest.
    /// `None` when unresolved; `NotFound`/`Ambiguous` per cardinality.
    pub async fn find_snapshot(&self, name: &str) -> DriverResult<Option<SnapshotNode>> {
        let Some(vm_ref) = &self.vm_ref else {
            return Ok(None);
        };
        let forest = self.backend.snapshot_tree(vm_ref).await?;
        snapshot::resolve_unique(&forest, name).map(|node| Some(node.clone()))
    }

    /// Take a snapshot. Fails `Ambiguous` if the forest already holds a
    /// node of that name, before any task is issued.
    pub async fn create_snapshot(&self, name: &str, memory: bool) -> DriverResult<()> {
        let Some(vm_ref) = &self.vm_ref else {
            return Ok(());
        };
        let forest = self.backend.snapshot_tree(vm_ref).await?;
        if !snapshot::collect_matches(&forest, name).is_empty() {
            return Err(DriverError::ambiguous(format!(
                "snapshot '{name}' already exists on '{}'",
                self.name
            )));
        }
        let task = self.backend.create_snapshot_task(vm_ref, name, memory).await?;
        wait_for_task(
            self.backend.as_ref(),
            &task,
            &format!("snapshot '{name}' of '{}'", self.name),
            self.timeout,
            &[],
        )
        .await?;
        Ok(())
    }

    /// Revert to the snapshot named `name`.
    pub async fn revert_snapshot(&self, name: &str) -> DriverResult<()> {
        let Some(vm_ref) = &self.vm_ref else {
            return Ok(());
        };
        let forest = self.backend.snapshot_tree(vm_ref).await?;
        let node = snapshot::resolve_unique(&forest, name)?;
        let task = self.backend.revert_snapshot_task(vm_ref, node).await?;
        wait_for_task(
            self.backend.as_ref(),
            &task,
            &format!("revert to snapshot '{name}' of '{}'", self.name),
            self.timeout,
            &[],
        )
        .await?;
        Ok(())
    }

    /// Remove the snapshot named `name`. Children are not removed.
    pub async fn remove_snapshot(&self, name: &str) -> DriverResult<()> {
        let Some(vm_ref) = &self.vm_ref else {
            return Ok(());
        };
        let forest = self.backend.snapshot_tree(vm_ref).await?;
        let node = snapshot::resolve_unique(&forest, name)?;
        let task = self.backend.remove_snapshot_task(vm_ref, node).await?;
        wait_for_task(
            self.backend.as_ref(),
            &task,
            &format!("removal of snapshot '{name}' of '{}'", self.name),
            self.timeout,
            &[],
        )
        .await?;
        Ok(())
    }
}

impl fmt::Display for VirtualMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

fn parse_ip(raw: &str) -> DriverResult<IpAddr> {
    raw.parse().map_err(|_| {
        DriverError::parse(format!("backend reported malformed IP address '{raw}'"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DriverErrorKind;
    use crate::lab::Lab;
    use crate::testing::{seed_inventory, test_config, vm_object, FakeBackend, FakeSsh, FakeWinRm};
    use crate::types::{BackendFault, VmRuntime};
    use chrono::{TimeZone, Timelike};

    struct Harness {
        backend: Arc<FakeBackend>,
        lab: Lab,
    }

    fn harness() -> Harness {
        let backend = Arc::new(FakeBackend::new());
        let lab = Lab::with_collaborators(
            test_config(),
            backend.clone(),
            Arc::new(FakeSsh::new()),
            Arc::new(FakeWinRm::new()),
        );
        Harness { backend, lab }
    }

    fn test_spec() -> VmSpec {
        VmSpec {
            name: Some("unit-vm".into()),
            template: Some("tpl".into()),
            power_on: Some(false),
            ..Default::default()
        }
    }

    fn snapshot_node(id: &str, name: &str, children: Vec<SnapshotNode>) -> SnapshotNode {
        SnapshotNode {
            id: id.into(),
            name: name.into(),
            created: None,
            children,
        }
    }

    #[tokio::test]
    async fn test_create_is_idempotent() {
        let h = harness();
        seed_inventory(&h.backend);
        h.backend.set_clone_result("vm-42");
        let mut vm = h.lab.virtual_machine(test_spec());
        vm.create().await.unwrap();
        vm.create().await.unwrap();
        assert_eq!(vm.object_ref().unwrap().id, "vm-42");
        assert_eq!(h.backend.state().clone_requests.len(), 1);
    }

    #[tokio::test]
    async fn test_create_powers_on_when_requested() {
        let h = harness();
        seed_inventory(&h.backend);
        h.backend.set_clone_result("vm-42");
        let mut spec = test_spec();
        spec.power_on = Some(true);
        let mut vm = h.lab.virtual_machine(spec);
        vm.create().await.unwrap();
        assert_eq!(h.backend.state().power_ops, vec![PowerOp::On]);
    }

    #[tokio::test]
    async fn test_create_attaches_by_find_when_task_has_no_result() {
        let h = harness();
        seed_inventory(&h.backend);
        h.backend.add_object(vm_object("vm-77", "unit-vm"));
        let mut vm = h.lab.virtual_machine(test_spec());
        vm.create().await.unwrap();
        assert_eq!(vm.object_ref().unwrap().id, "vm-77");
    }

    #[tokio::test]
    async fn test_create_insufficient_space_issues_no_task() {
        let h = harness();
        seed_inventory(&h.backend);
        h.backend.set_space(10, 100); // threshold 0.2 reserves 20
        let mut vm = h.lab.virtual_machine(test_spec());
        let err = vm.create().await.unwrap_err();
        assert_eq!(err.kind, DriverErrorKind::InsufficientSpace);
        assert!(vm.object_ref().is_none());
        assert!(h.backend.state().clone_requests.is_empty());
    }

    #[tokio::test]
    async fn test_create_missing_template_object() {
        let h = harness();
        seed_inventory(&h.backend);
        let mut spec = test_spec();
        spec.template = Some("missing-tpl".into());
        let mut vm = h.lab.virtual_machine(spec);
        let err = vm.create().await.unwrap_err();
        assert_eq!(err.kind, DriverErrorKind::NotFound);
        assert!(h.backend.state().clone_requests.is_empty());
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent() {
        let h = harness();
        let mut vm = h.lab.virtual_machine(test_spec());
        vm.attach(vm_object("vm-1", "unit-vm"));
        vm.destroy().await.unwrap();
        vm.destroy().await.unwrap();
        assert!(vm.object_ref().is_none());
        let state = h.backend.state();
        assert_eq!(state.power_ops, vec![PowerOp::Off]);
        assert_eq!(state.destroy_tasks, 1);
    }

    #[tokio::test]
    async fn test_destroy_tolerates_already_powered_off() {
        let h = harness();
        h.backend.queue_submit_fault(BackendFault {
            kind: FaultKind::InvalidPowerState,
            message: "already powered off".into(),
        });
        let mut vm = h.lab.virtual_machine(test_spec());
        vm.attach(vm_object("vm-1", "unit-vm"));
        vm.destroy().await.unwrap();
        assert!(vm.object_ref().is_none());
        assert_eq!(h.backend.state().destroy_tasks, 1);
    }

    #[tokio::test]
    async fn test_destroy_failure_keeps_reference() {
        let h = harness();
        // Power-off swallows its fault; the delete task fault propagates.
        h.backend.queue_submit_fault(BackendFault {
            kind: FaultKind::InvalidPowerState,
            message: "already powered off".into(),
        });
        h.backend.queue_submit_fault(BackendFault {
            kind: FaultKind::ResourceInUse,
            message: "disk locked".into(),
        });
        let mut vm = h.lab.virtual_machine(test_spec());
        vm.attach(vm_object("vm-1", "unit-vm"));
        let err = vm.destroy().await.unwrap_err();
        assert_eq!(
            err.kind,
            DriverErrorKind::Fault(FaultKind::ResourceInUse)
        );
        assert!(vm.object_ref().is_some());
    }

    #[tokio::test]
    async fn test_find_is_idempotent() {
        let h = harness();
        h.backend.add_object(vm_object("vm-5", "unit-vm"));
        let mut vm = h.lab.virtual_machine(test_spec());
        vm.find().await.unwrap();
        vm.find().await.unwrap();
        assert_eq!(vm.object_ref().unwrap().id, "vm-5");
        assert_eq!(h.backend.state().finds, 1);
    }

    #[tokio::test]
    async fn test_find_ambiguous() {
        let h = harness();
        h.backend.add_object(vm_object("vm-5", "unit-vm"));
        h.backend.add_object(vm_object("vm-6", "unit-vm"));
        let mut vm = h.lab.virtual_machine(test_spec());
        let err = vm.find().await.unwrap_err();
        assert_eq!(err.kind, DriverErrorKind::Ambiguous);
    }

    #[tokio::test]
    async fn test_refresh_reopens_session_and_reresolves() {
        let h = harness();
        h.backend.add_object(vm_object("vm-5", "unit-vm"));
        let mut vm = h.lab.virtual_machine(test_spec());

        vm.refresh().await.unwrap();
        assert!(vm.object_ref().is_none());
        assert_eq!(h.backend.state().closes, 0);

        vm.attach(vm_object("vm-stale", "unit-vm"));
        vm.refresh().await.unwrap();
        assert_eq!(vm.object_ref().unwrap().id, "vm-5");
        assert_eq!(h.backend.state().closes, 1);
    }

    #[tokio::test]
    async fn test_power_ops_noop_when_unresolved() {
        let h = harness();
        let vm = h.lab.virtual_machine(test_spec());
        vm.power_on().await.unwrap();
        vm.power_off().await.unwrap();
        vm.reset().await.unwrap();
        assert!(h.backend.state().power_ops.is_empty());
    }

    #[tokio::test]
    async fn test_power_on_swallows_invalid_power_state() {
        let h = harness();
        h.backend.queue_submit_fault(BackendFault {
            kind: FaultKind::InvalidPowerState,
            message: "already powered on".into(),
        });
        let mut vm = h.lab.virtual_machine(test_spec());
        vm.attach(vm_object("vm-1", "unit-vm"));
        vm.power_on().await.unwrap();
        assert_eq!(h.backend.state().power_ops, vec![PowerOp::On]);
    }

    #[tokio::test]
    async fn test_reset_propagates_other_faults() {
        let h = harness();
        h.backend.queue_submit_fault(BackendFault {
            kind: FaultKind::Other,
            message: "host entered maintenance mode".into(),
        });
        let mut vm = h.lab.virtual_machine(test_spec());
        vm.attach(vm_object("vm-1", "unit-vm"));
        let err = vm.reset().await.unwrap_err();
        assert_eq!(err.kind, DriverErrorKind::Fault(FaultKind::Other));
    }

    #[tokio::test]
    async fn test_reboot_requires_power_and_tools() {
        let h = harness();
        let mut vm = h.lab.virtual_machine(test_spec());
        vm.reboot().await.unwrap(); // unresolved: no-op
        vm.attach(vm_object("vm-1", "unit-vm"));

        h.backend.set_runtime(VmRuntime {
            power_state: PowerState::PoweredOff,
            tools_running: true,
            ip_address: None,
        });
        vm.reboot().await.unwrap();
        assert!(h.backend.state().guest_ops.is_empty());

        h.backend.set_runtime(VmRuntime {
            power_state: PowerState::PoweredOn,
            tools_running: false,
            ip_address: None,
        });
        vm.reboot().await.unwrap();
        assert!(h.backend.state().guest_ops.is_empty());

        h.backend.set_runtime(VmRuntime {
            power_state: PowerState::PoweredOn,
            tools_running: true,
            ip_address: None,
        });
        vm.reboot().await.unwrap();
        assert_eq!(h.backend.state().guest_ops, vec![GuestOp::Reboot]);
    }

    #[tokio::test]
    async fn test_shutdown_fires_once_when_eligible() {
        let h = harness();
        let mut vm = h.lab.virtual_machine(test_spec());
        vm.shutdown().await.unwrap();
        vm.attach(vm_object("vm-1", "unit-vm"));
        h.backend.set_runtime(VmRuntime {
            power_state: PowerState::PoweredOn,
            tools_running: true,
            ip_address: None,
        });
        vm.shutdown().await.unwrap();
        assert_eq!(h.backend.state().guest_ops, vec![GuestOp::Shutdown]);
    }

    #[tokio::test]
    async fn test_ip_unresolved_is_none() {
        let h = harness();
        let vm = h.lab.virtual_machine(test_spec());
        assert_eq!(vm.ip(true).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_ip_populated_returns_immediately() {
        let h = harness();
        h.backend.set_runtime(VmRuntime {
            power_state: PowerState::PoweredOn,
            tools_running: true,
            ip_address: Some("127.0.0.1".into()),
        });
        let mut vm = h.lab.virtual_machine(test_spec());
        vm.attach(vm_object("vm-1", "unit-vm"));
        assert_eq!(
            vm.ip(true).await.unwrap(),
            Some("127.0.0.1".parse().unwrap())
        );
    }

    #[tokio::test]
    async fn test_ip_accepts_ipv6() {
        let h = harness();
        h.backend.set_runtime(VmRuntime {
            power_state: PowerState::PoweredOn,
            tools_running: true,
            ip_address: Some("fe80::250:56ff:febf:1a0a".into()),
        });
        let mut vm = h.lab.virtual_machine(test_spec());
        vm.attach(vm_object("vm-1", "unit-vm"));
        assert_eq!(
            vm.ip(true).await.unwrap(),
            Some("fe80::250:56ff:febf:1a0a".parse().unwrap())
        );
    }

    #[tokio::test]
    async fn test_ip_rejects_malformed_address() {
        let h = harness();
        h.backend.set_runtime(VmRuntime {
            power_state: PowerState::PoweredOn,
            tools_running: true,
            ip_address: Some("not-an-address".into()),
        });
        let mut vm = h.lab.virtual_machine(test_spec());
        vm.attach(vm_object("vm-1", "unit-vm"));
        let err = vm.ip(true).await.unwrap_err();
        assert_eq!(err.kind, DriverErrorKind::Parse);
    }

    #[tokio::test]
    async fn test_ip_without_wait_returns_none() {
        let h = harness();
        let mut vm = h.lab.virtual_machine(test_spec());
        vm.attach(vm_object("vm-1", "unit-vm"));
        assert_eq!(vm.ip(false).await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ip_times_out_when_address_never_appears() {
        let h = harness();
        let mut vm = h.lab.virtual_machine(test_spec());
        vm.attach(vm_object("vm-1", "unit-vm"));
        vm.set_timeout(1);
        let err = vm.ip(true).await.unwrap_err();
        assert_eq!(err.kind, DriverErrorKind::Timeout);
    }

    #[tokio::test]
    async fn test_set_autostart() {
        let h = harness();
        let mut vm = h.lab.virtual_machine(test_spec());
        vm.set_autostart().await.unwrap();
        assert_eq!(h.backend.state().autostart_registrations, 0);
        vm.attach(vm_object("vm-1", "unit-vm"));
        vm.set_autostart().await.unwrap();
        assert_eq!(h.backend.state().autostart_registrations, 1);
    }

    #[tokio::test]
    async fn test_summary() {
        let h = harness();
        h.backend.state().summary = "powered on, 2 vCPU".to_string();
        let mut vm = h.lab.virtual_machine(test_spec());
        assert_eq!(vm.summary().await.unwrap(), None);
        vm.attach(vm_object("vm-1", "unit-vm"));
        assert_eq!(
            vm.summary().await.unwrap().as_deref(),
            Some("powered on, 2 vCPU")
        );
    }

    #[tokio::test]
    async fn test_created_at_parses_change_version() {
        let h = harness();
        h.backend.state().change_version = Some("2018-06-13T15:12:43.700814Z".to_string());
        let mut vm = h.lab.virtual_machine(test_spec());
        assert_eq!(vm.created_at().await.unwrap(), None);
        vm.attach(vm_object("vm-1", "unit-vm"));
        let stamp = vm.created_at().await.unwrap().unwrap();
        assert_eq!(
            stamp.with_nanosecond(0).unwrap(),
            Utc.with_ymd_and_hms(2018, 6, 13, 15, 12, 43).unwrap()
        );
    }

    #[tokio::test]
    async fn test_find_snapshot_cardinality() {
        let h = harness();
        let mut vm = h.lab.virtual_machine(test_spec());
        assert!(vm.find_snapshot("base").await.unwrap().is_none());
        vm.attach(vm_object("vm-1", "unit-vm"));

        let err = vm.find_snapshot("base").await.unwrap_err();
        assert_eq!(err.kind, DriverErrorKind::NotFound);

        h.backend.set_snapshots(vec![snapshot_node(
            "s-1",
            "root",
            vec![snapshot_node("s-2", "base", vec![])],
        )]);
        let found = vm.find_snapshot("base").await.unwrap().unwrap();
        assert_eq!(found.id, "s-2");

        h.backend.set_snapshots(vec![
            snapshot_node("s-1", "base", vec![]),
            snapshot_node("s-2", "other", vec![snapshot_node("s-3", "base", vec![])]),
        ]);
        let err = vm.find_snapshot("base").await.unwrap_err();
        assert_eq!(err.kind, DriverErrorKind::Ambiguous);
    }

    #[tokio::test]
    async fn test_create_snapshot_rejects_duplicate_name() {
        let h = harness();
        let mut vm = h.lab.virtual_machine(test_spec());
        vm.create_snapshot("base", true).await.unwrap(); // unresolved: no-op
        vm.attach(vm_object("vm-1", "unit-vm"));

        vm.create_snapshot("base", true).await.unwrap();
        assert_eq!(
            h.backend.state().snapshot_creates,
            vec![("base".to_string(), true)]
        );

        h.backend.set_snapshots(vec![snapshot_node("s-1", "base", vec![])]);
        let err = vm.create_snapshot("base", true).await.unwrap_err();
        assert_eq!(err.kind, DriverErrorKind::Ambiguous);
        assert_eq!(h.backend.state().snapshot_creates.len(), 1);
    }

    #[tokio::test]
    async fn test_revert_and_remove_snapshot() {
        let h = harness();
        let mut vm = h.lab.virtual_machine(test_spec());
        vm.revert_snapshot("base").await.unwrap();
        vm.remove_snapshot("base").await.unwrap();
        vm.attach(vm_object("vm-1", "unit-vm"));
        h.backend.set_snapshots(vec![snapshot_node("s-1", "base", vec![])]);

        vm.revert_snapshot("base").await.unwrap();
        vm.remove_snapshot("base").await.unwrap();
        let state = h.backend.state();
        assert_eq!(state.snapshot_reverts, vec!["s-1".to_string()]);
        assert_eq!(state.snapshot_removes, vec!["s-1".to_string()]);
    }

    #[tokio::test]
    async fn test_revert_snapshot_propagates_not_found() {
        let h = harness();
        let mut vm = h.lab.virtual_machine(test_spec());
        vm.attach(vm_object("vm-1", "unit-vm"));
        let err = vm.revert_snapshot("missing").await.unwrap_err();
        assert_eq!(err.kind, DriverErrorKind::NotFound);
    }

    #[test]
    fn test_display_is_the_name() {
        let backend = Arc::new(FakeBackend::new());
        let vm = VirtualMachine::assemble(
            VmSpec {
                name: Some("whatever".into()),
                ..Default::default()
            },
            &test_config(),
            backend,
            Arc::new(FakeSsh::new()),
            Arc::new(FakeWinRm::new()),
        );
        assert_eq!(vm.to_string(), "whatever");
    }

    #[test]
    fn test_generated_name_and_rename_guard() {
        let backend = Arc::new(FakeBackend::new());
        let mut vm = VirtualMachine::assemble(
            VmSpec::default(),
            &test_config(),
            backend,
            Arc::new(FakeSsh::new()),
            Arc::new(FakeWinRm::new()),
        );
        assert!(vm.name().starts_with("vm-"));
        vm.rename("renamed").unwrap();
        assert_eq!(vm.name(), "renamed");
        vm.attach(vm_object("vm-1", "renamed"));
        assert!(vm.rename("again").is_err());
    }
}
