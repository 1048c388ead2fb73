//! Top-level facade: owns the driver configuration and the collaborator
//! handles, and hands out [`VirtualMachine`] handles with the config
//! defaults applied.

use std::sync::Arc;

use crate::backend::Backend;
use crate::config::DriverConfig;
use crate::error::DriverResult;
use crate::inventory;
use crate::ssh::{Ssh2Transport, SshTransport};
use crate::types::{ObjectKind, ObjectRef};
use crate::vm::{VirtualMachine, VmSpec};
use crate::vsphere::VsphereBackend;
use crate::winrm::{WinRmTransport, WsmanTransport};

pub struct Lab {
    config: DriverConfig,
    backend: Arc<dyn Backend>,
    ssh: Arc<dyn SshTransport>,
    winrm: Arc<dyn WinRmTransport>,
}

impl Lab {
    /// Wire the production collaborators from the configuration.
    pub fn new(config: DriverConfig) -> DriverResult<Self> {
        let backend = Arc::new(VsphereBackend::new(&config)?);
        let ssh = Arc::new(Ssh2Transport::new());
        let winrm = Arc::new(WsmanTransport::new(&config)?);
        Ok(Self::with_collaborators(config, backend, ssh, winrm))
    }

    /// Inject alternative collaborators (test doubles, other backends).
    pub fn with_collaborators(
        config: DriverConfig,
        backend: Arc<dyn Backend>,
        ssh: Arc<dyn SshTransport>,
        winrm: Arc<dyn WinRmTransport>,
    ) -> Self {
        Self {
            config,
            backend,
            ssh,
            winrm,
        }
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    /// Open the backend session eagerly and return its id. Sessions also
    /// open lazily on first use, so calling this is optional.
    pub async fn connect(&self) -> DriverResult<String> {
        self.backend.connect().await
    }

    /// Close the backend session. No-op when already closed.
    pub async fn close(&self) -> DriverResult<()> {
        self.backend.close().await
    }

    /// Build an unresolved VM handle with config defaults applied.
    pub fn virtual_machine(&self, spec: VmSpec) -> VirtualMachine {
        VirtualMachine::assemble(
            spec,
            &self.config,
            Arc::clone(&self.backend),
            Arc::clone(&self.ssh),
            Arc::clone(&self.winrm),
        )
    }

    /// Every VM in the inventory, as attached handles.
    pub async fn all_virtual_machines(&self) -> DriverResult<Vec<VirtualMachine>> {
        let objects =
            inventory::find_all(self.backend.as_ref(), ObjectKind::VirtualMachine).await?;
        Ok(objects.into_iter().map(|obj| self.attached(obj)).collect())
    }

    /// Destroy every VM in the named folder; returns the (now detached)
    /// handles of what was destroyed.
    pub async fn destroy_virtual_machines(
        &self,
        folder_name: &str,
    ) -> DriverResult<Vec<VirtualMachine>> {
        let folder =
            inventory::find_one(self.backend.as_ref(), ObjectKind::Folder, folder_name).await?;
        let mut destroyed = Vec::new();
        for obj in self.backend.vms_in_folder(&folder).await? {
            let mut vm = self.attached(obj);
            vm.destroy().await?;
            destroyed.push(vm);
        }
        Ok(destroyed)
    }

    fn attached(&self, obj: ObjectRef) -> VirtualMachine {
        let mut vm = self.virtual_machine(VmSpec {
            name: Some(obj.name.clone()),
            ..Default::default()
        });
        vm.attach(obj);
        vm
    }
}
