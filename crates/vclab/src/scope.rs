//! Guaranteed-cleanup acquisition helpers.
//!
//! Rust has no `finally`, and async drop cannot run the teardown tasks,
//! so scoped acquisition takes the body as an async closure and sequences
//! cleanup on every exit path itself.

use futures::future::BoxFuture;
use log::warn;

use crate::error::DriverResult;
use crate::vm::VirtualMachine;

/// Snapshot name used by the [`snapshot`] scope.
pub const SCOPE_SNAPSHOT: &str = "vclab-scope";

/// Provision every VM, run `body`, then destroy every VM.
///
/// Creation stops at the first failure; the body only runs when every VM
/// came up. Teardown is best-effort over the whole slice on all exit
/// paths, so VMs that did get created are cleaned up even when a later
/// create or the body failed. The first setup error or the body error
/// propagates after cleanup.
pub async fn virtual_machines<T>(
    vms: &mut [VirtualMachine],
    body: impl for<'a> FnOnce(&'a mut [VirtualMachine]) -> BoxFuture<'a, DriverResult<T>>,
) -> DriverResult<T> {
    let mut setup_error = None;
    for vm in vms.iter_mut() {
        if let Err(err) = vm.create().await {
            warn!("provisioning '{}' failed: {err}", vm.name());
            setup_error = Some(err);
            break;
        }
    }
    let result = match setup_error {
        Some(err) => Err(err),
        None => body(&mut *vms).await,
    };
    for vm in vms.iter_mut() {
        if let Err(err) = vm.destroy().await {
            warn!("cleanup of '{}' failed: {err}", vm.name());
        }
    }
    result
}

/// Snapshot the VM, run `body`, then revert to and remove the snapshot
/// regardless of the body's outcome.
pub async fn snapshot<T>(
    vm: &mut VirtualMachine,
    body: impl for<'a> FnOnce(&'a mut VirtualMachine) -> BoxFuture<'a, DriverResult<T>>,
) -> DriverResult<T> {
    vm.create_snapshot(SCOPE_SNAPSHOT, true).await?;
    let result = body(&mut *vm).await;
    if let Err(err) = vm.revert_snapshot(SCOPE_SNAPSHOT).await {
        warn!("revert of scope snapshot on '{}' failed: {err}", vm.name());
    }
    if let Err(err) = vm.remove_snapshot(SCOPE_SNAPSHOT).await {
        warn!("removal of scope snapshot on '{}' failed: {err}", vm.name());
    }
    result
}
