//! Shared types for the vclab driver.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::FaultKind;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Inventory objects
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Object kinds addressable through the inventory resolver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    VirtualMachine,
    ResourcePool,
    Datastore,
    Folder,
    Host,
    Network,
}

impl ObjectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::VirtualMachine => "virtual machine",
            Self::ResourcePool => "resource pool",
            Self::Datastore => "datastore",
            Self::Folder => "folder",
            Self::Host => "host",
            Self::Network => "network",
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reference to a backend inventory object (managed-object id + name).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectRef {
    pub kind: ObjectKind,
    pub id: String,
    pub name: String,
}

impl ObjectRef {
    pub fn new(kind: ObjectKind, id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
            name: name.into(),
        }
    }
}

/// Datastore capacity numbers, in bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct DatastoreSpace {
    pub free: u64,
    pub capacity: u64,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Tasks
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Opaque handle to an asynchronous backend task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskRef {
    pub id: String,
}

impl TaskRef {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

/// A fault reported by a failed backend task.
#[derive(Debug, Clone, PartialEq)]
pub struct BackendFault {
    pub kind: FaultKind,
    pub message: String,
}

/// Task states as observed through polling.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskStatus {
    Queued,
    Running,
    /// Terminal success; the optional payload is the task result
    /// (e.g. the managed-object id of a cloned VM).
    Succeeded(Option<String>),
    /// Terminal failure with the backend-reported fault.
    Failed(BackendFault),
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Power / guest state
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PowerState {
    PoweredOn,
    PoweredOff,
    Suspended,
    #[serde(other)]
    Unknown,
}

impl Default for PowerState {
    fn default() -> Self {
        Self::Unknown
    }
}

/// Power tasks submitted to the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerOp {
    On,
    Off,
    Reset,
}

/// Guest-level soft actions. Guest-initiated, so the backend exposes no
/// task handle for them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuestOp {
    Reboot,
    Shutdown,
}

/// Live runtime info, read fresh from the backend on every query.
#[derive(Debug, Clone, Default)]
pub struct VmRuntime {
    pub power_state: PowerState,
    pub tools_running: bool,
    pub ip_address: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Snapshots
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One node of the backend snapshot forest. Backend-owned and read-only;
/// the resolver only traverses it.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotNode {
    pub id: String,
    pub name: String,
    pub created: Option<String>,
    pub children: Vec<SnapshotNode>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Provisioning
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Parameters for a clone-from-template provisioning task. All placement
/// references are resolved before the request is built.
#[derive(Debug, Clone)]
pub struct CloneRequest {
    pub name: String,
    pub template: ObjectRef,
    pub resource_pool: ObjectRef,
    pub datastore: ObjectRef,
    pub folder: ObjectRef,
    pub host: Option<ObjectRef>,
    pub cpu_count: Option<u32>,
    pub memory_mib: Option<u64>,
    pub annotation: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Guest credentials / targets
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// SSH credentials: password or private-key authentication.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SshCredentials {
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub key_path: Option<String>,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
}

fn default_ssh_port() -> u16 {
    22
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WinRmCredentials {
    pub username: String,
    pub password: String,
    #[serde(default = "default_winrm_port")]
    pub port: u16,
    #[serde(default)]
    pub https: bool,
}

fn default_winrm_port() -> u16 {
    5985
}

/// Address + credentials for one SSH session.
#[derive(Debug, Clone)]
pub struct SshTarget {
    pub host: String,
    pub credentials: SshCredentials,
}

/// Address + credentials for one WinRM session.
#[derive(Debug, Clone)]
pub struct WinRmTarget {
    pub host: String,
    pub credentials: WinRmCredentials,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Remote execution outcomes
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Result of a remote shell command. A non-zero exit code alone is not a
/// failure; the transport sets `failed` when the command is to be treated
/// as such.
#[derive(Debug, Clone, Default)]
pub struct CmdOutcome {
    pub exit_code: i32,
    pub failed: bool,
    pub stdout: String,
    pub stderr: String,
}

/// Result of a file transfer.
#[derive(Debug, Clone, Default)]
pub struct TransferOutcome {
    pub failed: bool,
    pub message: Option<String>,
}

/// Result of a remote-management script invocation.
#[derive(Debug, Clone, Default)]
pub struct ScriptOutput {
    pub status_code: i32,
    pub std_out: String,
    pub std_err: String,
}
