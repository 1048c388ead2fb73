//! vSphere REST API client with session-based authentication, and the
//! [`Backend`] implementation over it.
//!
//! Talks to vCenter / ESXi via `https://{host}/api/...`. The session
//! opens lazily on first use, is sent as `vmware-api-session-id`, and
//! closes idempotently. Mutating operations are submitted with
//! `vmw-task=true` and polled through `/api/cis/tasks`.

use std::collections::HashMap;

use async_trait::async_trait;
use log::{debug, info};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::Mutex;

use crate::backend::Backend;
use crate::config::DriverConfig;
use crate::error::{DriverError, DriverErrorKind, DriverResult, FaultKind};
use crate::types::{
    BackendFault, CloneRequest, DatastoreSpace, GuestOp, ObjectKind, ObjectRef, PowerOp,
    PowerState, SnapshotNode, TaskRef, TaskStatus, VmRuntime,
};

/// vSphere REST backend.
pub struct VsphereBackend {
    client: reqwest::Client,
    base_url: String,
    username: String,
    password: String,
    power_fault_ids: Vec<String>,
    session: Mutex<Option<String>>,
}

impl VsphereBackend {
    /// Build a backend from config. Does not open a session yet.
    pub fn new(config: &DriverConfig) -> DriverResult<Self> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(config.insecure)
            .timeout(std::time::Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| DriverError::connection(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: format!("https://{}:{}", config.host, config.port),
            username: config.username.clone(),
            password: config.password.clone(),
            power_fault_ids: config.power_fault_ids.clone(),
            session: Mutex::new(None),
        })
    }

    // ── Session management ──────────────────────────────────────────

    /// Open the session if it does not exist and return its id.
    async fn ensure_session(&self) -> DriverResult<String> {
        let mut session = self.session.lock().await;
        if let Some(ref sid) = *session {
            return Ok(sid.clone());
        }
        let url = format!("{}/api/session", self.base_url);
        let resp = self
            .client
            .post(&url)
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await?;
        if resp.status() == StatusCode::UNAUTHORIZED {
            return Err(DriverError::auth("Invalid credentials"));
        }
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(DriverError::api(
                status.as_u16(),
                format!("Login failed: {body}"),
            ));
        }
        // The session id comes back as a quoted JSON string
        let sid: String = resp
            .json()
            .await
            .map_err(|e| DriverError::parse(format!("Failed to parse session response: {e}")))?;
        info!("vCenter session opened with id {sid}");
        *session = Some(sid.clone());
        Ok(sid)
    }

    // ── HTTP helpers ────────────────────────────────────────────────

    async fn request(
        &self,
        method: Method,
        path: &str,
        params: &[(&str, &str)],
        body: Option<&Value>,
    ) -> DriverResult<Value> {
        let sid = self.ensure_session().await?;
        let url = format!("{}{}", self.base_url, path);
        let mut req = self
            .client
            .request(method, &url)
            .header("vmware-api-session-id", sid);
        if !params.is_empty() {
            req = req.query(params);
        }
        if let Some(body) = body {
            req = req.json(body);
        }
        let resp = req.send().await?;
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(match status {
                StatusCode::UNAUTHORIZED => {
                    DriverError::auth(format!("Session expired or invalid: {text}"))
                }
                StatusCode::NOT_FOUND => {
                    DriverError::not_found(format!("Resource not found: {path}"))
                }
                _ => DriverError::api(status.as_u16(), format!("API error on {path}: {text}")),
            });
        }
        if text.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).map_err(|e| {
            DriverError::parse(format!(
                "JSON parse error: {e}; body: {}",
                &text[..text.len().min(500)]
            ))
        })
    }

    async fn get_typed<T: DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, &str)],
    ) -> DriverResult<T> {
        let value = self.request(Method::GET, path, params, None).await?;
        serde_json::from_value(value)
            .map_err(|e| DriverError::parse(format!("unexpected response from {path}: {e}")))
    }

    /// Submit a `vmw-task=true` operation; the response body is the task id.
    async fn submit_task(
        &self,
        method: Method,
        path: &str,
        params: &[(&str, &str)],
        body: Option<&Value>,
    ) -> DriverResult<TaskRef> {
        let mut all_params = vec![("vmw-task", "true")];
        all_params.extend_from_slice(params);
        let value = self.request(method, path, &all_params, body).await?;
        match value.as_str() {
            Some(id) => Ok(TaskRef::new(id)),
            None => Err(DriverError::parse(format!(
                "no task id in response from {path}"
            ))),
        }
    }

    // ── Mapping helpers ─────────────────────────────────────────────

    fn fault_kind(&self, error_type: &str) -> FaultKind {
        if self.power_fault_ids.iter().any(|id| id == error_type) {
            return FaultKind::InvalidPowerState;
        }
        match error_type {
            "ALREADY_EXISTS" | "DUPLICATE_NAME" => FaultKind::DuplicateName,
            "RESOURCE_IN_USE" | "RESOURCE_BUSY" => FaultKind::ResourceInUse,
            "GUEST_TOOLS_NOT_RUNNING" => FaultKind::ToolsUnavailable,
            "NOT_FOUND" => FaultKind::NotFound,
            _ => FaultKind::Other,
        }
    }

    fn map_task_status(&self, info: TaskInfo) -> DriverResult<TaskStatus> {
        match info.status.as_deref() {
            Some("QUEUED") | Some("PENDING") => Ok(TaskStatus::Queued),
            Some("RUNNING") => Ok(TaskStatus::Running),
            Some("SUCCEEDED") => Ok(TaskStatus::Succeeded(task_result_payload(info.result))),
            Some("FAILED") => {
                let error_type = info
                    .error
                    .as_ref()
                    .and_then(|e| e.error_type.clone())
                    .unwrap_or_default();
                let message = info
                    .error
                    .and_then(|e| e.messages.into_iter().next())
                    .map(|m| m.default_message)
                    .filter(|m| !m.is_empty())
                    .unwrap_or_else(|| error_type.clone());
                Ok(TaskStatus::Failed(BackendFault {
                    kind: self.fault_kind(&error_type),
                    message,
                }))
            }
            other => Err(DriverError::parse(format!(
                "unknown task status {other:?}"
            ))),
        }
    }
}

#[async_trait]
impl Backend for VsphereBackend {
    async fn connect(&self) -> DriverResult<String> {
        self.ensure_session().await
    }

    async fn close(&self) -> DriverResult<()> {
        let mut session = self.session.lock().await;
        if let Some(sid) = session.take() {
            let url = format!("{}/api/session", self.base_url);
            let _ = self
                .client
                .delete(&url)
                .header("vmware-api-session-id", sid.as_str())
                .send()
                .await;
            info!("vCenter session {sid} closed");
        }
        Ok(())
    }

    async fn find_objects(
        &self,
        kind: ObjectKind,
        name: Option<&str>,
    ) -> DriverResult<Vec<ObjectRef>> {
        let params: Vec<(&str, &str)> = match name {
            Some(n) => vec![("names", n)],
            None => vec![],
        };
        let objects = match kind {
            ObjectKind::VirtualMachine => self
                .get_typed::<Vec<VmSummary>>("/api/vcenter/vm", &params)
                .await?
                .into_iter()
                .map(|item| ObjectRef::new(kind, item.vm, item.name))
                .collect(),
            ObjectKind::ResourcePool => self
                .get_typed::<Vec<ResourcePoolSummary>>("/api/vcenter/resource-pool", &params)
                .await?
                .into_iter()
                .map(|item| ObjectRef::new(kind, item.resource_pool, item.name))
                .collect(),
            ObjectKind::Datastore => self
                .get_typed::<Vec<DatastoreSummary>>("/api/vcenter/datastore", &params)
                .await?
                .into_iter()
                .map(|item| ObjectRef::new(kind, item.datastore, item.name))
                .collect(),
            ObjectKind::Folder => self
                .get_typed::<Vec<FolderSummary>>("/api/vcenter/folder", &params)
                .await?
                .into_iter()
                .map(|item| ObjectRef::new(kind, item.folder, item.name))
                .collect(),
            ObjectKind::Host => self
                .get_typed::<Vec<HostSummary>>("/api/vcenter/host", &params)
                .await?
                .into_iter()
                .map(|item| ObjectRef::new(kind, item.host, item.name))
                .collect(),
            ObjectKind::Network => self
                .get_typed::<Vec<NetworkSummary>>("/api/vcenter/network", &params)
                .await?
                .into_iter()
                .map(|item| ObjectRef::new(kind, item.network, item.name))
                .collect(),
        };
        Ok(objects)
    }

    async fn vms_in_folder(&self, folder: &ObjectRef) -> DriverResult<Vec<ObjectRef>> {
        let items = self
            .get_typed::<Vec<VmSummary>>("/api/vcenter/vm", &[("folders", folder.id.as_str())])
            .await?;
        Ok(items
            .into_iter()
            .map(|item| ObjectRef::new(ObjectKind::VirtualMachine, item.vm, item.name))
            .collect())
    }

    async fn datastore_space(&self, datastore: &ObjectRef) -> DriverResult<DatastoreSpace> {
        let info = self
            .get_typed::<DatastoreInfo>(&format!("/api/vcenter/datastore/{}", datastore.id), &[])
            .await?;
        Ok(DatastoreSpace {
            free: info.free_space,
            capacity: info.capacity,
        })
    }

    async fn clone_from_template(&self, request: &CloneRequest) -> DriverResult<TaskRef> {
        let mut placement = json!({
            "resource_pool": request.resource_pool.id,
            "datastore": request.datastore.id,
            "folder": request.folder.id,
        });
        if let Some(ref host) = request.host {
            placement["host"] = json!(host.id);
        }
        let mut spec = json!({
            "source": request.template.id,
            "name": request.name,
            "placement": placement,
            "power_on": false,
        });
        let mut hardware = serde_json::Map::new();
        if let Some(count) = request.cpu_count {
            hardware.insert("cpu_update".into(), json!({ "num_cpus": count }));
        }
        if let Some(mib) = request.memory_mib {
            hardware.insert("memory_update".into(), json!({ "memory": mib }));
        }
        if !hardware.is_empty() {
            spec["hardware_customization"] = Value::Object(hardware);
        }
        if let Some(ref annotation) = request.annotation {
            spec["annotation"] = json!(annotation);
        }
        debug!("submitting clone of '{}'", request.name);
        self.submit_task(
            Method::POST,
            "/api/vcenter/vm",
            &[("action", "clone")],
            Some(&spec),
        )
        .await
    }

    async fn power_task(&self, vm: &ObjectRef, op: PowerOp) -> DriverResult<TaskRef> {
        let action = match op {
            PowerOp::On => "start",
            PowerOp::Off => "stop",
            PowerOp::Reset => "reset",
        };
        self.submit_task(
            Method::POST,
            &format!("/api/vcenter/vm/{}/power", vm.id),
            &[("action", action)],
            None,
        )
        .await
    }

    async fn destroy_task(&self, vm: &ObjectRef) -> DriverResult<TaskRef> {
        self.submit_task(Method::DELETE, &format!("/api/vcenter/vm/{}", vm.id), &[], None)
            .await
    }

    async fn task_status(&self, task: &TaskRef) -> DriverResult<TaskStatus> {
        let info = self
            .get_typed::<TaskInfo>(&format!("/api/cis/tasks/{}", task.id), &[])
            .await?;
        self.map_task_status(info)
    }

    async fn guest_action(&self, vm: &ObjectRef, op: GuestOp) -> DriverResult<()> {
        let action = match op {
            GuestOp::Reboot => "reboot",
            GuestOp::Shutdown => "shutdown",
        };
        self.request(
            Method::POST,
            &format!("/api/vcenter/vm/{}/guest/power", vm.id),
            &[("action", action)],
            None,
        )
        .await?;
        Ok(())
    }

    async fn register_autostart(&self, vm: &ObjectRef) -> DriverResult<()> {
        // Negative values keep the host scheduler defaults.
        let body = json!({ "start_delay": -1, "start_order": -1 });
        self.request(
            Method::PUT,
            &format!("/api/vcenter/vm/{}/autostart", vm.id),
            &[],
            Some(&body),
        )
        .await?;
        Ok(())
    }

    async fn vm_runtime(&self, vm: &ObjectRef) -> DriverResult<VmRuntime> {
        let power = self
            .get_typed::<PowerInfo>(&format!("/api/vcenter/vm/{}/power", vm.id), &[])
            .await?;
        // Tools and identity endpoints are unavailable until the guest
        // agent is up; treat that as "nothing reported yet".
        let tools_running = match self
            .get_typed::<ToolsInfo>(&format!("/api/vcenter/vm/{}/tools", vm.id), &[])
            .await
        {
            Ok(tools) => tools.run_state.as_deref() == Some("RUNNING"),
            Err(err) if is_unavailable(&err) => false,
            Err(err) => return Err(err),
        };
        let ip_address = match self
            .get_typed::<GuestIdentityInfo>(
                &format!("/api/vcenter/vm/{}/guest/identity", vm.id),
                &[],
            )
            .await
        {
            Ok(identity) => identity.ip_address,
            Err(err) if is_unavailable(&err) => None,
            Err(err) => return Err(err),
        };
        Ok(VmRuntime {
            power_state: power.state,
            tools_running,
            ip_address,
        })
    }

    async fn vm_summary(&self, vm: &ObjectRef) -> DriverResult<String> {
        let detail = self
            .request(Method::GET, &format!("/api/vcenter/vm/{}", vm.id), &[], None)
            .await?;
        serde_json::to_string_pretty(&detail)
            .map_err(|e| DriverError::parse(format!("cannot render VM summary: {e}")))
    }

    async fn vm_change_version(&self, vm: &ObjectRef) -> DriverResult<Option<String>> {
        let detail = self
            .get_typed::<VmDetail>(&format!("/api/vcenter/vm/{}", vm.id), &[])
            .await?;
        Ok(detail.change_version)
    }

    async fn snapshot_tree(&self, vm: &ObjectRef) -> DriverResult<Vec<SnapshotNode>> {
        let items = match self
            .get_typed::<Vec<SnapshotSummary>>(&format!("/api/vcenter/vm/{}/snapshots", vm.id), &[])
            .await
        {
            Ok(items) => items,
            // No snapshots at all reports as 404
            Err(err) if err.kind == DriverErrorKind::NotFound => Vec::new(),
            Err(err) => return Err(err),
        };
        Ok(build_forest(items))
    }

    async fn create_snapshot_task(
        &self,
        vm: &ObjectRef,
        name: &str,
        memory: bool,
    ) -> DriverResult<TaskRef> {
        let spec = json!({ "name": name, "memory": memory, "quiesce": false });
        self.submit_task(
            Method::POST,
            &format!("/api/vcenter/vm/{}/snapshots", vm.id),
            &[],
            Some(&spec),
        )
        .await
    }

    async fn revert_snapshot_task(
        &self,
        vm: &ObjectRef,
        snapshot: &SnapshotNode,
    ) -> DriverResult<TaskRef> {
        self.submit_task(
            Method::POST,
            &format!("/api/vcenter/vm/{}/snapshots/{}", vm.id, snapshot.id),
            &[("action", "revert")],
            None,
        )
        .await
    }

    async fn remove_snapshot_task(
        &self,
        vm: &ObjectRef,
        snapshot: &SnapshotNode,
    ) -> DriverResult<TaskRef> {
        self.submit_task(
            Method::DELETE,
            &format!("/api/vcenter/vm/{}/snapshots/{}", vm.id, snapshot.id),
            &[],
            None,
        )
        .await
    }
}

fn is_unavailable(err: &DriverError) -> bool {
    matches!(
        err.kind,
        DriverErrorKind::NotFound | DriverErrorKind::ApiError(503)
    )
}

fn task_result_payload(result: Option<Value>) -> Option<String> {
    match result {
        Some(Value::String(id)) => Some(id),
        Some(Value::Object(map)) => map
            .get("value")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()),
        _ => None,
    }
}

/// Rebuild the snapshot forest from the flat parent-linked list the
/// snapshots endpoint returns. Input order is preserved among siblings.
fn build_forest(items: Vec<SnapshotSummary>) -> Vec<SnapshotNode> {
    let by_id: HashMap<String, &SnapshotSummary> = items
        .iter()
        .map(|item| (item.snapshot.clone(), item))
        .collect();
    let mut children_of: HashMap<String, Vec<String>> = HashMap::new();
    let mut roots = Vec::new();
    for item in &items {
        match item.parent.as_ref().filter(|p| by_id.contains_key(*p)) {
            Some(parent) => children_of
                .entry(parent.clone())
                .or_default()
                .push(item.snapshot.clone()),
            None => roots.push(item.snapshot.clone()),
        }
    }
    roots
        .iter()
        .map(|id| assemble_node(id, &by_id, &children_of))
        .collect()
}

fn assemble_node(
    id: &str,
    by_id: &HashMap<String, &SnapshotSummary>,
    children_of: &HashMap<String, Vec<String>>,
) -> SnapshotNode {
    let summary = by_id[id];
    SnapshotNode {
        id: id.to_string(),
        name: summary.name.clone().unwrap_or_default(),
        created: summary.creation_time.clone(),
        children: children_of
            .get(id)
            .map(|kids| {
                kids.iter()
                    .map(|kid| assemble_node(kid, by_id, children_of))
                    .collect()
            })
            .unwrap_or_default(),
    }
}

// ── Wire types ──────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct VmSummary {
    vm: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct ResourcePoolSummary {
    resource_pool: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct DatastoreSummary {
    datastore: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct FolderSummary {
    folder: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct HostSummary {
    host: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct NetworkSummary {
    network: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct DatastoreInfo {
    free_space: u64,
    capacity: u64,
}

#[derive(Debug, Deserialize)]
struct PowerInfo {
    state: PowerState,
}

#[derive(Debug, Deserialize)]
struct ToolsInfo {
    #[serde(default)]
    run_state: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GuestIdentityInfo {
    #[serde(default)]
    ip_address: Option<String>,
}

#[derive(Debug, Deserialize)]
struct VmDetail {
    #[serde(default)]
    change_version: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SnapshotSummary {
    snapshot: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    parent: Option<String>,
    #[serde(default)]
    creation_time: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TaskInfo {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<TaskErrorInfo>,
}

#[derive(Debug, Deserialize)]
struct TaskErrorInfo {
    #[serde(default)]
    error_type: Option<String>,
    #[serde(default)]
    messages: Vec<TaskMessage>,
}

#[derive(Debug, Deserialize)]
struct TaskMessage {
    #[serde(default)]
    default_message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::test_config;

    fn backend() -> VsphereBackend {
        VsphereBackend::new(&test_config()).unwrap()
    }

    fn summary(id: &str, name: &str, parent: Option<&str>) -> SnapshotSummary {
        SnapshotSummary {
            snapshot: id.to_string(),
            name: Some(name.to_string()),
            parent: parent.map(|p| p.to_string()),
            creation_time: None,
        }
    }

    #[test]
    fn test_fault_kind_uses_configured_power_ids() {
        let backend = backend();
        assert_eq!(
            backend.fault_kind("ALREADY_IN_DESIRED_STATE"),
            FaultKind::InvalidPowerState
        );
        assert_eq!(
            backend.fault_kind("com.vmware.api.vcenter.vm.power.already_powered_off"),
            FaultKind::InvalidPowerState
        );
        assert_eq!(backend.fault_kind("ALREADY_EXISTS"), FaultKind::DuplicateName);
        assert_eq!(
            backend.fault_kind("RESOURCE_IN_USE"),
            FaultKind::ResourceInUse
        );
        assert_eq!(backend.fault_kind("SOMETHING_ELSE"), FaultKind::Other);
    }

    #[test]
    fn test_map_task_status_success_payload() {
        let backend = backend();
        let info = TaskInfo {
            status: Some("SUCCEEDED".into()),
            result: Some(Value::String("vm-42".into())),
            error: None,
        };
        assert_eq!(
            backend.map_task_status(info).unwrap(),
            TaskStatus::Succeeded(Some("vm-42".into()))
        );

        let info = TaskInfo {
            status: Some("SUCCEEDED".into()),
            result: Some(json!({ "value": "vm-43" })),
            error: None,
        };
        assert_eq!(
            backend.map_task_status(info).unwrap(),
            TaskStatus::Succeeded(Some("vm-43".into()))
        );
    }

    #[test]
    fn test_map_task_status_failure() {
        let backend = backend();
        let info = TaskInfo {
            status: Some("FAILED".into()),
            result: None,
            error: Some(TaskErrorInfo {
                error_type: Some("ALREADY_IN_DESIRED_STATE".into()),
                messages: vec![TaskMessage {
                    default_message: "The virtual machine is already powered on.".into(),
                }],
            }),
        };
        match backend.map_task_status(info).unwrap() {
            TaskStatus::Failed(fault) => {
                assert_eq!(fault.kind, FaultKind::InvalidPowerState);
                assert!(fault.message.contains("already powered on"));
            }
            other => panic!("unexpected status {other:?}"),
        }
    }

    #[test]
    fn test_map_task_status_non_terminal() {
        let backend = backend();
        let info = TaskInfo {
            status: Some("RUNNING".into()),
            result: None,
            error: None,
        };
        assert_eq!(backend.map_task_status(info).unwrap(), TaskStatus::Running);
    }

    #[test]
    fn test_build_forest_rebuilds_parent_links() {
        let forest = build_forest(vec![
            summary("s-1", "base", None),
            summary("s-2", "mid", Some("s-1")),
            summary("s-3", "leaf", Some("s-2")),
            summary("s-4", "other-root", None),
        ]);
        assert_eq!(forest.len(), 2);
        assert_eq!(forest[0].name, "base");
        assert_eq!(forest[0].children.len(), 1);
        assert_eq!(forest[0].children[0].name, "mid");
        assert_eq!(forest[0].children[0].children[0].name, "leaf");
        assert_eq!(forest[1].name, "other-root");
    }

    #[test]
    fn test_build_forest_orphan_parent_becomes_root() {
        let forest = build_forest(vec![summary("s-2", "dangling", Some("s-missing"))]);
        assert_eq!(forest.len(), 1);
        assert_eq!(forest[0].name, "dangling");
    }

    #[test]
    fn test_task_result_payload_shapes() {
        assert_eq!(
            task_result_payload(Some(Value::String("vm-1".into()))),
            Some("vm-1".into())
        );
        assert_eq!(
            task_result_payload(Some(json!({ "value": "vm-2" }))),
            Some("vm-2".into())
        );
        assert_eq!(task_result_payload(Some(json!(17))), None);
        assert_eq!(task_result_payload(None), None);
    }
}