//! Driver configuration.
//!
//! Read once at process start: connection coordinates, default placement
//! for provisioning, default guest credentials, and the backend-version
//! specific fault identifier tables.

use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;

use crate::error::{DriverError, DriverResult};
use crate::types::{SshCredentials, WinRmCredentials};

/// Top-level driver configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DriverConfig {
    /// vCenter or ESXi hostname / IP
    pub host: String,
    /// Port (default 443)
    pub port: u16,
    /// Username (e.g. "administrator@vsphere.local")
    pub username: String,
    /// Password
    pub password: String,
    /// Skip TLS certificate verification (self-signed labs)
    pub insecure: bool,
    /// Per-request HTTP timeout in seconds
    pub request_timeout_secs: u64,
    /// Default bound in seconds for every polling operation on a VM
    pub timeout_secs: u64,
    /// Seconds between retry attempts
    pub poll_interval_secs: u64,
    /// Default resource pool for provisioning
    pub resource_pool: Option<String>,
    /// Default datastore for provisioning
    pub datastore: Option<String>,
    /// Fraction of datastore capacity that must stay free after the
    /// threshold reserve, in [0, 1]
    pub datastore_threshold: f64,
    /// Default inventory folder for provisioning
    pub folder: Option<String>,
    /// Default compute host for provisioning
    pub compute_host: Option<String>,
    /// Default guest SSH credentials
    pub ssh: Option<SshCredentials>,
    /// Default guest WinRM credentials
    pub winrm: Option<WinRmCredentials>,
    /// Task fault identifiers treated as "already in requested power
    /// state". Backend-version specific.
    pub power_fault_ids: Vec<String>,
    /// Remote stderr markers treated as transient during WinRM uploads.
    pub winrm_busy_markers: Vec<String>,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 443,
            username: String::new(),
            password: String::new(),
            insecure: true,
            request_timeout_secs: 30,
            timeout_secs: 1200,
            poll_interval_secs: 1,
            resource_pool: None,
            datastore: None,
            datastore_threshold: 0.0,
            folder: None,
            compute_host: None,
            ssh: None,
            winrm: None,
            power_fault_ids: vec![
                "ALREADY_IN_DESIRED_STATE".to_string(),
                "com.vmware.api.vcenter.vm.power.already_powered_on".to_string(),
                "com.vmware.api.vcenter.vm.power.already_powered_off".to_string(),
            ],
            winrm_busy_markers: vec!["being used by another process".to_string()],
        }
    }
}

impl DriverConfig {
    /// Load from a TOML file, then apply environment overrides.
    pub fn from_file(path: impl AsRef<Path>) -> DriverResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            DriverError::config(format!("cannot read config file '{}': {e}", path.display()))
        })?;
        let config: Self = toml::from_str(&raw).map_err(|e| {
            DriverError::config(format!("invalid config file '{}': {e}", path.display()))
        })?;
        Ok(config.apply_env())
    }

    /// Defaults plus environment overrides.
    pub fn from_env() -> Self {
        Self::default().apply_env()
    }

    /// Overlay `VCLAB_*` environment variables onto this configuration.
    pub fn apply_env(mut self) -> Self {
        if let Some(v) = env_var("VCLAB_HOST") {
            self.host = v;
        }
        if let Some(v) = env_parse::<u16>("VCLAB_PORT") {
            self.port = v;
        }
        if let Some(v) = env_var("VCLAB_USERNAME") {
            self.username = v;
        }
        if let Some(v) = env_var("VCLAB_PASSWORD") {
            self.password = v;
        }
        if let Some(v) = env_parse::<bool>("VCLAB_INSECURE") {
            self.insecure = v;
        }
        if let Some(v) = env_parse::<u64>("VCLAB_TIMEOUT") {
            self.timeout_secs = v;
        }
        if let Some(v) = env_var("VCLAB_RESOURCE_POOL") {
            self.resource_pool = Some(v);
        }
        if let Some(v) = env_var("VCLAB_DATASTORE") {
            self.datastore = Some(v);
        }
        if let Some(v) = env_parse::<f64>("VCLAB_DATASTORE_THRESHOLD") {
            self.datastore_threshold = v;
        }
        if let Some(v) = env_var("VCLAB_FOLDER") {
            self.folder = Some(v);
        }
        if let Some(v) = env_var("VCLAB_COMPUTE_HOST") {
            self.compute_host = Some(v);
        }
        if let Some(username) = env_var("VCLAB_SSH_USERNAME") {
            let mut creds = self.ssh.take().unwrap_or(SshCredentials {
                username: String::new(),
                password: None,
                key_path: None,
                port: 22,
            });
            creds.username = username;
            if let Some(v) = env_var("VCLAB_SSH_PASSWORD") {
                creds.password = Some(v);
            }
            if let Some(v) = env_var("VCLAB_SSH_KEY_PATH") {
                creds.key_path = Some(v);
            }
            self.ssh = Some(creds);
        }
        if let (Some(username), Some(password)) =
            (env_var("VCLAB_WINRM_USERNAME"), env_var("VCLAB_WINRM_PASSWORD"))
        {
            let port = env_parse::<u16>("VCLAB_WINRM_PORT").unwrap_or(5985);
            self.winrm = Some(WinRmCredentials {
                username,
                password,
                port,
                https: false,
            });
        }
        self
    }
}

fn env_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    env_var(name).and_then(|v| v.parse().ok())
}
