//! Inbound commands from the control plane.

use dea_id::DropletId;
use serde::{Deserialize, Serialize};

use crate::state::InstanceState;

/// Default memory quota when a start request carries no limits, in MB.
pub const DEFAULT_APP_MEMORY_MB: u64 = 512;
/// Default disk quota, in MB.
pub const DEFAULT_APP_DISK_MB: u64 = 256;
/// Default file-descriptor quota.
pub const DEFAULT_APP_FDS: u64 = 1024;

/// Resource limits requested for an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Limits {
    /// Memory quota in MB.
    #[serde(default = "default_mem")]
    pub mem: u64,
    /// Disk quota in MB.
    #[serde(default = "default_disk")]
    pub disk: u64,
    /// File-descriptor quota.
    #[serde(default = "default_fds")]
    pub fds: u64,
}

fn default_mem() -> u64 {
    DEFAULT_APP_MEMORY_MB
}

fn default_disk() -> u64 {
    DEFAULT_APP_DISK_MB
}

fn default_fds() -> u64 {
    DEFAULT_APP_FDS
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            mem: DEFAULT_APP_MEMORY_MB,
            disk: DEFAULT_APP_DISK_MB,
            fds: DEFAULT_APP_FDS,
        }
    }
}

impl Limits {
    /// True if the memory and disk quotas can be expressed in bytes.
    pub fn is_addressable(&self) -> bool {
        const MB: u64 = 1024 * 1024;
        self.mem.checked_mul(MB).is_some() && self.disk.checked_mul(MB).is_some()
    }
}

/// A bound service as described by the control plane.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceBinding {
    pub name: Option<String>,
    pub label: Option<String>,
    pub plan: Option<String>,
    pub tags: Option<serde_json::Value>,
    pub plan_option: Option<serde_json::Value>,
    pub credentials: Option<serde_json::Value>,
}

/// `dea.<node-id>.start`: place one instance on this node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartRequest {
    pub droplet: DropletId,
    pub index: u32,
    pub name: String,
    #[serde(default)]
    pub uris: Vec<String>,
    pub runtime: String,
    #[serde(default)]
    pub framework: String,
    #[serde(default)]
    pub sha1: Option<String>,
    #[serde(rename = "executableFile", default)]
    pub executable_file: Option<String>,
    #[serde(rename = "executableUri", default)]
    pub executable_uri: Option<String>,
    pub version: String,
    #[serde(default)]
    pub services: Vec<ServiceBinding>,
    /// User environment as `KEY=VALUE` strings.
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub users: Vec<String>,
    #[serde(default)]
    pub limits: Limits,
    /// Requested debug mode, if any.
    #[serde(default)]
    pub debug: Option<String>,
}

/// Instance selector shared by `dea.stop` and `dea.find.droplet`.
///
/// Absent fields match every instance of the droplet.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DropletFilter {
    pub droplet: DropletId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instances: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub indices: Option<Vec<u32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub states: Option<Vec<InstanceState>>,
    #[serde(default)]
    pub include_stats: bool,
}

impl DropletFilter {
    /// Returns true if an instance with these attributes is selected.
    pub fn matches(&self, version: &str, instance: &str, index: u32, state: InstanceState) -> bool {
        if self.version.as_deref().is_some_and(|v| v != version) {
            return false;
        }
        if let Some(instances) = &self.instances {
            if !instances.iter().any(|i| i == instance) {
                return false;
            }
        }
        if let Some(indices) = &self.indices {
            if !indices.contains(&index) {
                return false;
            }
        }
        if let Some(states) = &self.states {
            if !states.contains(&state) {
                return false;
            }
        }
        true
    }
}

/// `dea.stop` payload.
pub type StopRequest = DropletFilter;

/// `dea.find.droplet` payload.
pub type FindDropletRequest = DropletFilter;

/// `dea.update`: replace the uri set of a droplet's running instances.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateRequest {
    pub droplet: DropletId,
    #[serde(default)]
    pub uris: Vec<String>,
}

/// `dea.discover`: the control plane looking for a node to place on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoverRequest {
    pub droplet: DropletId,
    #[serde(default)]
    pub name: String,
    pub runtime: String,
    #[serde(default)]
    pub sha: Option<String>,
    #[serde(default)]
    pub limits: Limits,
}
