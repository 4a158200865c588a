//! Durable state of one instance.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use dea_id::{DomainId, DropletId, InstanceId};
use dea_messages::{ExitReason, InstanceState, InstanceUsage, StartRequest};
use serde::{Deserialize, Serialize};

const MB: u64 = 1024 * 1024;

/// Everything the agent knows about one instance.
///
/// This is the unit written to the snapshot file. Fields marked
/// `#[serde(skip)]` describe this process's view of the instance and are
/// rebuilt after a restart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DropletInstanceProperties {
    pub state: InstanceState,
    pub exit_reason: Option<ExitReason>,
    /// Recovered from a snapshot; the process was not launched by this agent run.
    #[serde(default)]
    pub orphaned: bool,
    pub start: DateTime<Utc>,
    pub state_timestamp: DateTime<Utc>,
    /// Counted by the monitor against node totals.
    #[serde(default)]
    pub resources_tracked: bool,
    #[serde(default)]
    pub stop_processed: bool,
    pub debug_mode: Option<String>,
    pub port: Option<u16>,
    pub debug_port: Option<u16>,
    pub debug_ip: Option<String>,
    pub runtime: String,
    pub framework: String,
    pub fds_quota: u64,
    /// Disk quota in bytes.
    #[serde(rename = "disk_quota")]
    pub disk_quota_bytes: u64,
    /// Memory quota in bytes.
    #[serde(rename = "mem_quota")]
    pub mem_quota_bytes: u64,
    pub name: String,
    pub instance_id: InstanceId,
    pub version: String,
    pub droplet_id: DropletId,
    pub instance_index: u32,
    pub dir: PathBuf,
    pub uris: Vec<String>,
    pub users: Vec<String>,
    #[serde(default)]
    pub evacuated: bool,
    pub pid: Option<u32>,
    /// `droplet.exited` has been published for this instance.
    #[serde(default)]
    pub notified: bool,
    /// Name of the instance directory under `apps/`.
    pub staged: String,
    pub usage: Option<InstanceUsage>,
    #[serde(default)]
    pub environment_variables: BTreeMap<String, String>,

    /// Cooperative cancellation flag checked by the stager.
    #[serde(skip)]
    pub stop_requested: bool,

    /// Execution domain hosting the process.
    #[serde(skip)]
    pub domain: Option<DomainId>,
}

impl DropletInstanceProperties {
    /// Initial properties for a start request, in state STARTING.
    pub fn from_start_request(request: &StartRequest) -> Self {
        let now = Utc::now();
        Self {
            state: InstanceState::Starting,
            exit_reason: None,
            orphaned: false,
            start: now,
            state_timestamp: now,
            resources_tracked: false,
            stop_processed: false,
            debug_mode: request.debug.clone(),
            port: None,
            debug_port: None,
            debug_ip: None,
            runtime: request.runtime.clone(),
            framework: request.framework.clone(),
            fds_quota: request.limits.fds,
            disk_quota_bytes: request.limits.disk.saturating_mul(MB),
            mem_quota_bytes: request.limits.mem.saturating_mul(MB),
            name: request.name.clone(),
            instance_id: InstanceId::new(),
            version: request.version.clone(),
            droplet_id: request.droplet.clone(),
            instance_index: request.index,
            dir: PathBuf::new(),
            uris: request.uris.clone(),
            users: request.users.clone(),
            evacuated: false,
            pid: None,
            notified: false,
            staged: String::new(),
            usage: None,
            environment_variables: BTreeMap::new(),
            stop_requested: false,
            domain: None,
        }
    }

    /// Memory quota in MB, the unit admission control works in.
    pub fn mem_quota_mb(&self) -> u64 {
        self.mem_quota_bytes / MB
    }
}
