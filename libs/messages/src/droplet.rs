//! Per-instance reports published by the agent.

use dea_id::{DropletId, InstanceId, NodeId};
use serde::{Deserialize, Serialize};

use crate::state::{ExitReason, InstanceState, InstanceUsage};

/// One entry of the aggregate heartbeat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceHeartbeat {
    pub droplet: DropletId,
    pub version: String,
    pub instance: InstanceId,
    pub index: u32,
    pub state: InstanceState,
    /// Unix seconds of the last state change.
    pub state_timestamp: i64,
}

/// `dea.heartbeat` payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatMessage {
    pub droplets: Vec<InstanceHeartbeat>,
}

/// `droplet.exited` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DropletExited {
    pub droplet: DropletId,
    pub version: String,
    pub instance: InstanceId,
    pub index: u32,
    pub reason: Option<ExitReason>,
    /// Set only when the instance crashed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crash_timestamp: Option<i64>,
}

/// Reply to `droplet.status`, also embedded as `stats` in find replies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DropletStatus {
    pub name: String,
    pub host: String,
    pub port: Option<u16>,
    pub uris: Vec<String>,
    /// Seconds since the instance was started.
    pub uptime: f64,
    /// Memory quota in bytes.
    pub mem_quota: u64,
    /// Disk quota in bytes.
    pub disk_quota: u64,
    pub fds_quota: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<InstanceUsage>,
}

/// Reply to `dea.find.droplet`, one per matching instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FindDropletResponse {
    pub dea: NodeId,
    pub version: String,
    pub droplet: DropletId,
    pub instance: InstanceId,
    pub index: u32,
    pub state: InstanceState,
    pub state_timestamp: i64,
    pub file_uri: String,
    pub credentials: Option<Vec<String>>,
    pub staged: String,
    pub debug_ip: Option<String>,
    pub debug_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<DropletStatus>,
}
