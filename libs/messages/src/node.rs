//! Node-level messages: hello, status, routing and component discovery.

use dea_id::NodeId;
use serde::{Deserialize, Serialize};

/// Published on `dea.start` at boot and sent as the `dea.discover` reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HelloMessage {
    pub id: NodeId,
    pub ip: String,
    pub port: u16,
    pub version: String,
}

/// Reply to `dea.status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeaStatusResponse {
    #[serde(flatten)]
    pub hello: HelloMessage,
    /// Node memory limit in MB.
    pub max_memory: u64,
    /// Memory reserved by admitted instances, in MB.
    pub reserved_memory: u64,
    /// Measured resident memory of all instances, in KB.
    pub used_memory: u64,
    pub num_clients: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
}

/// Tags attached to a route registration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RouterTags {
    pub framework: String,
    pub runtime: String,
}

/// `router.register` / `router.unregister` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouterMessage {
    pub dea: NodeId,
    pub host: String,
    pub port: u16,
    pub uris: Vec<String>,
    pub tags: RouterTags,
}

/// `vcap.component.announce` payload and `vcap.component.discover` reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentAnnouncement {
    #[serde(rename = "type")]
    pub kind: String,
    pub index: u32,
    pub uuid: NodeId,
    pub host: String,
    /// RFC 3339 start time.
    pub start: String,
    /// Human-readable uptime, e.g. `0d:1h:2m:3s`.
    pub uptime: String,
}

/// Formats a duration the way component discovery reports uptime.
pub fn format_uptime(elapsed: std::time::Duration) -> String {
    let secs = elapsed.as_secs();
    let days = secs / 86_400;
    let hours = (secs % 86_400) / 3_600;
    let minutes = (secs % 3_600) / 60;
    let seconds = secs % 60;
    format!("{days}d:{hours}h:{minutes}m:{seconds}s")
}
