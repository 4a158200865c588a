//! One instance, its usage history and the messages projected from it.

use std::collections::VecDeque;

use chrono::Utc;
use dea_id::{DropletId, InstanceId, NodeId};
use dea_messages::{
    DropletExited, DropletStatus, ExitReason, FindDropletResponse, InstanceHeartbeat,
    InstanceState, InstanceUsage,
};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;

use super::properties::DropletInstanceProperties;
use crate::launcher::InstanceLauncher;

/// Number of usage samples retained per instance.
pub const MAX_USAGE_SAMPLES: usize = 30;

/// Errors from instance state changes.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InstanceError {
    #[error("invalid transition for {instance_id}: {from} -> {to}")]
    InvalidTransition {
        instance_id: InstanceId,
        from: InstanceState,
        to: InstanceState,
    },
}

/// Lock-protected part of an instance.
#[derive(Debug)]
pub struct InstanceData {
    pub properties: DropletInstanceProperties,
    usage: VecDeque<InstanceUsage>,
    /// CPU ticks at the previous sample, for utilisation deltas.
    pub last_cpu_ticks: Option<u64>,
}

impl InstanceData {
    /// Moves to `next`, stamping the transition time in the same write.
    pub fn set_state(&mut self, next: InstanceState) -> Result<(), InstanceError> {
        let props = &mut self.properties;
        if !props.state.can_transition_to(next) {
            return Err(InstanceError::InvalidTransition {
                instance_id: props.instance_id,
                from: props.state,
                to: next,
            });
        }
        props.state = next;
        props.state_timestamp = Utc::now();
        Ok(())
    }

    /// Records why the instance exited. Only the first reason sticks.
    pub fn record_exit_reason(&mut self, reason: ExitReason) -> bool {
        if self.properties.exit_reason.is_some() {
            return false;
        }
        self.properties.exit_reason = Some(reason);
        true
    }

    /// Marks a STARTING or RUNNING instance crashed.
    pub fn mark_crashed(&mut self) -> bool {
        if self.set_state(InstanceState::Crashed).is_err() {
            return false;
        }
        self.record_exit_reason(ExitReason::Crashed);
        true
    }

    pub fn add_usage(&mut self, sample: InstanceUsage) {
        if self.usage.len() == MAX_USAGE_SAMPLES {
            self.usage.pop_front();
        }
        self.usage.push_back(sample);
        self.properties.usage = Some(sample);
    }

    pub fn usage(&self) -> impl Iterator<Item = &InstanceUsage> {
        self.usage.iter()
    }

    pub fn latest_usage(&self) -> Option<&InstanceUsage> {
        self.usage.back()
    }

    pub fn generate_instance_heartbeat(&self) -> InstanceHeartbeat {
        let props = &self.properties;
        InstanceHeartbeat {
            droplet: props.droplet_id.clone(),
            version: props.version.clone(),
            instance: props.instance_id,
            index: props.instance_index,
            state: props.state,
            state_timestamp: props.state_timestamp.timestamp(),
        }
    }

    pub fn generate_droplet_exited_message(&self) -> DropletExited {
        let props = &self.properties;
        let crash_timestamp = (props.state == InstanceState::Crashed)
            .then(|| props.state_timestamp.timestamp());
        DropletExited {
            droplet: props.droplet_id.clone(),
            version: props.version.clone(),
            instance: props.instance_id,
            index: props.instance_index,
            reason: props.exit_reason,
            crash_timestamp,
        }
    }

    pub fn generate_droplet_status_message(&self, host: &str) -> DropletStatus {
        let props = &self.properties;
        let uptime = (Utc::now() - props.start).num_milliseconds().max(0) as f64 / 1000.0;
        DropletStatus {
            name: props.name.clone(),
            host: host.to_string(),
            port: props.port,
            uris: props.uris.clone(),
            uptime,
            mem_quota: props.mem_quota_bytes,
            disk_quota: props.disk_quota_bytes,
            fds_quota: props.fds_quota,
            usage: self.latest_usage().copied(),
        }
    }

    pub fn generate_find_droplet_response(
        &self,
        node_id: NodeId,
        file_uri: &str,
        credentials: Option<Vec<String>>,
        stats: Option<DropletStatus>,
    ) -> FindDropletResponse {
        let props = &self.properties;
        FindDropletResponse {
            dea: node_id,
            version: props.version.clone(),
            droplet: props.droplet_id.clone(),
            instance: props.instance_id,
            index: props.instance_index,
            state: props.state,
            state_timestamp: props.state_timestamp.timestamp(),
            file_uri: file_uri.to_string(),
            credentials,
            staged: props.staged.clone(),
            debug_ip: props.debug_ip.clone(),
            debug_port: props.debug_port,
            stats,
        }
    }
}

/// One instance, guarded by its own read/write lock.
#[derive(Debug)]
pub struct DropletInstance {
    instance_id: InstanceId,
    droplet_id: DropletId,
    data: RwLock<InstanceData>,
}

impl DropletInstance {
    pub fn new(properties: DropletInstanceProperties) -> Self {
        Self {
            instance_id: properties.instance_id,
            droplet_id: properties.droplet_id.clone(),
            data: RwLock::new(InstanceData {
                properties,
                usage: VecDeque::with_capacity(MAX_USAGE_SAMPLES),
                last_cpu_ticks: None,
            }),
        }
    }

    pub fn instance_id(&self) -> InstanceId {
        self.instance_id
    }

    pub fn droplet_id(&self) -> &DropletId {
        &self.droplet_id
    }

    pub fn read(&self) -> RwLockReadGuard<'_, InstanceData> {
        self.data.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, InstanceData> {
        self.data.write()
    }

    pub fn state(&self) -> InstanceState {
        self.read().properties.state
    }

    pub fn properties(&self) -> DropletInstanceProperties {
        self.read().properties.clone()
    }

    pub fn generate_instance_heartbeat(&self) -> InstanceHeartbeat {
        self.read().generate_instance_heartbeat()
    }

    pub fn generate_droplet_exited_message(&self) -> DropletExited {
        self.read().generate_droplet_exited_message()
    }

    pub fn generate_droplet_status_message(&self, host: &str) -> DropletStatus {
        self.read().generate_droplet_status_message(host)
    }

    /// Live check against the OS, not cached state.
    pub fn is_running(&self, launcher: &dyn InstanceLauncher) -> bool {
        match self.read().properties.pid {
            Some(pid) => launcher.is_alive(pid),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launcher::MockLauncher;
    use dea_messages::StartRequest;

    fn start_request() -> StartRequest {
        serde_json::from_value(serde_json::json!({
            "droplet": "42",
            "index": 0,
            "name": "blog",
            "uris": ["blog.example.com"],
            "runtime": "sh",
            "sha1": "abc",
            "executableFile": "/nonexistent",
            "executableUri": "http://localhost/abc",
            "version": "abc-1",
            "limits": {"mem": 256, "disk": 128, "fds": 64}
        }))
        .unwrap()
    }

    fn instance() -> DropletInstance {
        DropletInstance::new(DropletInstanceProperties::from_start_request(&start_request()))
    }

    fn sample(n: u64) -> InstanceUsage {
        InstanceUsage {
            mem: n,
            cpu: 0.0,
            disk: 0,
            time: n as i64,
        }
    }

    #[test]
    fn test_new_instance_is_starting() {
        let instance = instance();
        let props = instance.properties();
        assert_eq!(props.state, InstanceState::Starting);
        assert_eq!(props.mem_quota_mb(), 256);
        assert_eq!(props.disk_quota_bytes, 128 * 1024 * 1024);
        assert_eq!(props.start, props.state_timestamp);
    }

    #[test]
    fn test_state_change_stamps_timestamp() {
        let instance = instance();
        let before = instance.read().properties.state_timestamp;
        std::thread::sleep(std::time::Duration::from_millis(2));
        instance.write().set_state(InstanceState::Running).unwrap();
        let data = instance.read();
        assert_eq!(data.properties.state, InstanceState::Running);
        assert!(data.properties.state_timestamp > before);
    }

    #[test]
    fn test_illegal_transition_leaves_state() {
        let instance = instance();
        let err = instance
            .write()
            .set_state(InstanceState::Deleted)
            .unwrap_err();
        assert!(matches!(err, InstanceError::InvalidTransition { .. }));
        assert_eq!(instance.state(), InstanceState::Starting);
    }

    #[test]
    fn test_exit_reason_set_once() {
        let instance = instance();
        let mut data = instance.write();
        assert!(data.record_exit_reason(ExitReason::DeaEvacuation));
        assert!(!data.record_exit_reason(ExitReason::DeaShutdown));
        assert!(data.mark_crashed());
        assert_eq!(data.properties.exit_reason, Some(ExitReason::DeaEvacuation));
    }

    #[test]
    fn test_usage_ring_buffer_evicts_oldest() {
        let instance = instance();
        let mut data = instance.write();
        for n in 0..(MAX_USAGE_SAMPLES as u64 + 5) {
            data.add_usage(sample(n));
        }
        assert_eq!(data.usage().count(), MAX_USAGE_SAMPLES);
        assert_eq!(data.usage().next().unwrap().mem, 5);
        assert_eq!(data.latest_usage().unwrap().mem, MAX_USAGE_SAMPLES as u64 + 4);
        assert_eq!(data.properties.usage.unwrap().mem, MAX_USAGE_SAMPLES as u64 + 4);
    }

    #[test]
    fn test_status_without_samples_has_no_usage() {
        let status = instance().generate_droplet_status_message("10.0.0.1");
        assert!(status.usage.is_none());
        assert_eq!(status.mem_quota, 256 * 1024 * 1024);
        assert_eq!(status.host, "10.0.0.1");
    }

    #[test]
    fn test_exited_message_crash_timestamp() {
        let instance = instance();
        instance.write().mark_crashed();
        let exited = instance.generate_droplet_exited_message();
        assert_eq!(exited.reason, Some(ExitReason::Crashed));
        assert!(exited.crash_timestamp.is_some());

        let stopped = self::instance();
        {
            let mut data = stopped.write();
            data.record_exit_reason(ExitReason::Stopped);
            data.set_state(InstanceState::Stopped).unwrap();
        }
        assert!(stopped.generate_droplet_exited_message().crash_timestamp.is_none());
    }

    #[test]
    fn test_is_running_asks_launcher() {
        let launcher = MockLauncher::new();
        let instance = instance();
        assert!(!instance.is_running(&launcher));

        let pid = launcher.spawn_fake();
        instance.write().properties.pid = Some(pid);
        assert!(instance.is_running(&launcher));

        launcher.kill(pid);
        assert!(!instance.is_running(&launcher));
    }
}
