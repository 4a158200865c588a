//! Instance lifecycle: start, stop, crash detection and reaping.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use dea_id::{DomainId, InstanceId};
use dea_messages::{ExitReason, InstanceState};
use tracing::{debug, info, warn};

use super::{Agent, MONITOR_INTERVAL};
use crate::domain::{DomainHandle, DomainReply, DomainRequest};
use crate::droplet::{DropletInstance, TraversalMode};
use crate::launcher::LaunchRequest;
use crate::monitor::sample_usage;
use crate::stager::StageOutcome;

const READINESS_ATTEMPTS: u32 = 20;
const READINESS_POLL: Duration = Duration::from_millis(100);

/// Inputs of the start task beyond the instance itself.
pub(super) struct StartPlan {
    pub bits_file: PathBuf,
    pub bits_uri: String,
    pub sha1: String,
    pub environment: Vec<(String, String)>,
}

impl Agent {
    /// Stage, launch and confirm one instance. Any failure crashes it.
    pub(super) async fn run_start(self, instance: Arc<DropletInstance>, plan: StartPlan) {
        if let Err(e) = self.start_instance(&instance, plan).await {
            warn!(
                instance_id = %instance.instance_id(),
                error = %format!("{e:#}"),
                "Failed to start instance"
            );
            instance.write().mark_crashed();
            self.stop_droplet(&instance).await;
        }
    }

    async fn start_instance(&self, instance: &Arc<DropletInstance>, plan: StartPlan) -> Result<()> {
        let inner = &self.inner;
        let instance_id = instance.instance_id();

        let tgz = inner.stager.tgz_path(&plan.sha1);
        let outcome = inner
            .stager
            .stage_app_directory(
                Some(plan.bits_file.as_path()),
                &plan.bits_uri,
                &plan.sha1,
                &tgz,
                instance,
            )
            .await
            .context("staging failed")?;
        if outcome == StageOutcome::Cancelled {
            info!(instance_id = %instance_id, "Start cancelled during staging");
            return Ok(());
        }
        if self.discard_if_stopped(instance).await {
            return Ok(());
        }

        let request = {
            let data = instance.read();
            LaunchRequest {
                instance_id,
                dir: data.properties.dir.clone(),
                environment: plan.environment,
                fds_quota: data.properties.fds_quota,
                enforce_ulimit: inner.config.enforce_ulimit,
            }
        };

        let handle = inner
            .domains
            .create_domain()
            .await
            .context("failed to create execution domain")?;
        instance.write().properties.domain = Some(handle.id());

        let reply = inner
            .domains
            .invoke(&handle, DomainRequest::Start(request))
            .await
            .context("launch failed")?;
        let DomainReply::Started { pid } = reply else {
            bail!("unexpected launch reply: {reply:?}");
        };

        let cancelled = {
            let mut data = instance.write();
            data.properties.pid = Some(pid);
            data.properties
                .environment_variables
                .insert("VCAP_APP_PID".to_string(), pid.to_string());
            data.properties.stop_requested
        };
        if cancelled {
            // The stop ran before the pid was known and had nothing to kill.
            self.stop_process(instance_id, pid, Some(handle.id())).await;
            return Ok(());
        }
        info!(instance_id = %instance_id, pid, "Instance launched");

        self.wait_until_alive(pid).await?;

        let route = {
            let mut data = instance.write();
            if data.properties.state != InstanceState::Starting {
                debug!(instance_id = %instance_id, "Instance left STARTING during launch");
                return Ok(());
            }
            data.set_state(InstanceState::Running)?;
            let uris = data.properties.uris.clone();
            self.route_for(&data.properties, uris)
        };

        self.send_instance_heartbeat(instance);
        if let Some(route) = route {
            if let Err(e) = inner.reactor.send_router_register(&route) {
                warn!(instance_id = %instance_id, error = %e, "Failed to register routes");
            }
        }
        inner.droplets.schedule_snapshot_app_state();

        info!(instance_id = %instance_id, pid, "Instance running");
        Ok(())
    }

    /// Drop a directory unpacked for an instance that was stopped while
    /// it unpacked. The reaper may already have removed the instance, and
    /// then nothing else would delete it.
    async fn discard_if_stopped(&self, instance: &DropletInstance) -> bool {
        let dir = {
            let data = instance.read();
            if !data.properties.stop_requested {
                return false;
            }
            data.properties.dir.clone()
        };

        info!(instance_id = %instance.instance_id(), "Stop arrived while staging");
        if !self.inner.config.disable_dir_cleanup && !dir.as_os_str().is_empty() {
            if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(dir = %dir.display(), error = %e, "Failed to remove instance directory");
                }
            }
        }
        true
    }

    async fn wait_until_alive(&self, pid: u32) -> Result<()> {
        for _ in 0..READINESS_ATTEMPTS {
            if self.inner.launcher.is_alive(pid) {
                return Ok(());
            }
            tokio::time::sleep(READINESS_POLL).await;
        }
        bail!("process {pid} exited before becoming ready")
    }

    /// Publish the exit, move to STOPPED, stop the process and release the
    /// instance's resources. Runs at most once per instance.
    pub(super) async fn stop_droplet(&self, instance: &Arc<DropletInstance>) {
        let inner = &self.inner;
        let instance_id = instance.instance_id();

        let target = {
            let mut data = instance.write();
            if data.properties.stop_processed {
                return;
            }

            if !data.properties.notified {
                if data.properties.state == InstanceState::Running {
                    let uris = data.properties.uris.clone();
                    if let Some(route) = self.route_for(&data.properties, uris) {
                        if let Err(e) = inner.reactor.send_router_unregister(&route) {
                            warn!(instance_id = %instance_id, error = %e, "Failed to unregister routes");
                        }
                    }
                }
                data.record_exit_reason(ExitReason::Crashed);
                if let Err(e) = inner
                    .reactor
                    .send_droplet_exited(&data.generate_droplet_exited_message())
                {
                    warn!(instance_id = %instance_id, error = %e, "Failed to publish exit");
                }
                data.properties.notified = true;
            }

            let pid = if data.properties.state.is_monitorable() {
                let _ = data.set_state(InstanceState::Stopped);
                data.properties.pid
            } else {
                None
            };

            data.properties.stop_requested = true;
            inner.monitor.remove_tracked_resources(&mut data.properties);
            data.properties.stop_processed = true;

            info!(
                instance_id = %instance_id,
                state = %data.properties.state,
                reason = ?data.properties.exit_reason,
                "Stopping instance"
            );
            pid.map(|pid| (pid, data.properties.domain))
        };

        if let Some((pid, domain)) = target {
            self.stop_process(instance_id, pid, domain).await;
        }
        inner.droplets.schedule_snapshot_app_state();
    }

    /// Stop through the instance's domain, or directly when it has none.
    async fn stop_process(&self, instance_id: InstanceId, pid: u32, domain: Option<DomainId>) {
        if let Some(id) = domain {
            let handle = DomainHandle::from_id(id);
            match self
                .inner
                .domains
                .invoke(&handle, DomainRequest::Stop { pid })
                .await
            {
                Ok(_) => return,
                Err(e) => {
                    warn!(instance_id = %instance_id, pid, error = %e, "Domain stop failed, stopping directly");
                }
            }
        }

        if let Err(e) = self.inner.launcher.stop(pid).await {
            warn!(instance_id = %instance_id, pid, error = %e, "Failed to stop process");
        }
    }

    /// One monitor sweep: sample usage, detect crashes, enforce quotas and
    /// dump disk usage.
    pub async fn monitor_apps(&self) {
        let agent = self.clone();
        let to_stop = match tokio::task::spawn_blocking(move || agent.sample_instances()).await {
            Ok(to_stop) => to_stop,
            Err(e) => {
                warn!(error = %e, "Monitor sweep failed");
                return;
            }
        };
        for instance in to_stop {
            self.stop_droplet(&instance).await;
        }

        let agent = self.clone();
        let dump = tokio::task::spawn_blocking(move || {
            let config = &agent.inner.config;
            agent
                .inner
                .monitor
                .dump_apps_dir_disk_usage(&config.apps_dir(), &config.db_dir())
        })
        .await;
        match dump {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!(error = %e, "Disk usage dump failed"),
            Err(e) => warn!(error = %e, "Disk usage task failed"),
        }
    }

    /// Blocking half of the sweep. Returns instances to stop.
    fn sample_instances(&self) -> Vec<Arc<DropletInstance>> {
        let inner = &self.inner;
        let mut to_stop = Vec::new();
        let mut memory_kb = 0;

        inner.droplets.for_each(TraversalMode::Upgradable, |instance| {
            let (state, pid, dir, last_ticks) = {
                let data = instance.read();
                (
                    data.properties.state,
                    data.properties.pid,
                    data.properties.dir.clone(),
                    data.last_cpu_ticks,
                )
            };
            if state != InstanceState::Running {
                return;
            }
            let Some(pid) = pid else {
                return;
            };

            if !inner.launcher.is_alive(pid) {
                let mut data = instance.write();
                let uris = data.properties.uris.clone();
                let route = self.route_for(&data.properties, uris);
                if data.properties.state == InstanceState::Running && data.mark_crashed() {
                    warn!(instance_id = %instance.instance_id(), pid, "Instance crashed");
                    if let Some(route) = route {
                        let _ = inner.reactor.send_router_unregister(&route);
                    }
                    to_stop.push(instance.clone());
                }
                return;
            }

            let Some((usage, ticks)) = sample_usage(pid, &dir, last_ticks, MONITOR_INTERVAL) else {
                return;
            };
            memory_kb += usage.mem;

            let mut data = instance.write();
            data.add_usage(usage);
            data.last_cpu_ticks = Some(ticks);

            if inner.config.secure {
                let props = &data.properties;
                let over_memory = usage.mem.saturating_mul(1024) > props.mem_quota_bytes;
                let over_disk = usage.disk > props.disk_quota_bytes;
                if over_memory || over_disk {
                    warn!(
                        instance_id = %instance.instance_id(),
                        mem_kb = usage.mem,
                        disk_bytes = usage.disk,
                        "Instance exceeded its quota"
                    );
                    to_stop.push(instance.clone());
                }
            }
        });

        inner.monitor.set_memory_usage_kb(memory_kb);
        to_stop
    }

    /// Release and remove finished instances.
    ///
    /// A STOPPED instance goes once its exit is published; a CRASHED one is
    /// kept for `retention` so it can still be found.
    pub async fn reap_crashes(&self, retention: Duration) {
        let inner = &self.inner;
        let now = Utc::now();
        let mut reaped = 0;

        for instance in inner.droplets.instances() {
            let reap = {
                let mut data = instance.write();
                let state = data.properties.state;
                if !state.is_terminal() {
                    continue;
                }
                inner.monitor.remove_tracked_resources(&mut data.properties);

                let expired = (now - data.properties.state_timestamp)
                    .to_std()
                    .is_ok_and(|age| age >= retention);
                let due = match state {
                    InstanceState::Stopped => data.properties.notified,
                    InstanceState::Crashed => expired,
                    _ => true,
                };
                if !due {
                    continue;
                }
                if state != InstanceState::Deleted {
                    let _ = data.set_state(InstanceState::Deleted);
                }
                (data.properties.dir.clone(), data.properties.domain.take())
            };
            let (dir, domain) = reap;

            if !inner.config.disable_dir_cleanup && !dir.as_os_str().is_empty() {
                if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        warn!(dir = %dir.display(), error = %e, "Failed to remove instance directory");
                    }
                }
            }
            if let Some(id) = domain {
                if let Err(e) = inner.domains.destroy_domain(DomainHandle::from_id(id)).await {
                    debug!(domain_id = %id, error = %e, "Domain already gone");
                }
            }
            inner.droplets.remove_instance(&instance);
            info!(instance_id = %instance.instance_id(), "Reaped instance");
            reaped += 1;
        }

        if reaped > 0 {
            inner.droplets.schedule_snapshot_app_state();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::path::Path;

    use super::*;
    use crate::{Config, LocalBus, MockLauncher, TaskDomainHost};
    use dea_messages::StartRequest;
    use tempfile::TempDir;

    fn agent(base: &Path, overrides: &[(&'static str, &str)]) -> Agent {
        let runtimes = base.join("runtimes.toml");
        std::fs::write(&runtimes, "[runtimes.sh]\nexecutable = \"sh\"\nversion = \".*\"\n").unwrap();
        let mut vars = HashMap::from([
            ("DEA_BASE_DIR", base.join("dea").display().to_string()),
            ("DEA_RUNTIMES_FILE", runtimes.display().to_string()),
            ("DEA_HOST", "127.0.0.1".to_string()),
        ]);
        for (key, value) in overrides {
            vars.insert(*key, value.to_string());
        }
        let config = Config::from_lookup(|key| vars.get(key).cloned()).unwrap();

        let launcher = Arc::new(MockLauncher::new());
        let domains = Arc::new(TaskDomainHost::new(launcher.clone()));
        Agent::new(config, Arc::new(LocalBus::new()), domains, launcher).unwrap()
    }

    fn staged_instance(agent: &Agent) -> Arc<DropletInstance> {
        let request: StartRequest = serde_json::from_value(serde_json::json!({
            "droplet": "blog",
            "index": 0,
            "name": "blog",
            "runtime": "sh",
            "version": "v1"
        }))
        .unwrap();
        let instance = agent.inner.droplets.create_instance(&request);
        {
            let mut data = instance.write();
            data.properties.dir = agent.inner.config.apps_dir().join("blog-0-x");
            agent.inner.monitor.add_tracked_resources(&mut data.properties);
        }
        instance
    }

    fn unpack_into(dir: &Path) {
        std::fs::create_dir_all(dir.join("app")).unwrap();
        std::fs::write(dir.join("startup"), "#!/bin/sh\n").unwrap();
    }

    #[tokio::test]
    async fn test_unpack_after_reap_is_discarded() {
        let base = TempDir::new().unwrap();
        let agent = agent(base.path(), &[]);
        let instance = staged_instance(&agent);
        let dir = instance.read().properties.dir.clone();

        // Stop and reap land while the archive is still unpacking.
        agent.stop_droplet(&instance).await;
        agent.reap_crashes(Duration::from_secs(3600)).await;
        assert!(agent.inner.droplets.is_empty());
        unpack_into(&dir);

        assert!(agent.discard_if_stopped(&instance).await);
        assert!(!dir.exists());
        assert_eq!(agent.inner.monitor.reserved_memory_mb(), 0);
    }

    #[tokio::test]
    async fn test_running_start_keeps_its_directory() {
        let base = TempDir::new().unwrap();
        let agent = agent(base.path(), &[]);
        let instance = staged_instance(&agent);
        let dir = instance.read().properties.dir.clone();
        unpack_into(&dir);

        assert!(!agent.discard_if_stopped(&instance).await);
        assert!(dir.join("startup").is_file());
    }

    #[tokio::test]
    async fn test_discard_respects_disabled_cleanup() {
        let base = TempDir::new().unwrap();
        let agent = agent(base.path(), &[("DEA_DISABLE_DIR_CLEANUP", "true")]);
        let instance = staged_instance(&agent);
        let dir = instance.read().properties.dir.clone();
        unpack_into(&dir);
        instance.write().properties.stop_requested = true;

        assert!(agent.discard_if_stopped(&instance).await);
        assert!(dir.is_dir());
    }
}
