//! Agent orchestration.
//!
//! The [`Agent`] wires the registry, monitor, stager and reactor together,
//! drives the recurring timers and implements the evacuate and shutdown
//! control flow.
//!
//! ```text
//! bus ─▶ DeaReactor ─▶ Agent handler ─▶ Stager / Monitor ─▶ DropletCollection
//!                                  └──────────▶ DeaReactor (publish)
//! ```

mod handlers;
mod lifecycle;

use std::collections::HashSet;
use std::fs;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use dea_messages::{
    format_uptime, ComponentAnnouncement, ExitReason, HeartbeatMessage, HelloMessage,
    InstanceState, RouterMessage, RouterTags,
};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bus::MessageBus;
use crate::config::Config;
use crate::domain::ExecutionDomain;
use crate::droplet::{
    DropletCollection, DropletInstance, DropletInstanceProperties, TraversalMode,
};
use crate::launcher::InstanceLauncher;
use crate::monitor::Monitor;
use crate::reactor::{DeaHandler, DeaReactor};
use crate::runtimes::RuntimeRegistry;
use crate::stager::{Stager, StagerConfig};
use crate::timers::spawn_recurring;

/// Agent version reported in hello messages.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub const MONITOR_INTERVAL: Duration = Duration::from_secs(10);
pub const CRASHES_REAPER_INTERVAL: Duration = Duration::from_secs(10);
/// How long a crashed instance stays visible to `dea.find.droplet`.
pub const CRASHES_REAPER_TIMEOUT: Duration = Duration::from_secs(60 * 60);
pub const CACHE_CLEANUP_INTERVAL: Duration = Duration::from_secs(20);
pub const SNAPSHOT_INTERVAL: Duration = Duration::from_secs(10);

const SHUTDOWN_POLL: Duration = Duration::from_millis(100);

/// Agent lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Initializing,
    Running,
    Evacuating,
    ShuttingDown,
    Stopped,
}

/// The execution agent. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Agent {
    inner: Arc<AgentInner>,
}

struct AgentInner {
    config: Config,
    runtimes: Arc<RuntimeRegistry>,
    monitor: Monitor,
    stager: Stager,
    droplets: Arc<DropletCollection>,
    reactor: DeaReactor,
    domains: Arc<dyn ExecutionDomain>,
    launcher: Arc<dyn InstanceLauncher>,
    state_tx: watch::Sender<AgentState>,
    shutdown_tx: watch::Sender<bool>,
    started_at: DateTime<Utc>,
    started: Instant,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Agent {
    /// Build the agent and probe the configured runtimes.
    pub fn new(
        config: Config,
        bus: Arc<dyn MessageBus>,
        domains: Arc<dyn ExecutionDomain>,
        launcher: Arc<dyn InstanceLauncher>,
    ) -> Result<Self> {
        let mut runtimes =
            RuntimeRegistry::new(&config.runtimes).context("invalid runtime definition")?;
        runtimes.setup_runtimes();
        if runtimes.enabled().next().is_none() {
            warn!("No runtimes enabled, this node will not accept instances");
        }
        let runtimes = Arc::new(runtimes);

        let stager = Stager::new(StagerConfig::from(&config), runtimes.clone())
            .context("failed to build stager")?;
        let monitor = Monitor::new(config.max_memory_mb, config.max_clients);
        let droplets = Arc::new(DropletCollection::new(config.snapshot_file.clone()));
        let reactor = DeaReactor::new(bus, config.node_id);

        let (state_tx, _) = watch::channel(AgentState::Initializing);
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            inner: Arc::new(AgentInner {
                config,
                runtimes,
                monitor,
                stager,
                droplets,
                reactor,
                domains,
                launcher,
                state_tx,
                shutdown_tx,
                started_at: Utc::now(),
                started: Instant::now(),
                tasks: Mutex::new(Vec::new()),
            }),
        })
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn droplets(&self) -> &Arc<DropletCollection> {
        &self.inner.droplets
    }

    pub fn monitor(&self) -> &Monitor {
        &self.inner.monitor
    }

    pub fn stager(&self) -> &Stager {
        &self.inner.stager
    }

    pub fn state(&self) -> AgentState {
        *self.inner.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<AgentState> {
        self.inner.state_tx.subscribe()
    }

    /// Bring the node up: directories, recovery, subscriptions, timers,
    /// then announce it on the bus.
    pub async fn start(&self) -> Result<()> {
        self.inner
            .stager
            .create_directories()
            .context("failed to create base directories")?;

        self.recover_existing_droplets();
        self.delete_untracked_instance_dirs();

        let handler: Arc<dyn DeaHandler> = Arc::new(self.clone());
        let subscriptions = self
            .inner
            .reactor
            .start(handler, self.inner.shutdown_tx.subscribe())
            .context("failed to subscribe")?;
        self.inner.tasks.lock().extend(subscriptions);

        self.arm_timers();
        self.transition(&[AgentState::Initializing], AgentState::Running);

        if let Err(e) = self.inner.reactor.send_dea_start(&self.hello()) {
            warn!(error = %e, "Failed to publish hello");
        }
        if let Err(e) = self
            .inner
            .reactor
            .send_component_announce(&self.component_announcement())
        {
            warn!(error = %e, "Failed to announce component");
        }

        info!(
            node_id = %self.inner.config.node_id,
            host = %self.inner.config.host,
            instances = self.inner.droplets.instance_count(),
            "DEA started"
        );
        Ok(())
    }

    fn arm_timers(&self) {
        let shutdown = || self.inner.shutdown_tx.subscribe();
        let mut tasks = self.inner.tasks.lock();

        let agent = self.clone();
        tasks.push(spawn_recurring(
            "heartbeat",
            self.inner.config.heartbeat_interval,
            shutdown(),
            move || {
                let agent = agent.clone();
                async move {
                    if !agent.inner.droplets.is_empty() {
                        agent.send_heartbeat();
                    }
                }
            },
        ));

        let agent = self.clone();
        tasks.push(spawn_recurring("monitor", MONITOR_INTERVAL, shutdown(), move || {
            let agent = agent.clone();
            async move { agent.monitor_apps().await }
        }));

        let agent = self.clone();
        tasks.push(spawn_recurring(
            "crashes_reaper",
            CRASHES_REAPER_INTERVAL,
            shutdown(),
            move || {
                let agent = agent.clone();
                async move { agent.reap_crashes(CRASHES_REAPER_TIMEOUT).await }
            },
        ));

        if !self.inner.config.disable_dir_cleanup {
            let agent = self.clone();
            tasks.push(spawn_recurring(
                "cache_cleanup",
                CACHE_CLEANUP_INTERVAL,
                shutdown(),
                move || {
                    let agent = agent.clone();
                    async move {
                        agent.inner.stager.clean_cache_directory().await;
                    }
                },
            ));
        }

        let droplets = self.inner.droplets.clone();
        tasks.push(spawn_recurring("snapshot", SNAPSHOT_INTERVAL, shutdown(), move || {
            let droplets = droplets.clone();
            async move {
                droplets.schedule_snapshot_app_state();
            }
        }));
    }

    /// Reload the snapshot and account for every instance it lists.
    ///
    /// Recovered instances are orphans: this run did not launch them, so
    /// they are stopped through the launcher rather than a domain.
    fn recover_existing_droplets(&self) {
        let path = self.inner.droplets.snapshot_file();
        let recovered = match DropletCollection::load_snapshot(path) {
            Ok(recovered) => recovered,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Ignoring unreadable snapshot");
                return;
            }
        };
        if recovered.is_empty() {
            return;
        }

        for mut props in recovered {
            props.orphaned = true;
            props.resources_tracked = false;
            props.stop_processed = false;
            let instance = Arc::new(DropletInstance::new(props));
            self.inner.monitor.add_instance_resources(&instance);
            self.inner.droplets.add_instance(instance.clone());
            self.recheck_starting(&instance);
        }

        info!(
            instances = self.inner.droplets.instance_count(),
            reserved_memory_mb = self.inner.monitor.reserved_memory_mb(),
            "Recovered instances from snapshot"
        );
        self.inner.droplets.schedule_snapshot_app_state();
    }

    /// An instance caught mid-start by the restart is RUNNING if its
    /// process survived, CRASHED otherwise.
    fn recheck_starting(&self, instance: &DropletInstance) {
        let mut data = instance.write();
        if data.properties.state != InstanceState::Starting {
            return;
        }
        let alive = data
            .properties
            .pid
            .is_some_and(|pid| self.inner.launcher.is_alive(pid));
        if alive {
            let _ = data.set_state(InstanceState::Running);
        } else {
            data.mark_crashed();
        }
        debug!(
            instance_id = %instance.instance_id(),
            state = %data.properties.state,
            "Rechecked recovered instance"
        );
    }

    /// Remove directories under `apps/` that no known instance owns.
    fn delete_untracked_instance_dirs(&self) {
        if self.inner.config.disable_dir_cleanup {
            return;
        }

        let mut tracked = HashSet::new();
        self.inner.droplets.for_each(TraversalMode::Read, |instance| {
            tracked.insert(instance.read().properties.staged.clone());
        });

        let apps_dir = self.inner.config.apps_dir();
        let entries = match fs::read_dir(&apps_dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(dir = %apps_dir.display(), error = %e, "Cannot list apps directory");
                return;
            }
        };
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if tracked.contains(&name) {
                continue;
            }
            match fs::remove_dir_all(entry.path()) {
                Ok(()) => info!(dir = %name, "Removed untracked instance directory"),
                Err(e) => warn!(dir = %name, error = %e, "Failed to remove untracked directory"),
            }
        }
    }

    /// Publish evacuation notices for every instance, then shut down after
    /// the configured delay.
    pub async fn evacuate(&self) {
        if !self.transition(&[AgentState::Running], AgentState::Evacuating) {
            return;
        }
        info!("Evacuating applications");

        for instance in self.inner.droplets.instances() {
            let mut data = instance.write();
            if data.properties.state == InstanceState::Crashed || data.properties.notified {
                continue;
            }
            data.record_exit_reason(ExitReason::DeaEvacuation);
            if let Err(e) = self
                .inner
                .reactor
                .send_droplet_exited(&data.generate_droplet_exited_message())
            {
                warn!(instance_id = %instance.instance_id(), error = %e, "Failed to publish exit");
            }
            data.properties.notified = true;
            data.properties.evacuated = true;
        }
        self.snapshot_now().await;

        info!(
            delay_secs = self.inner.config.evacuation_delay.as_secs(),
            "Scheduling shutdown after evacuation"
        );
        tokio::time::sleep(self.inner.config.evacuation_delay).await;
        self.shutdown().await;
    }

    /// Stop every instance, wait (bounded) for them to go away, write a
    /// final snapshot and cancel all timers.
    pub async fn shutdown(&self) {
        if !self.transition(
            &[
                AgentState::Initializing,
                AgentState::Running,
                AgentState::Evacuating,
            ],
            AgentState::ShuttingDown,
        ) {
            return;
        }
        info!("Shutting down");

        for instance in self.inner.droplets.instances() {
            {
                let mut data = instance.write();
                if data.properties.state == InstanceState::Crashed {
                    continue;
                }
                data.record_exit_reason(ExitReason::DeaShutdown);
            }
            self.stop_droplet(&instance).await;
        }

        let deadline = Instant::now() + self.inner.config.shutdown_timeout;
        while !self.inner.droplets.no_monitorable_apps() {
            if Instant::now() >= deadline {
                warn!("Timed out waiting for instances to stop");
                break;
            }
            tokio::time::sleep(SHUTDOWN_POLL).await;
        }

        self.snapshot_now().await;
        self.inner.shutdown_tx.send_replace(true);
        let tasks: Vec<_> = self.inner.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }

        self.transition(&[AgentState::ShuttingDown], AgentState::Stopped);
        info!(
            uptime = %format_uptime(self.inner.started.elapsed()),
            "Shutdown complete"
        );
    }

    fn transition(&self, from: &[AgentState], to: AgentState) -> bool {
        let changed = self.inner.state_tx.send_if_modified(|state| {
            if from.contains(state) {
                *state = to;
                true
            } else {
                false
            }
        });
        if changed {
            debug!(state = ?to, "Agent state changed");
        }
        changed
    }

    /// New work is accepted only while running.
    fn accepting(&self) -> bool {
        self.state() == AgentState::Running
    }

    async fn snapshot_now(&self) {
        let droplets = self.inner.droplets.clone();
        match tokio::task::spawn_blocking(move || droplets.snapshot_app_state()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "Snapshot failed"),
            Err(e) => warn!(error = %e, "Snapshot task failed"),
        }
    }

    fn send_heartbeat(&self) {
        let heartbeat = self.inner.droplets.generate_heartbeat_message();
        if let Err(e) = self.inner.reactor.send_dea_heartbeat(&heartbeat) {
            warn!(error = %e, "Failed to publish heartbeat");
        }
    }

    fn send_instance_heartbeat(&self, instance: &DropletInstance) {
        let heartbeat = HeartbeatMessage {
            droplets: vec![instance.generate_instance_heartbeat()],
        };
        if let Err(e) = self.inner.reactor.send_dea_heartbeat(&heartbeat) {
            warn!(instance_id = %instance.instance_id(), error = %e, "Failed to publish heartbeat");
        }
    }

    fn hello(&self) -> HelloMessage {
        HelloMessage {
            id: self.inner.config.node_id,
            ip: self.inner.config.host.clone(),
            port: self.inner.config.filer_port,
            version: VERSION.to_string(),
        }
    }

    fn component_announcement(&self) -> ComponentAnnouncement {
        ComponentAnnouncement {
            kind: "DEA".to_string(),
            index: 0,
            uuid: self.inner.config.node_id,
            host: format!("{}:{}", self.inner.config.host, self.inner.config.filer_port),
            start: self.inner.started_at.to_rfc3339(),
            uptime: format_uptime(self.inner.started.elapsed()),
        }
    }

    /// Route registration for an instance, if it has a port and uris.
    fn route_for(&self, props: &DropletInstanceProperties, uris: Vec<String>) -> Option<RouterMessage> {
        let port = props.port?;
        if uris.is_empty() {
            return None;
        }
        Some(RouterMessage {
            dea: self.inner.config.node_id,
            host: self.inner.config.host.clone(),
            port,
            uris,
            tags: RouterTags {
                framework: props.framework.clone(),
                runtime: props.runtime.clone(),
            },
        })
    }

    fn file_uri(&self) -> String {
        format!(
            "http://{}:{}/droplets/",
            self.inner.config.host, self.inner.config.filer_port
        )
    }

    fn file_credentials(&self) -> Option<Vec<String>> {
        self.inner
            .config
            .filer_credentials
            .as_ref()
            .map(|(user, password)| vec![user.clone(), password.clone()])
    }
}
