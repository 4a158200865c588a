//! Inbound bus handlers.
//!
//! Messages arrive in no particular order across subjects, so every handler
//! checks instance state before acting and tolerates repeats.

use std::net::TcpListener;

use anyhow::{Context, Result};
use async_trait::async_trait;
use dea_messages::{
    decode, DeaStatusResponse, DiscoverRequest, DropletFilter, ExitReason, InstanceState,
    StartRequest, UpdateRequest,
};
use tracing::{debug, info, warn};

use super::lifecycle::StartPlan;
use super::{Agent, AgentState};
use crate::bus::BusMessage;
use crate::droplet::{DropletInstanceProperties, TraversalMode};
use crate::environment::build_environment;
use crate::reactor::{DeaEvent, DeaHandler};
use crate::stager::{instance_dir_name, is_sha1_digest};

#[async_trait]
impl DeaHandler for Agent {
    async fn handle(&self, event: DeaEvent, message: BusMessage) {
        let result = match event {
            DeaEvent::DeaStatus => self.handle_dea_status(&message),
            DeaEvent::DropletStatus => self.handle_droplet_status(&message),
            DeaEvent::DeaDiscover => self.handle_dea_discover(&message).await,
            DeaEvent::FindDroplet => self.handle_find_droplet(&message),
            DeaEvent::DeaUpdate => self.handle_dea_update(&message),
            DeaEvent::DeaStop => self.handle_dea_stop(&message).await,
            DeaEvent::InstanceStart => self.handle_instance_start(&message),
            DeaEvent::RouterStart => {
                self.register_all_routes();
                Ok(())
            }
            DeaEvent::HealthManagerStart => {
                self.send_heartbeat();
                Ok(())
            }
            DeaEvent::ComponentDiscover => self.handle_component_discover(&message),
        };

        if let Err(e) = result {
            warn!(
                ?event,
                subject = %message.subject,
                error = %format!("{e:#}"),
                "Handler failed"
            );
        }
    }
}

impl Agent {
    fn handle_dea_status(&self, message: &BusMessage) -> Result<()> {
        let Some(reply) = &message.reply else {
            return Ok(());
        };

        let monitor = &self.inner.monitor;
        let stats = monitor.stats();
        let shutting_down = matches!(
            self.state(),
            AgentState::ShuttingDown | AgentState::Stopped
        );
        let status = DeaStatusResponse {
            hello: self.hello(),
            max_memory: monitor.max_memory_mb(),
            reserved_memory: stats.reserved_memory_mb,
            used_memory: stats.memory_usage_kb,
            num_clients: stats.clients,
            state: shutting_down.then(|| "SHUTTING_DOWN".to_string()),
        };
        self.inner.reactor.send_reply(reply, &status)?;
        Ok(())
    }

    fn handle_droplet_status(&self, message: &BusMessage) -> Result<()> {
        let Some(reply) = &message.reply else {
            return Ok(());
        };

        let host = &self.inner.config.host;
        let mut statuses = Vec::new();
        self.inner.droplets.for_each(TraversalMode::Read, |instance| {
            let data = instance.read();
            if data.properties.state.is_monitorable() {
                statuses.push(data.generate_droplet_status_message(host));
            }
        });
        for status in statuses {
            self.inner.reactor.send_reply(reply, &status)?;
        }
        Ok(())
    }

    /// Answer a placement query, later the fuller this node is.
    async fn handle_dea_discover(&self, message: &BusMessage) -> Result<()> {
        if !self.accepting() {
            return Ok(());
        }
        let Some(reply) = message.reply.clone() else {
            return Ok(());
        };
        let request: DiscoverRequest = decode(&message.subject, &message.payload)?;

        let monitor = &self.inner.monitor;
        if monitor.clients() >= monitor.max_clients() {
            debug!("Ignoring discover, client limit reached");
            return Ok(());
        }
        if !self.inner.runtimes.runtime_supported(&request.runtime) {
            debug!(runtime = %request.runtime, "Ignoring discover, runtime not supported");
            return Ok(());
        }
        if !monitor.has_room_for(request.limits.mem) {
            debug!(mem_mb = request.limits.mem, "Ignoring discover, not enough memory");
            return Ok(());
        }

        let running = self.inner.droplets.instances_of(&request.droplet).len();
        let taint = monitor.discover_taint(running);
        debug!(
            droplet_id = %request.droplet,
            taint_ms = taint.as_millis() as u64,
            "Answering discover"
        );
        tokio::time::sleep(taint).await;

        self.inner.reactor.send_reply(&reply, &self.hello())?;
        Ok(())
    }

    fn handle_find_droplet(&self, message: &BusMessage) -> Result<()> {
        let Some(reply) = &message.reply else {
            return Ok(());
        };
        let filter: DropletFilter = decode(&message.subject, &message.payload)?;

        let node_id = self.inner.config.node_id;
        let host = &self.inner.config.host;
        let file_uri = self.file_uri();
        let credentials = self.file_credentials();

        let mut responses = Vec::new();
        for instance in self.inner.droplets.instances_of(&filter.droplet) {
            let data = instance.read();
            let props = &data.properties;
            if !filter.matches(
                &props.version,
                &props.instance_id.to_string(),
                props.instance_index,
                props.state,
            ) {
                continue;
            }
            let stats = (filter.include_stats && props.state == InstanceState::Running)
                .then(|| data.generate_droplet_status_message(host));
            responses.push(data.generate_find_droplet_response(
                node_id,
                &file_uri,
                credentials.clone(),
                stats,
            ));
        }

        for response in responses {
            self.inner.reactor.send_reply(reply, &response)?;
        }
        Ok(())
    }

    fn handle_dea_update(&self, message: &BusMessage) -> Result<()> {
        let update: UpdateRequest = decode(&message.subject, &message.payload)?;

        let mut changed = false;
        for instance in self.inner.droplets.instances_of(&update.droplet) {
            let (removed, added) = {
                let mut data = instance.write();
                if data.properties.state != InstanceState::Running {
                    continue;
                }
                let current = data.properties.uris.clone();
                let removed: Vec<String> = current
                    .iter()
                    .filter(|uri| !update.uris.contains(uri))
                    .cloned()
                    .collect();
                let added: Vec<String> = update
                    .uris
                    .iter()
                    .filter(|uri| !current.contains(uri))
                    .cloned()
                    .collect();
                data.properties.uris = update.uris.clone();
                (
                    self.route_for(&data.properties, removed),
                    self.route_for(&data.properties, added),
                )
            };

            if let Some(route) = removed {
                self.inner.reactor.send_router_unregister(&route)?;
            }
            if let Some(route) = added {
                self.inner.reactor.send_router_register(&route)?;
            }
            changed = true;
        }

        if changed {
            info!(droplet_id = %update.droplet, uris = ?update.uris, "Updated routes");
            self.inner.droplets.schedule_snapshot_app_state();
        }
        Ok(())
    }

    async fn handle_dea_stop(&self, message: &BusMessage) -> Result<()> {
        let filter: DropletFilter = decode(&message.subject, &message.payload)?;

        for instance in self.inner.droplets.instances_of(&filter.droplet) {
            {
                let mut data = instance.write();
                let state = data.properties.state;
                let selected = filter.matches(
                    &data.properties.version,
                    &data.properties.instance_id.to_string(),
                    data.properties.instance_index,
                    state,
                );
                if !selected {
                    continue;
                }
                match state {
                    InstanceState::Starting | InstanceState::Running => {
                        data.record_exit_reason(ExitReason::Stopped);
                    }
                    InstanceState::Crashed => {
                        let _ = data.set_state(InstanceState::Deleted);
                    }
                    InstanceState::Stopped | InstanceState::Deleted => {}
                }
            }
            info!(
                droplet_id = %filter.droplet,
                instance_id = %instance.instance_id(),
                "Stop requested"
            );
            self.stop_droplet(&instance).await;
        }
        Ok(())
    }

    /// Admit, register and hand off to the start task.
    fn handle_instance_start(&self, message: &BusMessage) -> Result<()> {
        if !self.accepting() {
            info!("Ignoring start request, agent is not running");
            return Ok(());
        }
        let request: StartRequest = decode(&message.subject, &message.payload)?;
        let inner = &self.inner;

        if !inner.monitor.has_room_for(request.limits.mem) {
            info!(
                droplet_id = %request.droplet,
                mem_mb = request.limits.mem,
                reserved_memory_mb = inner.monitor.reserved_memory_mb(),
                clients = inner.monitor.clients(),
                "Not enough resources to start instance"
            );
            return Ok(());
        }

        let (Some(sha1), Some(bits_file), Some(bits_uri)) = (
            request.sha1.clone(),
            request.executable_file.clone(),
            request.executable_uri.clone(),
        ) else {
            warn!(droplet_id = %request.droplet, "Start request is missing droplet bits");
            return Ok(());
        };
        if !is_sha1_digest(&sha1) {
            warn!(droplet_id = %request.droplet, sha1 = %sha1, "Start request has a malformed digest");
            return Ok(());
        }
        if !request.limits.is_addressable() {
            warn!(
                droplet_id = %request.droplet,
                mem_mb = request.limits.mem,
                disk_mb = request.limits.disk,
                "Start request limits are out of range"
            );
            return Ok(());
        }
        if !inner.runtimes.runtime_supported(&request.runtime) {
            warn!(
                droplet_id = %request.droplet,
                runtime = %request.runtime,
                "Start request for unsupported runtime"
            );
            return Ok(());
        }

        let port = allocate_port().context("failed to allocate port")?;
        let debug_port = match request.debug {
            Some(_) => Some(allocate_port().context("failed to allocate debug port")?),
            None => None,
        };

        let mut props = DropletInstanceProperties::from_start_request(&request);
        props.port = Some(port);
        if debug_port.is_some() {
            props.debug_port = debug_port;
            props.debug_ip = Some(inner.config.host.clone());
        }
        props.staged = instance_dir_name(&props.name, props.instance_index, props.instance_id);
        props.dir = inner.config.apps_dir().join(&props.staged);

        let environment = build_environment(
            &props,
            &inner.runtimes,
            &inner.config.host,
            &request.env,
            &request.services,
        );
        props.environment_variables = environment.iter().cloned().collect();

        // Another start may have taken the room since the check above.
        if !inner.monitor.try_add_tracked_resources(&mut props) {
            info!(
                droplet_id = %request.droplet,
                mem_mb = request.limits.mem,
                "Resources taken by a concurrent start"
            );
            return Ok(());
        }
        let instance = inner.droplets.insert(props);

        info!(
            droplet_id = %request.droplet,
            instance_id = %instance.instance_id(),
            index = request.index,
            name = %request.name,
            port,
            "Starting instance"
        );

        let plan = StartPlan {
            bits_file: bits_file.into(),
            bits_uri,
            sha1,
            environment,
        };
        tokio::spawn(self.clone().run_start(instance, plan));
        Ok(())
    }

    fn handle_component_discover(&self, message: &BusMessage) -> Result<()> {
        let Some(reply) = &message.reply else {
            return Ok(());
        };
        self.inner
            .reactor
            .send_reply(reply, &self.component_announcement())?;
        Ok(())
    }

    fn register_all_routes(&self) {
        let mut routes = Vec::new();
        self.inner.droplets.for_each(TraversalMode::Read, |instance| {
            let data = instance.read();
            if data.properties.state == InstanceState::Running {
                let uris = data.properties.uris.clone();
                routes.extend(self.route_for(&data.properties, uris));
            }
        });
        for route in routes {
            if let Err(e) = self.inner.reactor.send_router_register(&route) {
                warn!(error = %e, "Failed to register routes");
            }
        }
    }
}

/// Reserve an ephemeral port by binding and releasing it.
fn allocate_port() -> std::io::Result<u16> {
    let listener = TcpListener::bind(("0.0.0.0", 0))?;
    Ok(listener.local_addr()?.port())
}
