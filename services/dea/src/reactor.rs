//! Binding between the control bus and the agent.
//!
//! The reactor owns every subscription the node holds. Each inbound
//! message is handed to the [`DeaHandler`] on its own task, so handlers run
//! concurrently and in no particular order across subjects.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dea_id::NodeId;
use dea_messages::{
    subjects, ComponentAnnouncement, DropletExited, HeartbeatMessage, HelloMessage,
    RouterMessage,
};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

use crate::bus::{BusError, BusMessage, MessageBus, Subscription};

/// Inbound message kinds, one per subscribed subject.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeaEvent {
    DeaStatus,
    DropletStatus,
    DeaDiscover,
    FindDroplet,
    DeaUpdate,
    DeaStop,
    /// `dea.<node-id>.start`.
    InstanceStart,
    RouterStart,
    HealthManagerStart,
    ComponentDiscover,
}

impl DeaEvent {
    pub const ALL: [DeaEvent; 10] = [
        DeaEvent::DeaStatus,
        DeaEvent::DropletStatus,
        DeaEvent::DeaDiscover,
        DeaEvent::FindDroplet,
        DeaEvent::DeaUpdate,
        DeaEvent::DeaStop,
        DeaEvent::InstanceStart,
        DeaEvent::RouterStart,
        DeaEvent::HealthManagerStart,
        DeaEvent::ComponentDiscover,
    ];

    pub fn subject(self, node_id: NodeId) -> String {
        match self {
            DeaEvent::DeaStatus => subjects::DEA_STATUS.to_string(),
            DeaEvent::DropletStatus => subjects::DROPLET_STATUS.to_string(),
            DeaEvent::DeaDiscover => subjects::DEA_DISCOVER.to_string(),
            DeaEvent::FindDroplet => subjects::DEA_FIND_DROPLET.to_string(),
            DeaEvent::DeaUpdate => subjects::DEA_UPDATE.to_string(),
            DeaEvent::DeaStop => subjects::DEA_STOP.to_string(),
            DeaEvent::InstanceStart => subjects::dea_instance_start(&node_id),
            DeaEvent::RouterStart => subjects::ROUTER_START.to_string(),
            DeaEvent::HealthManagerStart => subjects::HEALTHMANAGER_START.to_string(),
            DeaEvent::ComponentDiscover => subjects::COMPONENT_DISCOVER.to_string(),
        }
    }
}

/// Receiver of inbound bus events.
#[async_trait]
pub trait DeaHandler: Send + Sync + 'static {
    async fn handle(&self, event: DeaEvent, message: BusMessage);
}

/// Subscribes the node and publishes its outbound messages.
#[derive(Clone)]
pub struct DeaReactor {
    bus: Arc<dyn MessageBus>,
    node_id: NodeId,
}

impl DeaReactor {
    pub fn new(bus: Arc<dyn MessageBus>, node_id: NodeId) -> Self {
        Self { bus, node_id }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn bus(&self) -> &Arc<dyn MessageBus> {
        &self.bus
    }

    /// Subscribe every subject and dispatch until `shutdown` turns true.
    pub fn start(
        &self,
        handler: Arc<dyn DeaHandler>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Vec<JoinHandle<()>>, BusError> {
        let mut tasks = Vec::with_capacity(DeaEvent::ALL.len());
        for event in DeaEvent::ALL {
            let subscription = self.bus.subscribe(&event.subject(self.node_id))?;
            debug!(subject = %subscription.subject(), "Subscribed");
            tasks.push(tokio::spawn(dispatch(
                event,
                subscription,
                handler.clone(),
                shutdown.clone(),
            )));
        }
        info!(node_id = %self.node_id, subjects = tasks.len(), "Reactor started");
        Ok(tasks)
    }

    fn publish<T: Serialize>(&self, subject: &str, message: &T) -> Result<(), BusError> {
        let payload = Bytes::from(dea_messages::encode(message)?);
        trace!(subject, bytes = payload.len(), "Publishing");
        self.bus.publish(subject, None, payload)
    }

    pub fn send_dea_heartbeat(&self, heartbeat: &HeartbeatMessage) -> Result<(), BusError> {
        self.publish(subjects::DEA_HEARTBEAT, heartbeat)
    }

    pub fn send_dea_start(&self, hello: &HelloMessage) -> Result<(), BusError> {
        self.publish(subjects::DEA_START, hello)
    }

    pub fn send_droplet_exited(&self, exited: &DropletExited) -> Result<(), BusError> {
        self.publish(subjects::DROPLET_EXITED, exited)
    }

    pub fn send_router_register(&self, route: &RouterMessage) -> Result<(), BusError> {
        self.publish(subjects::ROUTER_REGISTER, route)
    }

    pub fn send_router_unregister(&self, route: &RouterMessage) -> Result<(), BusError> {
        self.publish(subjects::ROUTER_UNREGISTER, route)
    }

    pub fn send_component_announce(&self, component: &ComponentAnnouncement) -> Result<(), BusError> {
        self.publish(subjects::COMPONENT_ANNOUNCE, component)
    }

    /// Answer a request on its reply inbox.
    pub fn send_reply<T: Serialize>(&self, reply_to: &str, message: &T) -> Result<(), BusError> {
        self.publish(reply_to, message)
    }
}

async fn dispatch(
    event: DeaEvent,
    mut subscription: Subscription,
    handler: Arc<dyn DeaHandler>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            message = subscription.next() => {
                let Some(message) = message else {
                    debug!(?event, "Subscription closed");
                    return;
                };
                let handler = handler.clone();
                tokio::spawn(async move { handler.handle(event, message).await });
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}
