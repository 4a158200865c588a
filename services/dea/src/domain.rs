//! Isolated execution domains.
//!
//! Instance-management code runs behind a message-passing boundary: the
//! host creates a domain, talks to it only through [`DomainRequest`]
//! messages addressed by an opaque [`DomainHandle`], and destroys it when
//! the instance is reaped. Nothing mutable is shared across the boundary,
//! so a fault inside a domain surfaces as [`DomainError::Faulted`] instead
//! of taking the agent down.
//!
//! [`TaskDomainHost`] runs each domain as a dedicated tokio task with its
//! own mailbox, following the mailbox/reply pattern:
//!
//! ```text
//! Agent ──invoke──▶ mpsc mailbox ──▶ domain task ──▶ InstanceLauncher
//!   ▲                                   │
//!   └──────────── oneshot reply ◀───────┘
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dea_id::DomainId;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::launcher::{InstanceLauncher, LaunchError, LaunchRequest};

const MAILBOX_CAPACITY: usize = 16;
const DESTROY_TIMEOUT: Duration = Duration::from_secs(5);

// =============================================================================
// Messages
// =============================================================================

/// Instance-control requests accepted by a domain.
#[derive(Debug, Clone)]
pub enum DomainRequest {
    /// Launch the instance; replies [`DomainReply::Started`].
    Start(LaunchRequest),
    /// Stop the process; replies [`DomainReply::Stopped`].
    Stop { pid: u32 },
    /// Probe the process; replies [`DomainReply::Status`].
    Status { pid: u32 },
}

/// Replies sent back across the boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DomainReply {
    Started { pid: u32 },
    Stopped,
    Status { alive: bool },
}

/// Errors from domain operations.
#[derive(Debug, Error)]
pub enum DomainError {
    #[error("unknown domain {0}")]
    Unknown(DomainId),

    #[error("domain {0} faulted")]
    Faulted(DomainId),

    #[error(transparent)]
    Launch(#[from] LaunchError),
}

/// Opaque reference to a live domain.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DomainHandle {
    id: DomainId,
}

impl DomainHandle {
    pub fn id(&self) -> DomainId {
        self.id
    }

    /// Rebuild a handle from a stored id.
    pub fn from_id(id: DomainId) -> Self {
        Self { id }
    }
}

/// Capability to run instance control code out of the agent's fault domain.
#[async_trait]
pub trait ExecutionDomain: Send + Sync {
    async fn create_domain(&self) -> Result<DomainHandle, DomainError>;

    async fn invoke(
        &self,
        handle: &DomainHandle,
        request: DomainRequest,
    ) -> Result<DomainReply, DomainError>;

    async fn destroy_domain(&self, handle: DomainHandle) -> Result<(), DomainError>;
}

// =============================================================================
// Task Domain Host
// =============================================================================

struct Envelope {
    request: DomainRequest,
    reply_to: oneshot::Sender<Result<DomainReply, LaunchError>>,
}

struct DomainSlot {
    mailbox: mpsc::Sender<Envelope>,
    task: JoinHandle<()>,
}

/// Hosts each domain on its own tokio task.
pub struct TaskDomainHost {
    launcher: Arc<dyn InstanceLauncher>,
    domains: Mutex<HashMap<DomainId, DomainSlot>>,
}

impl TaskDomainHost {
    pub fn new(launcher: Arc<dyn InstanceLauncher>) -> Self {
        Self {
            launcher,
            domains: Mutex::new(HashMap::new()),
        }
    }

    pub fn domain_count(&self) -> usize {
        self.domains.lock().len()
    }
}

/// Body of one domain task.
async fn run_domain(
    id: DomainId,
    launcher: Arc<dyn InstanceLauncher>,
    mut mailbox: mpsc::Receiver<Envelope>,
) {
    debug!(domain_id = %id, "Domain started");

    while let Some(Envelope { request, reply_to }) = mailbox.recv().await {
        let reply = match request {
            DomainRequest::Start(request) => launcher
                .launch(&request)
                .await
                .map(|pid| DomainReply::Started { pid }),
            DomainRequest::Stop { pid } => {
                launcher.stop(pid).await.map(|()| DomainReply::Stopped)
            }
            DomainRequest::Status { pid } => Ok(DomainReply::Status {
                alive: launcher.is_alive(pid),
            }),
        };

        if reply_to.send(reply).is_err() {
            debug!(domain_id = %id, "Caller went away before reply");
        }
    }

    debug!(domain_id = %id, "Domain mailbox closed");
}

#[async_trait]
impl ExecutionDomain for TaskDomainHost {
    async fn create_domain(&self) -> Result<DomainHandle, DomainError> {
        let id = DomainId::new();
        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
        let task = tokio::spawn(run_domain(id, Arc::clone(&self.launcher), rx));

        self.domains
            .lock()
            .insert(id, DomainSlot { mailbox: tx, task });

        info!(domain_id = %id, "Execution domain created");
        Ok(DomainHandle { id })
    }

    async fn invoke(
        &self,
        handle: &DomainHandle,
        request: DomainRequest,
    ) -> Result<DomainReply, DomainError> {
        let mailbox = self
            .domains
            .lock()
            .get(&handle.id)
            .map(|slot| slot.mailbox.clone())
            .ok_or(DomainError::Unknown(handle.id))?;

        let (reply_to, reply) = oneshot::channel();
        mailbox
            .send(Envelope { request, reply_to })
            .await
            .map_err(|_| DomainError::Faulted(handle.id))?;

        // A dropped reply sender means the domain task died mid-request.
        let reply = reply.await.map_err(|_| DomainError::Faulted(handle.id))?;
        Ok(reply?)
    }

    async fn destroy_domain(&self, handle: DomainHandle) -> Result<(), DomainError> {
        let slot = self
            .domains
            .lock()
            .remove(&handle.id)
            .ok_or(DomainError::Unknown(handle.id))?;

        drop(slot.mailbox);
        let mut task = slot.task;
        match tokio::time::timeout(DESTROY_TIMEOUT, &mut task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) if e.is_panic() => {
                warn!(domain_id = %handle.id, "Domain had faulted before destroy");
            }
            Ok(Err(_)) => {}
            Err(_) => {
                warn!(domain_id = %handle.id, "Domain did not drain in time, aborting");
                task.abort();
            }
        }

        info!(domain_id = %handle.id, "Execution domain destroyed");
        Ok(())
    }
}
