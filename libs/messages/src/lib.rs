//! # dea-messages
//!
//! Wire vocabulary of the DEA execution agent.
//!
//! Every bus message is a subject plus an opaque JSON body. This crate pins
//! down the subjects the agent subscribes to and publishes on, and gives
//! each body an explicitly mapped serde type so field names on the wire are
//! declared next to the struct that carries them.
//!
//! ## Payload groups
//!
//! - [`subjects`]: subject names, reproduced verbatim for the control plane
//! - [`state`]: instance state machine vocabulary and usage samples
//! - [`control`]: inbound commands (`dea.<id>.start`, `dea.stop`, ...)
//! - [`droplet`]: per-instance reports (heartbeat, exit, status, find)
//! - [`node`]: node-level messages (hello, status, router, component)

pub mod control;
pub mod droplet;
mod error;
pub mod node;
pub mod state;
pub mod subjects;

pub use control::*;
pub use droplet::*;
pub use error::MessageError;
pub use node::*;
pub use state::*;

use serde::{de::DeserializeOwned, Serialize};

/// Decodes a JSON payload received on `subject`.
pub fn decode<T: DeserializeOwned>(subject: &str, payload: &[u8]) -> Result<T, MessageError> {
    serde_json::from_slice(payload).map_err(|e| MessageError::Malformed {
        subject: subject.to_string(),
        reason: e.to_string(),
    })
}

/// Encodes a payload as JSON bytes.
pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>, MessageError> {
    serde_json::to_vec(message).map_err(MessageError::from)
}
