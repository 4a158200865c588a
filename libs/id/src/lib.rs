//! # dea-id
//!
//! Typed identifiers used by the DEA execution agent.
//!
//! ## ID Format
//!
//! Identifiers minted by the agent use a prefixed format: `{prefix}_{ulid}`
//!
//! Examples:
//! - `inst_01HV4Z4NYPLTRS0JTUA8XDME5F` (an application instance)
//! - `dea_01HV4Z2WQXKJNM8GPQY6VBKC3D` (this agent on the bus)
//! - `dom_01HV4Z3MXNKPQR9HSTZ7WCLD4E` (an isolated execution domain)
//!
//! Droplet ids are assigned by the control plane and are opaque to the
//! agent, so [`DropletId`] is a plain string newtype rather than a ULID.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
