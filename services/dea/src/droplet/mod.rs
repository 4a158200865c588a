//! Registry of every instance known to this node.
//!
//! ```text
//! DropletCollection (collection lock)
//! └── Droplet (by droplet id)
//!     └── DropletInstance (instance lock)
//!         ├── DropletInstanceProperties
//!         └── usage samples (ring buffer)
//! ```
//!
//! Locks are acquired outermost first: collection, then instance, then the
//! monitor's counters. Never take the collection lock while holding an
//! instance lock.

mod collection;
mod instance;
mod properties;

pub use collection::{Droplet, DropletCollection, SnapshotError, TraversalMode};
pub use instance::{DropletInstance, InstanceData, InstanceError, MAX_USAGE_SAMPLES};
pub use properties::DropletInstanceProperties;
