//! DEA execution agent.
//!
//! One agent runs per host. It takes placement and lifecycle commands from
//! the control plane over a publish/subscribe bus, stages application
//! droplets, launches and supervises their instances, and reports
//! heartbeats and status back.
//!
//! ## Architecture
//!
//! ```text
//! Agent
//! ├── DeaReactor         (bus subscriptions and publishing)
//! ├── DropletCollection  (instance registry and snapshot)
//! ├── Monitor            (admission accounting and usage sampling)
//! ├── Stager             (fetch, verify and unpack droplets)
//! └── ExecutionDomain    (isolated instance control)
//! ```
//!
//! ## Modules
//!
//! - `agent`: orchestration, bus handlers and timers
//! - `bus`: message bus capability and the in-process `LocalBus`
//! - `droplet`: instance state, registry and snapshot
//! - `domain`: isolated execution domains
//! - `launcher`: process launch and liveness
//! - `monitor`: resource accounting
//! - `stager`: droplet staging
//! - `runtimes`: language runtime probing

pub mod agent;
pub mod bus;
pub mod config;
pub mod domain;
pub mod droplet;
pub mod environment;
pub mod launcher;
pub mod monitor;
pub mod reactor;
pub mod runtimes;
pub mod stager;
pub mod timers;

pub use agent::{Agent, AgentState};
pub use bus::{BusError, BusMessage, LocalBus, MessageBus};
pub use config::Config;
pub use domain::{ExecutionDomain, TaskDomainHost};
pub use droplet::{DropletCollection, DropletInstance, DropletInstanceProperties};
pub use launcher::{InstanceLauncher, MockLauncher, ProcessLauncher};
pub use monitor::Monitor;
pub use stager::Stager;
