//! Instance lifecycle vocabulary.

use serde::{Deserialize, Serialize};

// =============================================================================
// Instance State
// =============================================================================

/// Lifecycle state of one instance.
///
/// ```text
/// STARTING -> RUNNING -> { STOPPED | CRASHED } -> DELETED
///     \_________________/^
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceState {
    Starting,
    Running,
    Stopped,
    Crashed,
    Deleted,
}

impl InstanceState {
    /// Returns true if `next` is a legal successor of this state.
    pub fn can_transition_to(self, next: InstanceState) -> bool {
        use InstanceState::*;
        matches!(
            (self, next),
            (Starting, Running)
                | (Starting, Crashed)
                | (Starting, Stopped)
                | (Running, Stopped)
                | (Running, Crashed)
                | (Stopped, Deleted)
                | (Crashed, Deleted)
        )
    }

    /// STARTING and RUNNING instances still own a live (or launching) process.
    pub fn is_monitorable(self) -> bool {
        matches!(self, InstanceState::Starting | InstanceState::Running)
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            InstanceState::Stopped | InstanceState::Crashed | InstanceState::Deleted
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            InstanceState::Starting => "STARTING",
            InstanceState::Running => "RUNNING",
            InstanceState::Stopped => "STOPPED",
            InstanceState::Crashed => "CRASHED",
            InstanceState::Deleted => "DELETED",
        }
    }
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Exit Reason
// =============================================================================

/// Why an instance left STARTING or RUNNING.
///
/// The absence of a reason (`None` on the owning field) is the wire `null`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExitReason {
    DeaEvacuation,
    DeaShutdown,
    Stopped,
    Crashed,
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExitReason::DeaEvacuation => "DEA_EVACUATION",
            ExitReason::DeaShutdown => "DEA_SHUTDOWN",
            ExitReason::Stopped => "STOPPED",
            ExitReason::Crashed => "CRASHED",
        };
        f.write_str(s)
    }
}

// =============================================================================
// Usage
// =============================================================================

/// One resource-usage sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct InstanceUsage {
    /// Resident memory in KB.
    pub mem: u64,
    /// CPU utilisation in percent since the previous sample.
    pub cpu: f32,
    /// Bytes used by the instance directory.
    pub disk: u64,
    /// Sample time, Unix seconds.
    pub time: i64,
}
