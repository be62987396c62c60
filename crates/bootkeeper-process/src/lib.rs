use std::fmt;

use chrono::{DateTime, Utc};

/// Configured slot identifier (small positive integer).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[serde(transparent)]
pub struct SlotId(pub u32);

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for SlotId {
    fn from(v: u32) -> Self {
        Self(v)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct ObserverId(pub uuid::Uuid);

impl ObserverId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for ObserverId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ObserverId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Failed,
}

impl SlotState {
    pub fn is_running(self) -> bool {
        matches!(self, SlotState::Running)
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SlotStatus {
    pub id: SlotId,
    pub name: String,
    pub state: SlotState,
    pub pid: Option<u32>,
    pub pgid: Option<i32>,
    pub started_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub message: Option<String>,
}

/// Result of one slot inside a bulk start/stop.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SlotOutcome {
    Started,
    Stopped,
    Failed { reason: String },
}

impl SlotOutcome {
    pub fn is_ok(&self) -> bool {
        !matches!(self, SlotOutcome::Failed { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            SlotOutcome::Started => "started",
            SlotOutcome::Stopped => "stopped",
            SlotOutcome::Failed { .. } => "failed",
        }
    }
}

/// One captured line of a slot's merged stdout/stderr.
///
/// `seq` is the per-slot position in the output buffer. Replayed tail lines
/// carry the same `seq` they were stored with, so subscribers can drop live
/// duplicates of lines they already received on connect.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct OutputEvent {
    pub slot: SlotId,
    pub seq: u64,
    pub line: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ConnectionStatus {
    Connected {
        observer: ObserverId,
        timestamp: DateTime<Utc>,
    },
    Disconnected {
        observer: ObserverId,
        timestamp: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SupervisorEvent {
    Output(OutputEvent),
    Connection(ConnectionStatus),
}
