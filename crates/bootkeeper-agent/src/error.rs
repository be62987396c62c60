use bootkeeper_process::SlotId;

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("invalid slot: {0}")]
    InvalidSlot(SlotId),
    #[error("failed to start slot {slot}: {message}")]
    SpawnFailed { slot: SlotId, message: String },
    #[error("slot {0} is not running")]
    NotRunning(SlotId),
    #[error("failed to read output of slot {slot}: {source}")]
    ReadFailure {
        slot: SlotId,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid slot configuration: {0}")]
    Config(String),
}

impl SupervisorError {
    pub fn slot(&self) -> Option<SlotId> {
        match self {
            SupervisorError::InvalidSlot(slot)
            | SupervisorError::NotRunning(slot)
            | SupervisorError::SpawnFailed { slot, .. }
            | SupervisorError::ReadFailure { slot, .. } => Some(*slot),
            SupervisorError::Config(_) => None,
        }
    }
}

pub type Result<T, E = SupervisorError> = std::result::Result<T, E>;

/// Flattens an error and its causes into one line, skipping repeats.
pub(crate) fn format_error_chain(err: &anyhow::Error) -> String {
    let mut parts = Vec::<String>::new();
    for cause in err.chain() {
        let s = cause.to_string();
        if s.is_empty() {
            continue;
        }
        if parts.last() == Some(&s) {
            continue;
        }
        parts.push(s);
    }
    if parts.is_empty() {
        "unknown error".to_string()
    } else {
        parts.join(": ")
    }
}
