use std::time::Duration;

/// Lines retained per slot.
pub const OUTPUT_CAPACITY: usize = 100;
/// Lines replayed per slot to a newly connected observer.
pub const CONNECT_REPLAY_LINES: usize = 5;

const DEFAULT_STOP_GRACE_MS: u64 = 1000;
const DEFAULT_RESTART_DRAIN_MS: u64 = 1000;
const DEFAULT_POLL_INTERVAL_MS: u64 = 100;
const DEFAULT_AUTOSTART_DELAY_MS: u64 = 3000;
const DEFAULT_SHELL: &str = "bash";

pub(crate) fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
}

pub(crate) fn env_flag(name: &str) -> Option<bool> {
    let v = std::env::var(name).ok()?;
    match v.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn env_millis(name: &str, min: u64, max: u64, default: u64) -> Duration {
    Duration::from_millis(env_u64(name).map(|v| v.clamp(min, max)).unwrap_or(default))
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Timing and process knobs of the supervisor.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// How long `stop` waits after SIGINT before escalating to SIGKILL.
    pub stop_grace: Duration,
    /// Pause between stopping a running slot and respawning it in `start`.
    pub restart_drain: Duration,
    /// Idle wait of an output pump draining a process that already exited.
    pub poll_interval: Duration,
    pub autostart_delay: Duration,
    pub autostart_enabled: bool,
    /// Interpreter each slot's command line is handed to as `<shell> -c`.
    pub shell: String,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            stop_grace: Duration::from_millis(DEFAULT_STOP_GRACE_MS),
            restart_drain: Duration::from_millis(DEFAULT_RESTART_DRAIN_MS),
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            autostart_delay: Duration::from_millis(DEFAULT_AUTOSTART_DELAY_MS),
            autostart_enabled: true,
            shell: DEFAULT_SHELL.to_string(),
        }
    }
}

impl SupervisorConfig {
    pub fn from_env() -> Self {
        Self {
            stop_grace: env_millis("BOOTKEEPER_STOP_GRACE_MS", 100, 60_000, DEFAULT_STOP_GRACE_MS),
            restart_drain: env_millis(
                "BOOTKEEPER_RESTART_DRAIN_MS",
                0,
                60_000,
                DEFAULT_RESTART_DRAIN_MS,
            ),
            poll_interval: env_millis(
                "BOOTKEEPER_POLL_INTERVAL_MS",
                10,
                5000,
                DEFAULT_POLL_INTERVAL_MS,
            ),
            autostart_delay: env_millis(
                "BOOTKEEPER_AUTOSTART_DELAY_MS",
                0,
                10 * 60 * 1000,
                DEFAULT_AUTOSTART_DELAY_MS,
            ),
            autostart_enabled: env_flag("BOOTKEEPER_AUTOSTART").unwrap_or(true),
            shell: env_string("BOOTKEEPER_SHELL").unwrap_or_else(|| DEFAULT_SHELL.to_string()),
        }
    }
}
