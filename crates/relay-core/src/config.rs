use std::env;
use std::path::PathBuf;

/// Process configuration, read once at startup from environment variables
/// (spec.md §6.7). The core carries no durable, layered config store of its
/// own — see DESIGN.md for why the teacher's file-backed `ConfigStore` was
/// not adopted here.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub agent_heartbeat_timeout_seconds: u64,
    pub task_retention_hours: u64,
    pub log_level: String,
    /// Root for the opportunistic task snapshot and logs (spec.md §1:
    /// "the core is in-memory, snapshotted opportunistically"). This is a
    /// forensics aid, not a durable queue: nothing reads it back on
    /// startup, matching the Non-goal that rules out persistent durable
    /// queues.
    pub state_dir: PathBuf,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            port: env_parsed("PORT", 8080),
            agent_heartbeat_timeout_seconds: env_parsed("AGENT_HEARTBEAT_TIMEOUT_SECONDS", 60),
            task_retention_hours: env_parsed("TASK_RETENTION_HOURS", 168),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            state_dir: env::var("RELAY_STATE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(".relaymesh")),
        }
    }
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}
