use std::collections::HashMap;

use serde::{Deserialize, Serialize};

pub const DEFAULT_TIMEOUT_SECONDS: u32 = 300;
pub const MIN_TIMEOUT_SECONDS: u32 = 1;
pub const MAX_TIMEOUT_SECONDS: u32 = 3600;

/// A single immutable shell step within a `Plan`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub dir: String,
    pub run: String,
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u32,
    #[serde(default)]
    pub continue_on_error: bool,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

fn default_timeout() -> u32 {
    DEFAULT_TIMEOUT_SECONDS
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum CommandValidationError {
    #[error("timeout_seconds must be in [{MIN_TIMEOUT_SECONDS}, {MAX_TIMEOUT_SECONDS}], got {0}")]
    TimeoutOutOfRange(u32),
    #[error("run must not be empty")]
    EmptyRun,
}

impl Command {
    pub fn new(dir: impl Into<String>, run: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            run: run.into(),
            timeout_seconds: DEFAULT_TIMEOUT_SECONDS,
            continue_on_error: false,
            env: HashMap::new(),
        }
    }

    /// Clamp an externally-supplied timeout into the legal range, per
    /// spec.md §3 ("clamped to [1, 3600]"). `0` is rejected outright by
    /// callers that enforce spec.md §8's boundary behavior
    /// (`timeout_seconds=0` is a `ValidationError`, not silently clamped).
    pub fn validate(&self) -> Result<(), CommandValidationError> {
        if self.run.trim().is_empty() {
            return Err(CommandValidationError::EmptyRun);
        }
        if self.timeout_seconds == 0
            || self.timeout_seconds < MIN_TIMEOUT_SECONDS
            || self.timeout_seconds > MAX_TIMEOUT_SECONDS
        {
            return Err(CommandValidationError::TimeoutOutOfRange(
                self.timeout_seconds,
            ));
        }
        Ok(())
    }

    pub fn clamp_timeout(&mut self) {
        self.timeout_seconds = self
            .timeout_seconds
            .clamp(MIN_TIMEOUT_SECONDS, MAX_TIMEOUT_SECONDS);
    }
}

/// Outcome of running one `Command` on an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResult {
    pub command_index: usize,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    pub completed_at_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_timeout_is_rejected() {
        let mut cmd = Command::new(".", "uptime");
        cmd.timeout_seconds = 0;
        assert_eq!(
            cmd.validate(),
            Err(CommandValidationError::TimeoutOutOfRange(0))
        );
    }

    #[test]
    fn timeout_above_max_is_rejected() {
        let mut cmd = Command::new(".", "uptime");
        cmd.timeout_seconds = 999_999;
        assert!(cmd.validate().is_err());
    }

    #[test]
    fn clamp_pulls_oversized_timeout_back_into_range() {
        let mut cmd = Command::new(".", "uptime");
        cmd.timeout_seconds = 999_999;
        cmd.clamp_timeout();
        assert_eq!(cmd.timeout_seconds, MAX_TIMEOUT_SECONDS);
    }

    #[test]
    fn empty_run_is_rejected() {
        let cmd = Command::new(".", "   ");
        assert_eq!(cmd.validate(), Err(CommandValidationError::EmptyRun));
    }
}
