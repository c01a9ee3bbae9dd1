use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use tracing::Level;
use tracing_appender::non_blocking::{ErrorCounter, WorkerGuard};
use tracing_subscriber::{filter::filter_fn, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// There is currently exactly one binary in this workspace, but the enum
/// keeps the logging setup shaped the way a multi-process workspace would
/// need it.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessKind {
    Controller,
}

impl ProcessKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ProcessKind::Controller => "controller",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LoggingInitInfo {
    pub process: String,
    pub logs_dir: String,
    pub prefix: String,
    pub retention_days: u64,
    pub initialized_at_ms: u64,
}

/// A single structured line written to the audit log: its own
/// daily-rotated JSONL sink under `logs_dir/audit/`, kept separate from
/// the general process log by routing on `target: "relay.audit"`.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent<'a> {
    pub event: &'a str,
    pub task_id: Option<&'a str>,
    pub agent_id: Option<&'a str>,
    pub command_index: Option<usize>,
    pub status: Option<&'a str>,
    pub detail: Option<&'a str>,
}

pub fn redact_text(input: &str) -> String {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    format!("[redacted len={} sha256={}]", trimmed.len(), short_hash(trimmed))
}

pub fn short_hash(input: &str) -> String {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    input.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

pub fn record_audit_event(level: Level, event: AuditEvent<'_>) {
    match level {
        Level::ERROR => tracing::error!(
            target: "relay.audit",
            event = event.event,
            task_id = event.task_id.unwrap_or(""),
            agent_id = event.agent_id.unwrap_or(""),
            command_index = event.command_index.map(|i| i as i64).unwrap_or(-1),
            status = event.status.unwrap_or(""),
            detail = event.detail.unwrap_or(""),
            "audit_event"
        ),
        Level::WARN => tracing::warn!(
            target: "relay.audit",
            event = event.event,
            task_id = event.task_id.unwrap_or(""),
            agent_id = event.agent_id.unwrap_or(""),
            command_index = event.command_index.map(|i| i as i64).unwrap_or(-1),
            status = event.status.unwrap_or(""),
            detail = event.detail.unwrap_or(""),
            "audit_event"
        ),
        _ => tracing::info!(
            target: "relay.audit",
            event = event.event,
            task_id = event.task_id.unwrap_or(""),
            agent_id = event.agent_id.unwrap_or(""),
            command_index = event.command_index.map(|i| i as i64).unwrap_or(-1),
            status = event.status.unwrap_or(""),
            detail = event.detail.unwrap_or(""),
            "audit_event"
        ),
    }
}

/// Bundles the `WorkerGuard`s for both rotated sinks. Both must be held
/// for the process lifetime — dropping either stops that sink's
/// background flush thread.
pub struct LoggingGuards {
    pub general: WorkerGuard,
    pub audit: WorkerGuard,
}

/// Exposes the audit sink's write-failure count (spec.md: surfaced at
/// `/health`), backed by the `ErrorCounter` `tracing-appender`'s
/// non-blocking writer already tracks — no need to hand-roll one.
#[derive(Debug, Clone, Default)]
pub struct AuditWriteFailures(Option<ErrorCounter>);

impl AuditWriteFailures {
    pub fn count(&self) -> u64 {
        self.0.as_ref().map_or(0, |c| c.get())
    }
}

impl From<ErrorCounter> for AuditWriteFailures {
    fn from(counter: ErrorCounter) -> Self {
        Self(Some(counter))
    }
}

/// Initializes the global `tracing` subscriber: a compact console layer,
/// a daily-rotated JSON file layer under `logs_dir` for general process
/// output, and a second daily-rotated JSON file layer under
/// `logs_dir/audit/` carrying only `target: "relay.audit"` events.
/// `default_level` seeds the `EnvFilter` when `RUST_LOG`/`LOG_LEVEL`
/// (via `Config::log_level`) isn't already an `EnvFilter`-shaped value.
pub fn init_process_logging(
    process: ProcessKind,
    logs_dir: &Path,
    retention_days: u64,
    default_level: &str,
) -> anyhow::Result<(LoggingGuards, LoggingInitInfo, AuditWriteFailures)> {
    fs::create_dir_all(logs_dir)?;
    cleanup_old_jsonl(logs_dir, &format!("relay.{}.", process.as_str()), retention_days)?;

    let audit_dir = logs_dir.join("audit");
    fs::create_dir_all(&audit_dir)?;
    cleanup_old_jsonl(&audit_dir, "relaymesh.audit.", retention_days)?;

    let file_appender = tracing_appender::rolling::Builder::new()
        .rotation(tracing_appender::rolling::Rotation::DAILY)
        .filename_prefix(format!("relay.{}", process.as_str()))
        .filename_suffix("jsonl")
        .build(logs_dir)?;
    let (file_non_blocking, general_guard) = tracing_appender::non_blocking(file_appender);

    let audit_appender = tracing_appender::rolling::Builder::new()
        .rotation(tracing_appender::rolling::Rotation::DAILY)
        .filename_prefix("relaymesh.audit")
        .filename_suffix("jsonl")
        .build(&audit_dir)?;
    let (audit_non_blocking, audit_guard) = tracing_appender::non_blocking(audit_appender);
    let audit_write_failures: AuditWriteFailures = audit_non_blocking.error_counter().into();

    let is_audit = |meta: &tracing::Metadata<'_>| meta.target() == "relay.audit";

    let file_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(file_non_blocking)
        .with_ansi(false)
        .with_current_span(false)
        .with_span_list(false)
        .with_filter(filter_fn(move |meta| !is_audit(meta)));

    let console_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_target(true)
        .with_ansi(true)
        .with_filter(filter_fn(move |meta| !is_audit(meta)));

    let audit_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(audit_non_blocking)
        .with_ansi(false)
        .with_current_span(false)
        .with_span_list(false)
        .with_filter(filter_fn(is_audit));

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .with(audit_layer)
        .try_init()
        .ok();

    let info = LoggingInitInfo {
        process: process.as_str().to_string(),
        logs_dir: logs_dir.display().to_string(),
        prefix: format!("relay.{}", process.as_str()),
        retention_days,
        initialized_at_ms: now_ms(),
    };

    Ok((
        LoggingGuards { general: general_guard, audit: audit_guard },
        info,
        audit_write_failures,
    ))
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn cleanup_old_jsonl(logs_dir: &Path, prefix: &str, retention_days: u64) -> anyhow::Result<()> {
    let cutoff = Utc::now() - chrono::Duration::days(retention_days as i64);

    for entry in fs::read_dir(logs_dir)? {
        let Ok(entry) = entry else { continue };
        let path = entry.path();
        if !path.is_file() {
            continue;
        }

        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };

        if !name.starts_with(prefix) || !name.ends_with(".jsonl") {
            continue;
        }

        let date_part = name.trim_start_matches(prefix).trim_end_matches(".jsonl");

        let Ok(date) = NaiveDate::parse_from_str(date_part, "%Y-%m-%d") else {
            continue;
        };

        let Some(dt) = date.and_hms_opt(0, 0, 0) else {
            continue;
        };

        if DateTime::<Utc>::from_naive_utc_and_offset(dt, Utc) < cutoff {
            let _ = fs::remove_file(path);
        }
    }

    Ok(())
}

pub fn canonical_logs_dir_from_root(root: &Path) -> PathBuf {
    root.join("logs")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redact_text_masks_content() {
        let raw = "super-secret-token-123";
        let redacted = redact_text(raw);
        assert!(redacted.contains("[redacted len="));
        assert!(!redacted.contains("super-secret-token-123"));
    }

    #[test]
    fn canonical_logs_dir_joins_logs_folder() {
        let root = PathBuf::from("/tmp/relaymesh");
        let logs = canonical_logs_dir_from_root(&root);
        assert_eq!(logs, PathBuf::from("/tmp/relaymesh").join("logs"));
    }

    #[test]
    fn audit_write_failures_defaults_to_zero() {
        assert_eq!(AuditWriteFailures::default().count(), 0);
    }
}
