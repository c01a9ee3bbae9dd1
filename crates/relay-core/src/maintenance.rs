use std::path::PathBuf;
use std::time::Duration;

use relay_types::now_ms;

use crate::registry::AgentRegistry;
use crate::task_store::TaskStore;

/// Background timer that reaps agents whose heartbeat has gone stale
/// (spec.md §4.3). Runs until the process exits.
pub async fn run_heartbeat_reaper(registry: AgentRegistry, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        let reaped = registry.reap(now_ms()).await;
        if !reaped.is_empty() {
            tracing::info!(count = reaped.len(), agents = ?reaped, "reaped stale agents");
        }
    }
}

/// Background timer implementing the retention sweep (spec.md §9): prunes
/// tasks that have sat in a terminal status for longer than
/// `retention_hours`, in batches of at most 256 per tick.
pub async fn run_retention_sweep(tasks: TaskStore, retention_hours: u64, interval: Duration) {
    let max_age_ms = retention_hours.saturating_mul(3_600_000);
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        let pruned = tasks.prune_terminal_older_than(now_ms(), max_age_ms, 256).await;
        if pruned > 0 {
            tracing::info!(count = pruned, "pruned retired tasks past retention window");
        }
    }
}

/// Opportunistic snapshot (spec.md §1): periodically dumps the full task
/// list to `{state_dir}/tasks-snapshot.json`, written to a temp file and
/// renamed so a reader never observes a half-written snapshot. Best-effort:
/// a write failure is logged and the loop keeps running. Nothing in this
/// process reads the snapshot back — it exists for post-mortem inspection,
/// not for crash recovery, since durable queues are an explicit Non-goal.
pub async fn run_snapshot_sweep(tasks: TaskStore, state_dir: PathBuf, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        if let Err(err) = write_snapshot(&tasks, &state_dir).await {
            tracing::warn!(error = %err, "failed to write opportunistic task snapshot");
        }
    }
}

async fn write_snapshot(tasks: &TaskStore, state_dir: &std::path::Path) -> std::io::Result<()> {
    let snapshot = tasks.list(None, None).await;
    let body = serde_json::to_vec_pretty(&snapshot).unwrap_or_default();
    tokio::fs::create_dir_all(state_dir).await?;
    let final_path = state_dir.join("tasks-snapshot.json");
    let tmp_path = state_dir.join("tasks-snapshot.json.tmp");
    tokio::fs::write(&tmp_path, body).await?;
    tokio::fs::rename(&tmp_path, &final_path).await
}
