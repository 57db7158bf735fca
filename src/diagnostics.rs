//! Diagnostics for the shop POS core.
//!
//! Provides:
//! - **Logging setup**: console + daily rolling file under `{data_dir}/logs`
//! - **Build info**: version, build timestamp, git SHA, platform
//! - **Sync diagnostics**: queue backlog by operation type and the most
//!   recent dead letters, with secrets redacted

use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::sync::SyncEngine;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Maximum number of log files to retain.
pub const MAX_LOG_FILES: usize = 10;

/// Prefix of the rolling log files (`pos.YYYY-MM-DD`).
const LOG_FILE_PREFIX: &str = "pos";

/// Dead letters included in a diagnostics report.
const RECENT_DEAD_LETTERS: usize = 20;

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

pub fn get_log_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("logs")
}

/// Install the global subscriber: `RUST_LOG` or `info,shop_pos_lib=debug`,
/// written to stdout and to a daily rolling file.
///
/// The returned guard flushes the file writer on drop; the host keeps it
/// alive until exit.
pub fn init_logging(data_dir: &Path) -> Result<WorkerGuard, String> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,shop_pos_lib=debug"));

    let log_dir = get_log_dir(data_dir);
    fs::create_dir_all(&log_dir).map_err(|e| format!("create log dir: {e}"))?;
    prune_old_logs(&log_dir);

    let file_appender = tracing_appender::rolling::daily(&log_dir, LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true);
    let console_layer = fmt::layer().with_target(true);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| format!("install tracing subscriber: {e}"))?;

    Ok(guard)
}

/// Prune old log files, keeping only the most recent `MAX_LOG_FILES`.
pub fn prune_old_logs(log_dir: &Path) {
    if !log_dir.exists() {
        return;
    }

    let mut log_files: Vec<(PathBuf, std::time::SystemTime)> = Vec::new();
    if let Ok(entries) = fs::read_dir(log_dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let is_log = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|name| name.starts_with(&format!("{LOG_FILE_PREFIX}.")));
            if is_log {
                let modified = entry
                    .metadata()
                    .ok()
                    .and_then(|m| m.modified().ok())
                    .unwrap_or(std::time::UNIX_EPOCH);
                log_files.push((path, modified));
            }
        }
    }

    // Newest first
    log_files.sort_by(|a, b| b.1.cmp(&a.1));

    for (path, _) in log_files.iter().skip(MAX_LOG_FILES) {
        if let Err(e) = fs::remove_file(path) {
            warn!("Failed to prune log file {}: {e}", path.display());
        }
    }
}

// ---------------------------------------------------------------------------
// Build info
// ---------------------------------------------------------------------------

pub fn build_info() -> Value {
    json!({
        "version": env!("CARGO_PKG_VERSION"),
        "buildTimestamp": env!("SHOP_POS_BUILT_AT"),
        "gitSha": env!("SHOP_POS_GIT_SHA"),
        "platform": std::env::consts::OS,
        "arch": std::env::consts::ARCH,
    })
}

// ---------------------------------------------------------------------------
// Sync diagnostics
// ---------------------------------------------------------------------------

/// Backlog summary for support: status, pending counts per operation type,
/// the oldest pending entry and the latest dead letters.
pub fn sync_diagnostics(engine: &SyncEngine) -> Value {
    let pending = engine.queue().peek_all();
    let mut pending_by_type: BTreeMap<String, usize> = BTreeMap::new();
    for entry in &pending {
        *pending_by_type.entry(entry.kind.clone()).or_default() += 1;
    }
    let oldest_pending_at = pending.iter().map(|e| e.enqueued_at.as_str()).min();

    let mut dead_letters = engine.queue().dead_letters();
    dead_letters.sort_by(|a, b| b.failed_at.cmp(&a.failed_at));
    let recent_dead_letters: Vec<Value> = dead_letters
        .iter()
        .take(RECENT_DEAD_LETTERS)
        .map(|dead| {
            json!({
                "id": dead.operation.id,
                "shopId": dead.operation.shop_id,
                "type": dead.operation.kind,
                "targetEntityId": dead.operation.target_entity_id,
                "retryCount": dead.operation.retry_count,
                "lastError": dead.last_error,
                "failedAt": dead.failed_at,
                "payload": redact_sensitive_fields(dead.operation.payload.clone()),
            })
        })
        .collect();

    json!({
        "build": build_info(),
        "status": engine.status(),
        "pendingByType": pending_by_type,
        "oldestPendingAt": oldest_pending_at,
        "recentDeadLetters": recent_dead_letters,
    })
}

fn redact_sensitive_fields(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut redacted = serde_json::Map::new();
            for (key, value) in map {
                if should_redact_key(&key) {
                    redacted.insert(key, Value::String("[REDACTED]".to_string()));
                } else {
                    redacted.insert(key, redact_sensitive_fields(value));
                }
            }
            Value::Object(redacted)
        }
        Value::Array(items) => {
            Value::Array(items.into_iter().map(redact_sensitive_fields).collect())
        }
        other => other,
    }
}

fn should_redact_key(key: &str) -> bool {
    let normalized = key.to_ascii_lowercase();
    let sensitive_markers = [
        "api_key",
        "apikey",
        "secret",
        "password",
        "token",
        "authorization",
    ];
    sensitive_markers
        .iter()
        .any(|marker| normalized.contains(marker))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ShopData;
    use crate::network::NetworkStatus;
    use crate::operations::Operation;
    use crate::queue::OperationQueue;
    use crate::store::LocalStore;
    use crate::testutil::{test_db, user, FakeRemote, SHOP_A};
    use std::sync::Arc;
    use std::time::{Duration, SystemTime};

    #[test]
    fn test_build_info_has_required_fields() {
        let info = build_info();
        assert_eq!(info["version"], json!(env!("CARGO_PKG_VERSION")));
        assert!(info.get("buildTimestamp").is_some());
        assert!(info.get("gitSha").is_some());
        assert!(info.get("platform").is_some());
    }

    #[test]
    fn test_log_dir_lives_under_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(get_log_dir(dir.path()), dir.path().join("logs"));
    }

    #[test]
    fn test_prune_keeps_newest_log_files() {
        let dir = tempfile::tempdir().unwrap();
        let base = SystemTime::now() - Duration::from_secs(3600);
        for day in 0..(MAX_LOG_FILES + 3) {
            let path = dir.path().join(format!("pos.2026-01-{:02}", day + 1));
            let file = fs::File::create(&path).unwrap();
            file.set_modified(base + Duration::from_secs(day as u64 * 60))
                .unwrap();
        }
        fs::write(dir.path().join("notes.txt"), "keep").unwrap();

        prune_old_logs(dir.path());

        let mut remaining: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .flatten()
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        remaining.sort();
        assert_eq!(remaining.len(), MAX_LOG_FILES + 1);
        assert!(remaining.contains(&"notes.txt".to_string()));
        assert!(!remaining.contains(&"pos.2026-01-01".to_string()));
        assert!(remaining.contains(&format!("pos.2026-01-{:02}", MAX_LOG_FILES + 3)));
    }

    #[test]
    fn test_should_redact_key_matches_sensitive_markers() {
        assert!(should_redact_key("passwordHash"));
        assert!(should_redact_key("api_key"));
        assert!(should_redact_key("Authorization"));
        assert!(!should_redact_key("status"));
    }

    #[test]
    fn test_sync_diagnostics_groups_backlog_and_redacts_dead_letters() {
        let db = test_db();
        let store = Arc::new(LocalStore::load(db.clone()).unwrap());
        store.replace(SHOP_A, ShopData::default(), None).unwrap();
        let queue = Arc::new(OperationQueue::load(db.clone(), 1).unwrap());
        let engine = SyncEngine::new(
            db,
            store,
            queue.clone(),
            Arc::new(FakeRemote::new()),
            Arc::new(NetworkStatus::new(false)),
            Duration::from_secs(5),
        );

        let mut cashier = user(SHOP_A, "u-1", "cashier@shop.test");
        cashier.password_hash = Some("$2b$04$hash".into());
        queue.enqueue(SHOP_A, &Operation::CreateUser(cashier)).unwrap();
        queue
            .enqueue(SHOP_A, &Operation::DeleteCategory { id: "c-1".into() })
            .unwrap();
        queue
            .enqueue(SHOP_A, &Operation::DeleteCategory { id: "c-2".into() })
            .unwrap();
        let first = queue.peek_all()[0].id.clone();
        queue.mark_failed(&first, "rejected").unwrap();

        let report = sync_diagnostics(&engine);
        assert_eq!(report["status"]["pending"], json!(2));
        assert_eq!(report["status"]["deadLetters"], json!(1));
        assert_eq!(report["pendingByType"]["DELETE_CATEGORY"], json!(2));
        let dead = &report["recentDeadLetters"][0];
        assert_eq!(dead["type"], json!("CREATE_USER"));
        assert_eq!(dead["lastError"], json!("rejected"));
        assert_eq!(dead["payload"]["passwordHash"], json!("[REDACTED]"));
        assert_eq!(dead["payload"]["email"], json!("cashier@shop.test"));
    }
}
