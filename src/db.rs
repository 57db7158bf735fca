//! Local SQLite persistence for the shop POS.
//!
//! The store and the operation queue are persisted as blobs under fixed
//! keys in `local_blobs`; small scalar state (sync timestamps, lockout
//! counters, tunables) lives in `local_settings`. WAL mode, versioned
//! migrations, and a delete-and-retry-once policy on open failure.

use rusqlite::{params, Connection, OptionalExtension};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{info, warn};

/// Shared database handle.
pub struct DbState {
    pub conn: Mutex<Connection>,
    pub db_path: PathBuf,
}

/// Current schema version. Bump when adding new migrations.
const CURRENT_SCHEMA_VERSION: i32 = 2;

/// Initialize the database at `{data_dir}/pos.db`.
///
/// Creates the directory if needed, opens the connection, sets pragmas,
/// and runs any pending migrations. On corruption or open failure, renames
/// the file to `pos.db.corrupt-<timestamp>` (keeping the unsynced queue
/// recoverable) and retries once with a fresh file.
pub fn init(data_dir: &Path) -> Result<DbState, String> {
    fs::create_dir_all(data_dir).map_err(|e| format!("Failed to create data dir: {e}"))?;

    let db_path = data_dir.join("pos.db");
    info!("Opening database at {}", db_path.display());

    let conn = match open_and_configure(&db_path) {
        Ok(c) => c,
        Err(first_err) => {
            warn!(
                "Database open failed ({}), setting it aside and retrying once",
                first_err
            );
            if db_path.exists() {
                set_aside_damaged(&db_path)?;
            }
            open_and_configure(&db_path)
                .map_err(|e| format!("Database open failed after retry: {e}"))?
        }
    };

    run_migrations(&conn)?;

    info!("Database initialized (schema v{CURRENT_SCHEMA_VERSION})");

    Ok(DbState {
        conn: Mutex::new(conn),
        db_path,
    })
}

/// Open a migrated in-memory database. Used by tests and by hosts that do
/// not want anything written to disk.
pub fn open_in_memory() -> Result<DbState, String> {
    let conn = Connection::open_in_memory().map_err(|e| format!("sqlite open: {e}"))?;
    conn.execute_batch(
        "PRAGMA foreign_keys = ON;
         PRAGMA synchronous = NORMAL;",
    )
    .map_err(|e| format!("pragma setup: {e}"))?;
    run_migrations(&conn)?;
    Ok(DbState {
        conn: Mutex::new(conn),
        db_path: PathBuf::from(":memory:"),
    })
}

fn open_and_configure(path: &Path) -> Result<Connection, String> {
    let conn = Connection::open(path).map_err(|e| format!("sqlite open: {e}"))?;

    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )
    .map_err(|e| format!("pragma setup: {e}"))?;

    Ok(conn)
}

fn run_migrations(conn: &Connection) -> Result<(), String> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )
    .map_err(|e| format!("create schema_version: {e}"))?;

    let current: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current >= CURRENT_SCHEMA_VERSION {
        info!("Database schema up to date (v{current})");
        return Ok(());
    }

    info!("Migrating database from v{current} to v{CURRENT_SCHEMA_VERSION}");

    if current < 1 {
        migrate_v1(conn)?;
    }
    if current < 2 {
        migrate_v2(conn)?;
    }

    Ok(())
}

/// Migration v1: settings table.
fn migrate_v1(conn: &Connection) -> Result<(), String> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS local_settings (
            setting_category TEXT NOT NULL,
            setting_key TEXT NOT NULL,
            setting_value TEXT NOT NULL,
            updated_at TEXT DEFAULT (datetime('now')),
            PRIMARY KEY (setting_category, setting_key)
        );

        INSERT INTO schema_version (version) VALUES (1);
        ",
    )
    .map_err(|e| format!("migrate_v1: {e}"))?;
    info!("Applied migration v1");
    Ok(())
}

/// Migration v2: blob storage for the snapshot and the operation queue.
fn migrate_v2(conn: &Connection) -> Result<(), String> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS local_blobs (
            blob_key TEXT PRIMARY KEY,
            data BLOB NOT NULL,
            updated_at TEXT DEFAULT (datetime('now'))
        );

        INSERT INTO schema_version (version) VALUES (2);
        ",
    )
    .map_err(|e| format!("migrate_v2: {e}"))?;
    info!("Applied migration v2");
    Ok(())
}

/// Move a database that could not be opened, with its WAL and shared-memory
/// files, out of the way. Returns the new path of the main file.
fn set_aside_damaged(db_path: &Path) -> Result<PathBuf, String> {
    let stamp = chrono::Utc::now().format("%Y%m%d%H%M%S");
    let file_name = db_path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("pos.db");
    let aside = db_path.with_file_name(format!("{file_name}.corrupt-{stamp}"));

    fs::rename(db_path, &aside).map_err(|e| format!("Failed to set aside database: {e}"))?;
    for suffix in ["-wal", "-shm"] {
        let sidecar = db_path.with_file_name(format!("{file_name}{suffix}"));
        if sidecar.exists() {
            let target = aside.with_file_name(format!(
                "{}{suffix}",
                aside.file_name().and_then(|n| n.to_str()).unwrap_or_default()
            ));
            if let Err(e) = fs::rename(&sidecar, &target) {
                warn!("Failed to set aside {}: {e}", sidecar.display());
            }
        }
    }
    warn!("Unreadable database kept at {}", aside.display());
    Ok(aside)
}

// ---------------------------------------------------------------------------
// Settings helpers
// ---------------------------------------------------------------------------

/// Get a single setting value.
pub fn get_setting(conn: &Connection, category: &str, key: &str) -> Option<String> {
    conn.query_row(
        "SELECT setting_value FROM local_settings WHERE setting_category = ?1 AND setting_key = ?2",
        params![category, key],
        |row| row.get(0),
    )
    .ok()
}

/// Insert or update a setting.
pub fn set_setting(
    conn: &Connection,
    category: &str,
    key: &str,
    value: &str,
) -> Result<(), String> {
    conn.execute(
        "INSERT INTO local_settings (setting_category, setting_key, setting_value, updated_at)
         VALUES (?1, ?2, ?3, datetime('now'))
         ON CONFLICT(setting_category, setting_key) DO UPDATE SET
            setting_value = excluded.setting_value,
            updated_at = excluded.updated_at",
        params![category, key, value],
    )
    .map_err(|e| format!("set_setting: {e}"))?;
    Ok(())
}

/// Remove a single setting. Missing rows are not an error.
pub fn delete_setting(conn: &Connection, category: &str, key: &str) -> Result<(), String> {
    conn.execute(
        "DELETE FROM local_settings WHERE setting_category = ?1 AND setting_key = ?2",
        params![category, key],
    )
    .map_err(|e| format!("delete_setting: {e}"))?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Blob helpers
// ---------------------------------------------------------------------------

pub fn get_blob(conn: &Connection, key: &str) -> Result<Option<Vec<u8>>, String> {
    conn.query_row(
        "SELECT data FROM local_blobs WHERE blob_key = ?1",
        params![key],
        |row| row.get(0),
    )
    .optional()
    .map_err(|e| format!("get_blob {key}: {e}"))
}

pub fn put_blob(conn: &Connection, key: &str, data: &[u8]) -> Result<(), String> {
    conn.execute(
        "INSERT INTO local_blobs (blob_key, data, updated_at)
         VALUES (?1, ?2, datetime('now'))
         ON CONFLICT(blob_key) DO UPDATE SET
            data = excluded.data,
            updated_at = excluded.updated_at",
        params![key, data],
    )
    .map_err(|e| format!("put_blob {key}: {e}"))?;
    Ok(())
}

pub fn delete_blob(conn: &Connection, key: &str) -> Result<(), String> {
    conn.execute("DELETE FROM local_blobs WHERE blob_key = ?1", params![key])
        .map_err(|e| format!("delete_blob {key}: {e}"))?;
    Ok(())
}

/// Wipe every cached blob and setting. Used by factory reset.
pub fn clear_local_data(conn: &Connection) -> Result<(), String> {
    conn.execute_batch("DELETE FROM local_blobs; DELETE FROM local_settings;")
        .map_err(|e| format!("clear_local_data: {e}"))?;
    info!("local data cleared");
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
