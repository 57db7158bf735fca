//! Sync tunables stored in `local_settings` under category `sync`.

use rusqlite::Connection;
use serde::Serialize;
use std::time::Duration;

use crate::db;
use crate::queue::DEFAULT_MAX_RETRIES;

const CATEGORY: &str = "sync";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSettings {
    /// Periodic drain interval while operations are pending.
    pub interval_secs: u64,
    /// Failed attempts before an operation is dead-lettered.
    pub max_retries: u32,
    /// Upper bound on every remote call.
    pub request_timeout_secs: u64,
    /// Kick the sync loop right after a sale leaves work in the queue.
    pub drain_after_sale: bool,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            max_retries: DEFAULT_MAX_RETRIES,
            request_timeout_secs: 20,
            drain_after_sale: true,
        }
    }
}

impl SyncSettings {
    /// Read settings, falling back to defaults for missing or unparseable
    /// values.
    pub fn load(conn: &Connection) -> Self {
        let defaults = Self::default();
        let read = |key: &str| db::get_setting(conn, CATEGORY, key);

        Self {
            interval_secs: read("interval_secs")
                .and_then(|v| v.parse::<u64>().ok())
                .filter(|v| *v > 0)
                .unwrap_or(defaults.interval_secs),
            max_retries: read("max_retries")
                .and_then(|v| v.parse::<u32>().ok())
                .filter(|v| *v > 0)
                .unwrap_or(defaults.max_retries),
            request_timeout_secs: read("request_timeout_secs")
                .and_then(|v| v.parse::<u64>().ok())
                .filter(|v| *v > 0)
                .unwrap_or(defaults.request_timeout_secs),
            drain_after_sale: read("drain_after_sale")
                .map(|v| parse_flag(&v))
                .unwrap_or(defaults.drain_after_sale),
        }
    }

    pub fn save(&self, conn: &Connection) -> Result<(), String> {
        db::set_setting(conn, CATEGORY, "interval_secs", &self.interval_secs.to_string())?;
        db::set_setting(conn, CATEGORY, "max_retries", &self.max_retries.to_string())?;
        db::set_setting(
            conn,
            CATEGORY,
            "request_timeout_secs",
            &self.request_timeout_secs.to_string(),
        )?;
        db::set_setting(
            conn,
            CATEGORY,
            "drain_after_sale",
            if self.drain_after_sale { "true" } else { "false" },
        )
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

fn parse_flag(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "true" | "1" | "yes" | "on"
    )
}
