//! Configuration schema for autopump.toml.

use serde::{Deserialize, Serialize};

use crate::types::DEFAULT_TIMEZONE_OFFSET_MINUTES;

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutopumpConfig {
    /// Path to SQLite database.
    pub db_path: String,

    /// Log level (debug, info, warn, error).
    pub log_level: String,

    /// Emails allowed to change settings and totals.
    pub admin_emails: Vec<String>,

    /// Role claims that grant the same rights as an admin email.
    pub admin_roles: Vec<String>,

    /// Offset (minutes east of UTC) written into a freshly created settings
    /// row and used for local date keys.
    pub timezone_offset_minutes: i64,

    /// How long `run` waits for the pump to stop after Ctrl+C.
    pub shutdown_timeout_secs: u64,
}

impl Default for AutopumpConfig {
    fn default() -> Self {
        Self {
            db_path: "~/.autopump/state.db".into(),
            log_level: "info".into(),
            admin_emails: Vec::new(),
            admin_roles: Vec::new(),
            timezone_offset_minutes: DEFAULT_TIMEZONE_OFFSET_MINUTES,
            shutdown_timeout_secs: 10,
        }
    }
}

impl AutopumpConfig {
    /// Resolve a path that may contain `~` to an absolute path.
    pub fn resolve_path(&self, path: &str) -> String {
        shellexpand::tilde(path).into_owned()
    }

    /// Resolved database path.
    pub fn resolved_db_path(&self) -> String {
        self.resolve_path(&self.db_path)
    }
}
