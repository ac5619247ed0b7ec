//! Database schema definitions.

/// Current schema version.
pub const SCHEMA_VERSION: u32 = 1;

/// Full DDL for the dashboard state database.
pub const CREATE_SCHEMA: &str = r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER NOT NULL
);

-- Autopump settings (single row, id = 1)
CREATE TABLE IF NOT EXISTS autopump_settings (
    id                              INTEGER PRIMARY KEY CHECK (id = 1),
    enabled                         INTEGER NOT NULL DEFAULT 0,
    conversations_min_step          INTEGER NOT NULL DEFAULT 0,
    conversations_max_step          INTEGER NOT NULL DEFAULT 0,
    conversations_interval_seconds  INTEGER NOT NULL DEFAULT 10,
    conversations_cap               INTEGER NOT NULL DEFAULT 0,
    accounts_min_step               INTEGER NOT NULL DEFAULT 0,
    accounts_max_step               INTEGER NOT NULL DEFAULT 0,
    accounts_interval_seconds       INTEGER NOT NULL DEFAULT 10,
    accounts_cap                    INTEGER NOT NULL DEFAULT 0,
    revenue_min_step                INTEGER NOT NULL DEFAULT 0,
    revenue_max_step                INTEGER NOT NULL DEFAULT 0,
    revenue_interval_seconds        INTEGER NOT NULL DEFAULT 10,
    revenue_cap                     INTEGER NOT NULL DEFAULT 0,
    timezone_offset_minutes         INTEGER NOT NULL DEFAULT 180,
    last_conversations_tick_ms      INTEGER,
    last_accounts_tick_ms           INTEGER,
    last_revenue_tick_ms            INTEGER,
    updated_at                      TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Running totals (single row, id = 1)
CREATE TABLE IF NOT EXISTS global_stats (
    id            INTEGER PRIMARY KEY CHECK (id = 1),
    conversations INTEGER NOT NULL DEFAULT 0,
    accounts      INTEGER NOT NULL DEFAULT 0,
    revenue       INTEGER NOT NULL DEFAULT 0
);

-- Admin-entered per-date totals
CREATE TABLE IF NOT EXISTS stats_by_date (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    date          TEXT NOT NULL UNIQUE,
    conversations INTEGER NOT NULL DEFAULT 0,
    accounts      INTEGER NOT NULL DEFAULT 0,
    revenue       INTEGER NOT NULL DEFAULT 0
);

-- Ticks that changed at least one metric
CREATE TABLE IF NOT EXISTS pump_ticks (
    id            TEXT PRIMARY KEY,
    ticked_at_ms  INTEGER NOT NULL,
    changes_json  TEXT NOT NULL DEFAULT '[]'
);

CREATE INDEX IF NOT EXISTS idx_pump_ticks_at ON pump_ticks(ticked_at_ms);
"#;
