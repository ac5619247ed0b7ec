//! SQLite database wrapper with WAL mode and schema versioning.
//!
//! Singletons live at the well-known row id [`SINGLETON_ID`]. Reads never
//! materialize a row; only admin writes and applied ticks do.

use crate::error::DashboardError;
use crate::state::schema;
use crate::types::*;
use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction, TransactionBehavior};
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// How long a writer waits on another connection's lock before giving up.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// The dashboard state database.
pub struct Database {
    conn: Connection,
}

fn last_tick_column(metric: Metric) -> &'static str {
    match metric {
        Metric::Conversations => "last_conversations_tick_ms",
        Metric::Accounts => "last_accounts_tick_ms",
        Metric::Revenue => "last_revenue_tick_ms",
    }
}

/// Overwrite the bookkeeping timestamps for the given metrics.
///
/// Each stamp only moves if it still holds the value the tick was evaluated
/// against (`None` matches a never-ticked metric). Any mismatch fails the
/// whole patch with [`DashboardError::TransientConflict`].
fn patch_tick_timestamps(conn: &Connection, stamps: &[(Metric, Option<i64>, i64)]) -> Result<()> {
    for (metric, expected, at_ms) in stamps {
        let column = last_tick_column(*metric);
        let updated = conn.execute(
            &format!(
                "UPDATE autopump_settings SET {column} = ?1
                 WHERE id = ?2 AND COALESCE({column}, 0) = ?3"
            ),
            params![at_ms, SINGLETON_ID, expected.unwrap_or(0)],
        )?;
        if updated == 0 {
            return Err(DashboardError::TransientConflict(format!(
                "{metric} was ticked by another writer"
            ))
            .into());
        }
    }
    Ok(())
}

/// Add each delta onto the totals row, which must already exist.
fn apply_deltas(conn: &Connection, deltas: &[(Metric, i64)]) -> Result<()> {
    for (metric, delta) in deltas {
        conn.execute(
            &format!("UPDATE global_stats SET {metric} = {metric} + ?1 WHERE id = ?2"),
            params![delta, SINGLETON_ID],
        )?;
    }
    Ok(())
}

const SETTINGS_COLUMNS: &str = "enabled,
    conversations_min_step, conversations_max_step, conversations_interval_seconds, conversations_cap, last_conversations_tick_ms,
    accounts_min_step, accounts_max_step, accounts_interval_seconds, accounts_cap, last_accounts_tick_ms,
    revenue_min_step, revenue_max_step, revenue_interval_seconds, revenue_cap, last_revenue_tick_ms,
    timezone_offset_minutes";

fn metric_from_row(row: &Row<'_>, offset: usize) -> rusqlite::Result<MetricConfig> {
    Ok(MetricConfig {
        min_step: row.get(offset)?,
        max_step: row.get(offset + 1)?,
        interval_seconds: row.get(offset + 2)?,
        cap: row.get(offset + 3)?,
        // Zero is stored by older writers to mean "never".
        last_tick_at_ms: row.get::<_, Option<i64>>(offset + 4)?.filter(|ms| *ms != 0),
    })
}

impl Database {
    /// Open (or create) the database at the given path and run migrations.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path).context("Failed to open SQLite database")?;

        // WAL lets readers proceed while another process holds the write lock
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        conn.busy_timeout(BUSY_TIMEOUT)?;

        let mut db = Self { conn };
        db.migrate()?;
        Ok(db)
    }

    /// Open an in-memory database (for testing).
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let mut db = Self { conn };
        db.migrate()?;
        Ok(db)
    }

    fn migrate(&mut self) -> Result<()> {
        let version = self.schema_version();

        if version == 0 {
            info!("Creating database schema v{}", schema::SCHEMA_VERSION);
            self.conn
                .execute_batch(schema::CREATE_SCHEMA)
                .context("Failed to create schema")?;
            self.conn.execute(
                "INSERT INTO schema_version (version) VALUES (?1)",
                params![schema::SCHEMA_VERSION],
            )?;
        } else if version > schema::SCHEMA_VERSION {
            anyhow::bail!(
                "Database schema v{version} is newer than this build (v{})",
                schema::SCHEMA_VERSION
            );
        }

        Ok(())
    }

    /// Override the lock wait applied to cross-process writers.
    pub fn set_busy_timeout(&self, timeout: Duration) -> Result<()> {
        self.conn.busy_timeout(timeout)?;
        Ok(())
    }

    /// Get the current schema version (0 if uninitialized).
    fn schema_version(&self) -> u32 {
        self.conn
            .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
                row.get(0)
            })
            .unwrap_or(0)
    }

    // -----------------------------------------------------------------------
    // Settings
    // -----------------------------------------------------------------------

    /// The persisted settings row, if one has ever been written.
    pub fn load_settings(&self) -> Result<Option<AutopumpSettings>> {
        let sql = format!("SELECT {SETTINGS_COLUMNS} FROM autopump_settings WHERE id = ?1");
        let settings = self
            .conn
            .query_row(&sql, params![SINGLETON_ID], |row| {
                Ok(AutopumpSettings {
                    enabled: row.get::<_, i64>(0)? != 0,
                    conversations: metric_from_row(row, 1)?,
                    accounts: metric_from_row(row, 6)?,
                    revenue: metric_from_row(row, 11)?,
                    timezone_offset_minutes: row.get(16)?,
                })
            })
            .optional()
            .context("Failed to read autopump settings")?;
        Ok(settings)
    }

    /// Persisted settings, or the in-memory defaults.
    pub fn settings(&self) -> Result<AutopumpSettings> {
        Ok(self.load_settings()?.unwrap_or_default())
    }

    /// Create or overwrite the tunable settings fields.
    ///
    /// Tick timestamps and the timezone offset of an existing row are left
    /// untouched; `timezone_offset_minutes` only seeds a fresh row.
    pub fn write_settings(
        &self,
        update: &SettingsUpdate,
        timezone_offset_minutes: i64,
    ) -> Result<RecordId> {
        let c = &update.conversations;
        let a = &update.accounts;
        let r = &update.revenue;
        self.conn
            .execute(
                "INSERT INTO autopump_settings (
                    id, enabled,
                    conversations_min_step, conversations_max_step, conversations_interval_seconds, conversations_cap,
                    accounts_min_step, accounts_max_step, accounts_interval_seconds, accounts_cap,
                    revenue_min_step, revenue_max_step, revenue_interval_seconds, revenue_cap,
                    timezone_offset_minutes
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
                 ON CONFLICT(id) DO UPDATE SET
                    enabled = ?2,
                    conversations_min_step = ?3, conversations_max_step = ?4,
                    conversations_interval_seconds = ?5, conversations_cap = ?6,
                    accounts_min_step = ?7, accounts_max_step = ?8,
                    accounts_interval_seconds = ?9, accounts_cap = ?10,
                    revenue_min_step = ?11, revenue_max_step = ?12,
                    revenue_interval_seconds = ?13, revenue_cap = ?14,
                    updated_at = datetime('now')",
                params![
                    SINGLETON_ID,
                    update.enabled as i32,
                    c.min_step,
                    c.max_step,
                    c.interval_seconds,
                    c.cap,
                    a.min_step,
                    a.max_step,
                    a.interval_seconds,
                    a.cap,
                    r.min_step,
                    r.max_step,
                    r.interval_seconds,
                    r.cap,
                    timezone_offset_minutes,
                ],
            )
            .context("Failed to write autopump settings")?;
        Ok(SINGLETON_ID)
    }

    // -----------------------------------------------------------------------
    // Global stats
    // -----------------------------------------------------------------------

    /// The persisted totals row, if one exists.
    pub fn load_stats(&self) -> Result<Option<GlobalStats>> {
        let stats = self
            .conn
            .query_row(
                "SELECT conversations, accounts, revenue FROM global_stats WHERE id = ?1",
                params![SINGLETON_ID],
                |row| {
                    Ok(GlobalStats {
                        conversations: row.get(0)?,
                        accounts: row.get(1)?,
                        revenue: row.get(2)?,
                    })
                },
            )
            .optional()
            .context("Failed to read global stats")?;
        Ok(stats)
    }

    /// Persisted totals, or zeros.
    pub fn stats(&self) -> Result<GlobalStats> {
        Ok(self.load_stats()?.unwrap_or_default())
    }

    /// Absolute create-or-overwrite of the totals row.
    pub fn set_stats(&self, values: &GlobalStats) -> Result<RecordId> {
        self.conn
            .execute(
                "INSERT INTO global_stats (id, conversations, accounts, revenue)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(id) DO UPDATE SET
                    conversations = ?2, accounts = ?3, revenue = ?4",
                params![
                    SINGLETON_ID,
                    values.conversations,
                    values.accounts,
                    values.revenue
                ],
            )
            .context("Failed to write global stats")?;
        Ok(SINGLETON_ID)
    }

    // -----------------------------------------------------------------------
    // Tick application (pump only)
    // -----------------------------------------------------------------------

    /// Apply one tick's additive deltas, timestamp patch and log row as a
    /// single transaction. Nothing is written when `changes` is empty.
    ///
    /// The transaction takes the write lock up front. A tick whose stamps
    /// were overtaken by another writer (any connection, any process) rolls
    /// back with [`DashboardError::TransientConflict`].
    pub(crate) fn apply_tick(&self, tick_id: &str, changes: &[MetricChange]) -> Result<()> {
        if changes.is_empty() {
            return Ok(());
        }

        let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)
            .context("Failed to begin tick transaction")?;

        let stamps: Vec<(Metric, Option<i64>, i64)> = changes
            .iter()
            .map(|c| (c.metric, c.last_tick_at_ms, c.ticked_at_ms))
            .collect();
        patch_tick_timestamps(&tx, &stamps)?;

        tx.execute(
            "INSERT OR IGNORE INTO global_stats (id, conversations, accounts, revenue)
             VALUES (?1, 0, 0, 0)",
            params![SINGLETON_ID],
        )?;
        let deltas: Vec<(Metric, i64)> = changes.iter().map(|c| (c.metric, c.delta())).collect();
        apply_deltas(&tx, &deltas)?;

        let ticked_at_ms = changes.iter().map(|c| c.ticked_at_ms).max().unwrap_or(0);
        tx.execute(
            "INSERT INTO pump_ticks (id, ticked_at_ms, changes_json) VALUES (?1, ?2, ?3)",
            params![tick_id, ticked_at_ms, serde_json::to_string(changes)?],
        )?;

        tx.commit().context("Failed to commit tick transaction")?;
        Ok(())
    }

    /// Most recent applied tick.
    pub fn latest_tick(&self) -> Result<Option<TickRecord>> {
        let row: Option<(String, i64, String)> = self
            .conn
            .query_row(
                "SELECT id, ticked_at_ms, changes_json FROM pump_ticks
                 ORDER BY ticked_at_ms DESC, id DESC LIMIT 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        match row {
            Some((id, ticked_at_ms, changes_json)) => Ok(Some(TickRecord {
                id,
                ticked_at_ms,
                changes: serde_json::from_str(&changes_json)
                    .context("Corrupt pump_ticks.changes_json")?,
            })),
            None => Ok(None),
        }
    }

    /// Number of applied ticks.
    pub fn tick_count(&self) -> Result<u64> {
        let count: u64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM pump_ticks", [], |row| row.get(0))?;
        Ok(count)
    }

    // -----------------------------------------------------------------------
    // Per-date stats
    // -----------------------------------------------------------------------

    /// Upsert the totals for one date.
    pub fn set_stats_for_date(&self, date: &str, values: &GlobalStats) -> Result<RecordId> {
        let id = self
            .conn
            .query_row(
                "INSERT INTO stats_by_date (date, conversations, accounts, revenue)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(date) DO UPDATE SET
                    conversations = ?2, accounts = ?3, revenue = ?4
                 RETURNING id",
                params![date, values.conversations, values.accounts, values.revenue],
                |row| row.get(0),
            )
            .context("Failed to write stats_by_date")?;
        Ok(id)
    }

    pub fn stats_for_date(&self, date: &str) -> Result<Option<DailyStats>> {
        let stats = self
            .conn
            .query_row(
                "SELECT date, conversations, accounts, revenue FROM stats_by_date WHERE date = ?1",
                params![date],
                |row| {
                    Ok(DailyStats {
                        date: row.get(0)?,
                        conversations: row.get(1)?,
                        accounts: row.get(2)?,
                        revenue: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(stats)
    }
}
