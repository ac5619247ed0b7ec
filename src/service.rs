//! Dashboard-facing read and write API over the settings and stats stores.
//!
//! Reads never fail on missing records; writes pass through the admin gate.
//! A settings write kicks the pump so new parameters take effect without
//! waiting out the previous cadence.

use crate::auth::AdminGate;
use crate::error::{DashboardError, DashboardResult};
use crate::pump::PumpKicker;
use crate::state::Database;
use crate::types::*;
use chrono::{DateTime, NaiveDate};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

pub struct StatsService {
    db: Arc<Mutex<Database>>,
    gate: Arc<dyn AdminGate>,
    kicker: PumpKicker,
    timezone_offset_minutes: i64,
}

impl StatsService {
    pub fn new(
        db: Arc<Mutex<Database>>,
        gate: Arc<dyn AdminGate>,
        kicker: PumpKicker,
        timezone_offset_minutes: i64,
    ) -> Self {
        Self {
            db,
            gate,
            kicker,
            timezone_offset_minutes,
        }
    }

    async fn require_admin(&self, caller: &CallerIdentity, action: &str) -> DashboardResult<()> {
        if self.gate.is_admin(caller).await {
            return Ok(());
        }
        warn!(subject = %caller.subject, "Rejected non-admin {action}");
        Err(DashboardError::Forbidden(format!(
            "{action} requires admin rights"
        )))
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    pub async fn get_settings(&self) -> DashboardResult<AutopumpSettings> {
        Ok(self.db.lock().await.settings()?)
    }

    pub async fn get_aggregate(&self) -> DashboardResult<GlobalStats> {
        Ok(self.db.lock().await.stats()?)
    }

    pub async fn get_stats_for_date(&self, date: &str) -> DashboardResult<Option<DailyStats>> {
        let date = parse_date_key(date)?;
        Ok(self.db.lock().await.stats_for_date(&date)?)
    }

    /// Local date key for `now_ms`, using the persisted offset when present.
    pub async fn today_key(&self, now_ms: i64) -> DashboardResult<String> {
        let offset = self
            .db
            .lock()
            .await
            .load_settings()?
            .map(|s| s.timezone_offset_minutes)
            .unwrap_or(self.timezone_offset_minutes);
        date_key(now_ms, offset)
    }

    // -----------------------------------------------------------------------
    // Gated writes
    // -----------------------------------------------------------------------

    pub async fn update_settings(
        &self,
        caller: &CallerIdentity,
        update: &SettingsUpdate,
    ) -> DashboardResult<RecordId> {
        self.require_admin(caller, "settings update").await?;
        update.validate().map_err(DashboardError::Invalid)?;

        let id = self
            .db
            .lock()
            .await
            .write_settings(update, self.timezone_offset_minutes)?;
        info!(enabled = update.enabled, "Autopump settings updated");

        self.kicker.kick();
        Ok(id)
    }

    pub async fn manual_set_aggregate(
        &self,
        caller: &CallerIdentity,
        values: &GlobalStats,
    ) -> DashboardResult<RecordId> {
        self.require_admin(caller, "manual totals set").await?;
        ensure_non_negative(values)?;

        let id = self.db.lock().await.set_stats(values)?;
        info!(
            conversations = values.conversations,
            accounts = values.accounts,
            revenue = values.revenue,
            "Global stats set manually"
        );
        Ok(id)
    }

    pub async fn set_stats_for_date(
        &self,
        caller: &CallerIdentity,
        date: &str,
        values: &GlobalStats,
    ) -> DashboardResult<RecordId> {
        self.require_admin(caller, "per-date stats set").await?;
        let date = parse_date_key(date)?;
        ensure_non_negative(values)?;

        let id = self.db.lock().await.set_stats_for_date(&date, values)?;
        info!("Stats for {date} set manually");
        Ok(id)
    }
}

fn ensure_non_negative(values: &GlobalStats) -> DashboardResult<()> {
    for metric in Metric::ALL {
        let value = values.get(metric);
        if value < 0 {
            return Err(DashboardError::Invalid(format!(
                "{metric} must be non-negative, got {value}"
            )));
        }
    }
    Ok(())
}

/// Accepts exactly `YYYY-MM-DD`.
pub fn parse_date_key(date: &str) -> DashboardResult<String> {
    let parsed = NaiveDate::parse_from_str(date, "%Y-%m-%d")
        .map_err(|e| DashboardError::Invalid(format!("bad date '{date}': {e}")))?;
    let canonical = parsed.format("%Y-%m-%d").to_string();
    if canonical != date {
        return Err(DashboardError::Invalid(format!(
            "bad date '{date}': expected {canonical}"
        )));
    }
    Ok(canonical)
}

/// `YYYY-MM-DD` of `now_ms` shifted by `offset_minutes`.
pub fn date_key(now_ms: i64, offset_minutes: i64) -> DashboardResult<String> {
    let shifted = now_ms.saturating_add(offset_minutes.saturating_mul(60_000));
    DateTime::from_timestamp_millis(shifted)
        .map(|d| d.format("%Y-%m-%d").to_string())
        .ok_or_else(|| DashboardError::Invalid(format!("timestamp {now_ms} out of range")))
}
