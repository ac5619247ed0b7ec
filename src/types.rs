//! Shared types used across the autopump runtime.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Well-known row id of every singleton record.
pub const SINGLETON_ID: i64 = 1;

/// Interval used for any metric whose settings have never been written.
pub const DEFAULT_INTERVAL_SECONDS: i64 = 10;

/// Offset applied when deriving local date keys (UTC+3).
pub const DEFAULT_TIMEZONE_OFFSET_MINUTES: i64 = 180;

/// Identifier returned by singleton and daily-stat writes.
pub type RecordId = i64;

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

/// The three tracked counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    Conversations,
    Accounts,
    Revenue,
}

impl Metric {
    pub const ALL: [Metric; 3] = [Metric::Conversations, Metric::Accounts, Metric::Revenue];
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Conversations => write!(f, "conversations"),
            Self::Accounts => write!(f, "accounts"),
            Self::Revenue => write!(f, "revenue"),
        }
    }
}

/// Per-metric tuning plus the scheduler-owned bookkeeping timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricConfig {
    pub min_step: i64,
    pub max_step: i64,
    pub interval_seconds: i64,
    /// `0` means unbounded.
    pub cap: i64,
    /// Epoch milliseconds of the last successful increment, `None` if never.
    pub last_tick_at_ms: Option<i64>,
}

impl Default for MetricConfig {
    fn default() -> Self {
        Self {
            min_step: 0,
            max_step: 0,
            interval_seconds: DEFAULT_INTERVAL_SECONDS,
            cap: 0,
            last_tick_at_ms: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// The autopump settings singleton.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutopumpSettings {
    pub enabled: bool,
    pub conversations: MetricConfig,
    pub accounts: MetricConfig,
    pub revenue: MetricConfig,
    pub timezone_offset_minutes: i64,
}

impl Default for AutopumpSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            conversations: MetricConfig::default(),
            accounts: MetricConfig::default(),
            revenue: MetricConfig::default(),
            timezone_offset_minutes: DEFAULT_TIMEZONE_OFFSET_MINUTES,
        }
    }
}

impl AutopumpSettings {
    pub fn metric(&self, metric: Metric) -> &MetricConfig {
        match metric {
            Metric::Conversations => &self.conversations,
            Metric::Accounts => &self.accounts,
            Metric::Revenue => &self.revenue,
        }
    }

    /// Wake-up cadence: the shortest configured interval, never below 1s.
    pub fn min_interval_seconds(&self) -> i64 {
        Metric::ALL
            .iter()
            .map(|m| self.metric(*m).interval_seconds)
            .min()
            .unwrap_or(DEFAULT_INTERVAL_SECONDS)
            .max(1)
    }
}

/// Tunables for one metric as supplied by an admin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricTuning {
    pub min_step: i64,
    pub max_step: i64,
    pub interval_seconds: i64,
    pub cap: i64,
}

impl Default for MetricTuning {
    fn default() -> Self {
        Self {
            min_step: 0,
            max_step: 0,
            interval_seconds: DEFAULT_INTERVAL_SECONDS,
            cap: 0,
        }
    }
}

/// An admin settings write. Carries no tick timestamps.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SettingsUpdate {
    pub enabled: bool,
    pub conversations: MetricTuning,
    pub accounts: MetricTuning,
    pub revenue: MetricTuning,
}

impl SettingsUpdate {
    pub fn metric(&self, metric: Metric) -> &MetricTuning {
        match metric {
            Metric::Conversations => &self.conversations,
            Metric::Accounts => &self.accounts,
            Metric::Revenue => &self.revenue,
        }
    }

    /// First offending field, if any value is negative.
    pub fn validate(&self) -> Result<(), String> {
        for metric in Metric::ALL {
            let t = self.metric(metric);
            let fields = [
                ("min_step", t.min_step),
                ("max_step", t.max_step),
                ("interval_seconds", t.interval_seconds),
                ("cap", t.cap),
            ];
            for (name, value) in fields {
                if value < 0 {
                    return Err(format!("{metric}.{name} must be non-negative, got {value}"));
                }
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Aggregates
// ---------------------------------------------------------------------------

/// The running totals singleton.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalStats {
    pub conversations: i64,
    pub accounts: i64,
    pub revenue: i64,
}

impl GlobalStats {
    pub fn get(&self, metric: Metric) -> i64 {
        match metric {
            Metric::Conversations => self.conversations,
            Metric::Accounts => self.accounts,
            Metric::Revenue => self.revenue,
        }
    }
}

/// Admin-entered totals for a single local date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyStats {
    /// `YYYY-MM-DD`.
    pub date: String,
    pub conversations: i64,
    pub accounts: i64,
    pub revenue: i64,
}

// ---------------------------------------------------------------------------
// Pump bookkeeping
// ---------------------------------------------------------------------------

/// One metric's result from a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricChange {
    pub metric: Metric,
    pub previous: i64,
    pub value: i64,
    pub ticked_at_ms: i64,
    /// Stamp the decision was evaluated against. The write is refused if the
    /// stored stamp has moved on since.
    #[serde(default)]
    pub last_tick_at_ms: Option<i64>,
}

impl MetricChange {
    pub fn delta(&self) -> i64 {
        self.value - self.previous
    }
}

/// A persisted tick-log row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TickRecord {
    pub id: String,
    pub ticked_at_ms: i64,
    pub changes: Vec<MetricChange>,
}

// ---------------------------------------------------------------------------
// Callers
// ---------------------------------------------------------------------------

/// Who is asking. Interpreted only by the admin gate.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallerIdentity {
    pub subject: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
}

impl CallerIdentity {
    pub fn with_email(email: &str) -> Self {
        Self {
            subject: email.to_string(),
            email: Some(email.to_string()),
            roles: Vec::new(),
        }
    }

    pub fn anonymous() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_settings_poll_every_ten_seconds() {
        let settings = AutopumpSettings::default();
        assert!(!settings.enabled);
        assert_eq!(settings.min_interval_seconds(), 10);
        assert_eq!(settings.timezone_offset_minutes, 180);
    }

    #[test]
    fn min_interval_takes_shortest_and_floors_at_one() {
        let mut settings = AutopumpSettings::default();
        settings.revenue.interval_seconds = 3;
        assert_eq!(settings.min_interval_seconds(), 3);
        settings.accounts.interval_seconds = 0;
        assert_eq!(settings.min_interval_seconds(), 1);
    }

    #[test]
    fn negative_tuning_is_rejected() {
        let mut update = SettingsUpdate::default();
        assert!(update.validate().is_ok());
        update.accounts.cap = -1;
        let err = update.validate().unwrap_err();
        assert!(err.contains("accounts.cap"));
    }
}
