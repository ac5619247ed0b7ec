//! Autopump daemon — the self-rescheduling tick loop.
//!
//! Every tick re-reads settings and totals, evaluates the increment policy
//! for each metric and commits all changes in one transaction. The loop then
//! sleeps for the shortest configured interval, or less if kicked by a
//! settings write. A disabled or unconfigured pump keeps polling at the same
//! cadence so a later enable is picked up without an external trigger.

use crate::error::DashboardError;
use crate::pump::clock::{Clock, SystemClock};
use crate::pump::policy::{self, Decision, RandomSource, ThreadRandom};
use crate::state::Database;
use crate::types::*;
use anyhow::Result;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Where the loop stands after a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpState {
    /// Pump off or never configured; polling for an enable.
    DisabledPoll,
    /// Pump on; the next tick is scheduled.
    Armed,
}

/// Result of a single tick.
#[derive(Debug, Clone)]
pub struct TickReport {
    pub state: PumpState,
    /// Delay before the next scheduled tick. Always at least one second.
    pub next_delay: Duration,
    /// Committed changes. Empty when nothing was due or the write failed.
    pub changes: Vec<MetricChange>,
}

/// Wakes a running daemon for an immediate tick.
#[derive(Debug, Clone, Default)]
pub struct PumpKicker {
    wake: Arc<Notify>,
}

impl PumpKicker {
    /// Request a tick at the next opportunity. Kicks before the loop starts
    /// waiting are remembered, repeated kicks coalesce.
    pub fn kick(&self) {
        self.wake.notify_one();
    }
}

/// Background autopump.
pub struct Autopump {
    db: Arc<Mutex<Database>>,
    clock: Arc<dyn Clock>,
    rng: std::sync::Mutex<Box<dyn RandomSource>>,
    kicker: PumpKicker,
    ticks_run: AtomicU64,
    /// Cadence from the last successful settings read.
    last_cadence_secs: AtomicI64,
}

impl Autopump {
    pub fn new(
        db: Arc<Mutex<Database>>,
        clock: Arc<dyn Clock>,
        rng: Box<dyn RandomSource>,
    ) -> Self {
        Self {
            db,
            clock,
            rng: std::sync::Mutex::new(rng),
            kicker: PumpKicker::default(),
            ticks_run: AtomicU64::new(0),
            last_cadence_secs: AtomicI64::new(DEFAULT_INTERVAL_SECONDS),
        }
    }

    /// Pump driven by the system clock and the thread-local RNG.
    pub fn with_system_defaults(db: Arc<Mutex<Database>>) -> Self {
        Self::new(db, Arc::new(SystemClock), Box::new(ThreadRandom))
    }

    pub fn kicker(&self) -> PumpKicker {
        self.kicker.clone()
    }

    /// Number of ticks evaluated so far, including disabled polls.
    pub fn ticks_run(&self) -> u64 {
        self.ticks_run.load(Ordering::Relaxed)
    }

    /// Run the tick loop (call from a tokio::spawn).
    ///
    /// The loop exits cooperatively when `cancel` is triggered.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        info!("Autopump daemon started");

        loop {
            let report = self.tick().await;
            debug!(
                state = ?report.state,
                next_delay_secs = report.next_delay.as_secs(),
                changed = report.changes.len(),
                "Autopump tick finished"
            );

            tokio::select! {
                _ = tokio::time::sleep(report.next_delay) => {}
                _ = self.kicker.wake.notified() => {
                    debug!("Autopump kicked, ticking early");
                }
                _ = cancel.cancelled() => {
                    info!("Autopump daemon shutting down");
                    return Ok(());
                }
            }
        }
    }

    /// Evaluate and commit one tick.
    ///
    /// Never fails: storage errors are logged and the report carries no
    /// changes, leaving the next tick to reconcile from fresh state. Within
    /// one process the database lock is held from the settings read through
    /// the commit. Ticks from other connections are caught at commit time,
    /// when the stored stamps no longer match the ones evaluated here.
    pub async fn tick(&self) -> TickReport {
        self.ticks_run.fetch_add(1, Ordering::Relaxed);
        let db = self.db.lock().await;

        let settings = match db.load_settings() {
            Ok(settings) => settings,
            Err(e) => {
                warn!("Autopump could not read settings: {e:#}");
                let cadence = self.last_cadence_secs.load(Ordering::Relaxed);
                return TickReport::idle(PumpState::DisabledPoll, cadence);
            }
        };

        let cadence = settings
            .as_ref()
            .map(AutopumpSettings::min_interval_seconds)
            .unwrap_or(DEFAULT_INTERVAL_SECONDS);
        self.last_cadence_secs.store(cadence, Ordering::Relaxed);

        let settings = match settings {
            Some(s) if s.enabled => s,
            _ => {
                debug!("Autopump disabled, polling again in {cadence}s");
                return TickReport::idle(PumpState::DisabledPoll, cadence);
            }
        };

        let stats = match db.stats() {
            Ok(stats) => stats,
            Err(e) => {
                warn!("Autopump could not read global stats: {e:#}");
                return TickReport::idle(PumpState::Armed, cadence);
            }
        };

        let now_ms = self.clock.now_ms();
        let changes = {
            let mut rng = self.rng.lock().unwrap_or_else(|p| p.into_inner());
            evaluate_metrics(&settings, &stats, now_ms, &mut **rng)
        };

        if changes.is_empty() {
            return TickReport::idle(PumpState::Armed, cadence);
        }

        let tick_id = ulid::Ulid::new().to_string();
        if let Err(e) = db.apply_tick(&tick_id, &changes) {
            match DashboardError::from(e) {
                err if err.is_transient() => warn!("Autopump tick lost a write race: {err}"),
                err => error!("Autopump tick failed to commit: {err}"),
            }
            return TickReport::idle(PumpState::Armed, cadence);
        }

        for change in &changes {
            info!(
                metric = %change.metric,
                from = change.previous,
                to = change.value,
                "Autopump increment"
            );
        }

        TickReport {
            state: PumpState::Armed,
            next_delay: cadence_delay(cadence),
            changes,
        }
    }
}

impl TickReport {
    fn idle(state: PumpState, cadence_secs: i64) -> Self {
        Self {
            state,
            next_delay: cadence_delay(cadence_secs),
            changes: Vec::new(),
        }
    }
}

fn cadence_delay(secs: i64) -> Duration {
    Duration::from_secs(secs.max(1).unsigned_abs())
}

/// Run the increment policy for every metric against one snapshot.
fn evaluate_metrics(
    settings: &AutopumpSettings,
    stats: &GlobalStats,
    now_ms: i64,
    rng: &mut dyn RandomSource,
) -> Vec<MetricChange> {
    let mut changes = Vec::new();
    for metric in Metric::ALL {
        let current = stats.get(metric);
        let config = settings.metric(metric);
        match policy::evaluate(config, current, now_ms, rng) {
            Decision::Fire { value, at_ms, .. } => changes.push(MetricChange {
                metric,
                previous: current,
                value,
                ticked_at_ms: at_ms,
                last_tick_at_ms: config.last_tick_at_ms,
            }),
            Decision::Waiting { remaining_ms } => {
                debug!("{metric} not due for another {remaining_ms}ms");
            }
            Decision::Disabled => {}
        }
    }
    changes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pump::clock::ManualClock;
    use crate::pump::policy::SeededRandom;

    fn conversations_every_10s() -> SettingsUpdate {
        SettingsUpdate {
            enabled: true,
            conversations: MetricTuning {
                min_step: 1,
                max_step: 1,
                interval_seconds: 10,
                cap: 0,
            },
            ..SettingsUpdate::default()
        }
    }

    fn pump_at(start_ms: i64) -> (Autopump, Arc<ManualClock>, Arc<Mutex<Database>>) {
        let db = Arc::new(Mutex::new(Database::open_memory().unwrap()));
        let clock = Arc::new(ManualClock::new(start_ms));
        let pump = Autopump::new(db.clone(), clock.clone(), Box::new(SeededRandom::new(1)));
        (pump, clock, db)
    }

    #[tokio::test]
    async fn unconfigured_pump_polls_without_writing() {
        let (pump, clock, db) = pump_at(1_700_000_000_000);
        for _ in 0..5 {
            let report = pump.tick().await;
            assert_eq!(report.state, PumpState::DisabledPoll);
            assert_eq!(report.next_delay, Duration::from_secs(10));
            assert!(report.changes.is_empty());
            clock.advance_secs(10);
        }
        let db = db.lock().await;
        assert!(db.load_settings().unwrap().is_none());
        assert!(db.load_stats().unwrap().is_none());
    }

    #[tokio::test]
    async fn disabled_pump_never_changes_totals() {
        let (pump, clock, db) = pump_at(1_700_000_000_000);
        {
            let db = db.lock().await;
            let mut update = conversations_every_10s();
            update.enabled = false;
            update.revenue.interval_seconds = 3;
            db.write_settings(&update, 180).unwrap();
        }
        for _ in 0..20 {
            let report = pump.tick().await;
            assert_eq!(report.state, PumpState::DisabledPoll);
            assert_eq!(report.next_delay, Duration::from_secs(3));
            clock.advance_secs(60);
        }
        assert_eq!(db.lock().await.stats().unwrap(), GlobalStats::default());
        assert_eq!(pump.ticks_run(), 20);
    }

    #[tokio::test]
    async fn twenty_five_seconds_yields_two_increments() {
        let (pump, clock, db) = pump_at(0);
        db.lock()
            .await
            .write_settings(&conversations_every_10s(), 180)
            .unwrap();

        // Ticks every 5s from t=0 through t=25s.
        for _ in 0..=5 {
            pump.tick().await;
            clock.advance_secs(5);
        }

        let stats = db.lock().await.stats().unwrap();
        assert_eq!(stats.conversations, 2);
        assert_eq!(stats.accounts, 0);
        assert_eq!(stats.revenue, 0);
    }

    #[tokio::test]
    async fn zero_max_step_metric_is_untouched_while_others_pump() {
        let (pump, clock, db) = pump_at(0);
        {
            let db = db.lock().await;
            let mut update = conversations_every_10s();
            update.accounts = MetricTuning {
                min_step: 4,
                max_step: 0,
                interval_seconds: 1,
                cap: 0,
            };
            db.write_settings(&update, 180).unwrap();
        }
        for _ in 0..10 {
            clock.advance_secs(10);
            pump.tick().await;
        }
        let stats = db.lock().await.stats().unwrap();
        assert_eq!(stats.conversations, 10);
        assert_eq!(stats.accounts, 0);
    }

    #[tokio::test]
    async fn duplicate_ticks_do_not_double_increment() {
        let (pump, clock, db) = pump_at(0);
        db.lock()
            .await
            .write_settings(&conversations_every_10s(), 180)
            .unwrap();
        clock.set(10_000);

        let pump = Arc::new(pump);
        let (a, b) = tokio::join!(pump.tick(), pump.tick());
        assert_eq!(a.changes.len() + b.changes.len(), 1);
        assert_eq!(db.lock().await.stats().unwrap().conversations, 1);
    }

    #[tokio::test]
    async fn capped_metric_keeps_stamping_at_the_cap() {
        let (pump, clock, db) = pump_at(0);
        {
            let db = db.lock().await;
            let mut update = conversations_every_10s();
            update.conversations.min_step = 3;
            update.conversations.max_step = 3;
            update.conversations.cap = 4;
            db.write_settings(&update, 180).unwrap();
        }
        for _ in 0..4 {
            clock.advance_secs(10);
            let report = pump.tick().await;
            assert_eq!(report.changes.len(), 1);
        }
        let db = db.lock().await;
        assert_eq!(db.stats().unwrap().conversations, 4);
        assert_eq!(
            db.settings().unwrap().conversations.last_tick_at_ms,
            Some(40_000)
        );
        assert_eq!(db.tick_count().unwrap(), 4);
    }

    /// Pump over a file-backed handle that gives up on a held lock quickly.
    fn file_pump(
        path: &std::path::Path,
        start_ms: i64,
    ) -> (Autopump, Arc<ManualClock>, Arc<Mutex<Database>>) {
        let db = Database::open(path).unwrap();
        db.set_busy_timeout(Duration::from_millis(50)).unwrap();
        let db = Arc::new(Mutex::new(db));
        let clock = Arc::new(ManualClock::new(start_ms));
        let pump = Autopump::new(db.clone(), clock.clone(), Box::new(SeededRandom::new(7)));
        (pump, clock, db)
    }

    #[tokio::test]
    async fn commit_blocked_by_another_writer_is_retried_next_tick() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.db");
        let (pump, _clock, db) = file_pump(&path, 10_000);
        db.lock()
            .await
            .write_settings(&conversations_every_10s(), 180)
            .unwrap();

        let other = rusqlite::Connection::open(&path).unwrap();
        other.execute_batch("BEGIN IMMEDIATE;").unwrap();

        let report = pump.tick().await;
        assert_eq!(report.state, PumpState::Armed);
        assert!(report.changes.is_empty());
        assert_eq!(report.next_delay, Duration::from_secs(10));

        other.execute_batch("ROLLBACK;").unwrap();

        let report = pump.tick().await;
        assert_eq!(report.changes.len(), 1);
        let db = db.lock().await;
        assert_eq!(db.stats().unwrap().conversations, 1);
        assert_eq!(db.tick_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn unreadable_stats_keep_cadence_and_recover() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.db");
        let (pump, _clock, db) = file_pump(&path, 10_000);
        {
            let db = db.lock().await;
            let mut update = conversations_every_10s();
            update.accounts.interval_seconds = 4;
            db.write_settings(&update, 180).unwrap();
        }

        let other = rusqlite::Connection::open(&path).unwrap();
        other.execute_batch("DROP TABLE global_stats;").unwrap();

        let report = pump.tick().await;
        assert_eq!(report.state, PumpState::Armed);
        assert!(report.changes.is_empty());
        assert_eq!(report.next_delay, Duration::from_secs(4));

        other
            .execute_batch(crate::state::schema::CREATE_SCHEMA)
            .unwrap();

        let report = pump.tick().await;
        assert_eq!(report.changes.len(), 1);
        assert_eq!(db.lock().await.stats().unwrap().conversations, 1);
    }

    #[tokio::test]
    async fn unreadable_settings_reuse_last_known_cadence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.db");
        let (pump, _clock, db) = file_pump(&path, 0);
        {
            let db = db.lock().await;
            let mut update = conversations_every_10s();
            update.enabled = false;
            update.revenue.interval_seconds = 3;
            db.write_settings(&update, 180).unwrap();
        }
        assert_eq!(pump.tick().await.next_delay, Duration::from_secs(3));

        let other = rusqlite::Connection::open(&path).unwrap();
        other.execute_batch("DROP TABLE autopump_settings;").unwrap();

        let report = pump.tick().await;
        assert_eq!(report.state, PumpState::DisabledPoll);
        assert!(report.changes.is_empty());
        assert_eq!(report.next_delay, Duration::from_secs(3));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn pumps_on_separate_connections_never_double_increment() {
        let dir = tempfile::tempdir().unwrap();
        for trial in 0..20 {
            let path = dir.path().join(format!("state-{trial}.db"));
            let (a, _clock_a, db) = file_pump(&path, 10_000);
            let (b, _clock_b, db_b) = file_pump(&path, 10_000);
            for handle in [&db, &db_b] {
                handle
                    .lock()
                    .await
                    .set_busy_timeout(Duration::from_secs(5))
                    .unwrap();
            }
            db.lock()
                .await
                .write_settings(&conversations_every_10s(), 180)
                .unwrap();

            let ta = tokio::spawn(async move { a.tick().await });
            let tb = tokio::spawn(async move { b.tick().await });
            let (ra, rb) = (ta.await.unwrap(), tb.await.unwrap());

            assert!(ra.changes.len() + rb.changes.len() <= 1, "trial {trial}");
            assert_eq!(db.lock().await.stats().unwrap().conversations, 1, "trial {trial}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn run_loop_keeps_polling_and_stops_on_cancel() {
        let (pump, _clock, _db) = pump_at(0);
        let pump = Arc::new(pump);
        let cancel = CancellationToken::new();

        let handle = {
            let pump = pump.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { pump.run(cancel).await })
        };

        tokio::time::sleep(Duration::from_secs(35)).await;
        // Ticks at t=0, 10, 20 and 30.
        assert_eq!(pump.ticks_run(), 4);

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn kick_triggers_an_early_tick() {
        let (pump, _clock, _db) = pump_at(0);
        let pump = Arc::new(pump);
        let cancel = CancellationToken::new();
        let kicker = pump.kicker();

        let handle = {
            let pump = pump.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { pump.run(cancel).await })
        };

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(pump.ticks_run(), 1);

        kicker.kick();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(pump.ticks_run(), 2);

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }
}
