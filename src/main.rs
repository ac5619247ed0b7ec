//! Autopump — dashboard counter store and growth daemon.
//!
//! Usage:
//!   autopump run                     Run the autopump daemon until Ctrl+C
//!   autopump status                  Show settings, totals and the last tick
//!   autopump configure --file F      Replace autopump settings (admin)
//!   autopump set-totals ...          Overwrite the running totals (admin)
//!   autopump set-day --date D ...    Overwrite one day's totals (admin)
//!   autopump tick                    Run a single tick and exit

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use autopump::auth::ConfiguredAdmins;
use autopump::config::{self, AutopumpConfig};
use autopump::pump::{Autopump, PumpState, TickReport};
use autopump::service::StatsService;
use autopump::state::Database;
use autopump::types::*;

// ---------------------------------------------------------------------------
// CLI definition
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "autopump")]
#[command(version = "0.1.0")]
#[command(about = "Dashboard counters with a self-rescheduling autopump")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to autopump home directory (defaults to $AUTOPUMP_HOME, then ~/.autopump).
    #[arg(long)]
    home: Option<String>,

    /// Log level (debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Identity presented to the admin gate.
#[derive(Args, Debug)]
struct CallerArgs {
    /// Caller email.
    #[arg(long = "as")]
    as_email: Option<String>,

    /// Role claims held by the caller (repeatable).
    #[arg(long = "role")]
    roles: Vec<String>,
}

impl CallerArgs {
    fn identity(&self) -> CallerIdentity {
        CallerIdentity {
            subject: self.as_email.clone().unwrap_or_else(|| "cli".into()),
            email: self.as_email.clone(),
            roles: self.roles.clone(),
        }
    }
}

#[derive(Args, Debug)]
struct TotalsArgs {
    #[arg(long)]
    conversations: i64,
    #[arg(long)]
    accounts: i64,
    #[arg(long)]
    revenue: i64,
}

impl TotalsArgs {
    fn stats(&self) -> GlobalStats {
        GlobalStats {
            conversations: self.conversations,
            accounts: self.accounts,
            revenue: self.revenue,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the autopump daemon.
    Run,

    /// Show current settings and totals.
    Status,

    /// Replace autopump settings from a TOML file, then tick once.
    Configure {
        /// TOML file with a settings update.
        #[arg(long)]
        file: PathBuf,
        #[command(flatten)]
        caller: CallerArgs,
    },

    /// Overwrite the running totals.
    SetTotals {
        #[command(flatten)]
        totals: TotalsArgs,
        #[command(flatten)]
        caller: CallerArgs,
    },

    /// Overwrite the totals recorded for one date.
    SetDay {
        /// Date as YYYY-MM-DD.
        #[arg(long)]
        date: String,
        #[command(flatten)]
        totals: TotalsArgs,
        #[command(flatten)]
        caller: CallerArgs,
    },

    /// Run a single autopump tick and print what changed.
    Tick,
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    let home_dir = match &cli.home {
        Some(home) => PathBuf::from(shellexpand::tilde(home).into_owned()),
        None => config::default_home_dir(),
    };

    let runtime = bootstrap(&home_dir)?;

    match cli.command {
        Commands::Run => cmd_run(runtime).await,
        Commands::Status => cmd_status(runtime).await,
        Commands::Configure { file, caller } => cmd_configure(runtime, &file, &caller).await,
        Commands::SetTotals { totals, caller } => {
            let id = runtime
                .service
                .manual_set_aggregate(&caller.identity(), &totals.stats())
                .await?;
            println!("{} Totals written (record {})", ">>>".green().bold(), id);
            Ok(())
        }
        Commands::SetDay {
            date,
            totals,
            caller,
        } => {
            let id = runtime
                .service
                .set_stats_for_date(&caller.identity(), &date, &totals.stats())
                .await?;
            println!("{} Totals for {} written (record {})", ">>>".green().bold(), date, id);
            Ok(())
        }
        Commands::Tick => {
            let report = runtime.pump.tick().await;
            print_report(&report);
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// Command implementations
// ---------------------------------------------------------------------------

struct Runtime {
    config: AutopumpConfig,
    db: Arc<Mutex<Database>>,
    pump: Arc<Autopump>,
    service: StatsService,
}

async fn cmd_run(runtime: Runtime) -> Result<()> {
    println!("{} Starting autopump daemon ...", ">>>".green().bold());

    let cancel = CancellationToken::new();

    let pump = runtime.pump.clone();
    let pump_cancel = cancel.clone();
    let pump_handle = tokio::spawn(async move { pump.run(pump_cancel).await });

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;

    println!("\n{} Shutting down gracefully...", "<<<".red().bold());
    cancel.cancel();

    let shutdown_timeout = tokio::time::Duration::from_secs(runtime.config.shutdown_timeout_secs);
    match tokio::time::timeout(shutdown_timeout, pump_handle).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => warn!("Autopump daemon error: {}", e),
        Ok(Err(e)) => warn!("Autopump task join error: {}", e),
        Err(_) => warn!("Autopump did not stop within {:?}", shutdown_timeout),
    }

    info!("Daemon shutdown complete");
    Ok(())
}

async fn cmd_status(runtime: Runtime) -> Result<()> {
    let settings = runtime.service.get_settings().await?;
    let stats = runtime.service.get_aggregate().await?;
    let now_ms = chrono::Utc::now().timestamp_millis();
    let today = runtime.service.today_key(now_ms).await?;
    let today_stats = runtime.service.get_stats_for_date(&today).await?;
    let (latest, tick_count) = {
        let db = runtime.db.lock().await;
        (db.latest_tick()?, db.tick_count()?)
    };

    println!();
    println!("{}", "=== Autopump Status ===".bold());
    println!();
    println!(
        "  {}:  {}",
        "Pump".bold(),
        if settings.enabled {
            "enabled".green().to_string()
        } else {
            "disabled".yellow().to_string()
        }
    );
    println!("  {}:  every {}s", "Cadence".bold(), settings.min_interval_seconds());
    println!();
    println!("  {}:", "Totals".bold());
    for metric in Metric::ALL {
        let cfg = settings.metric(metric);
        let cap = if cfg.cap > 0 {
            cfg.cap.to_string()
        } else {
            "none".dimmed().to_string()
        };
        println!(
            "    {:<14} {:>10}   step {}..{} every {}s, cap {}, last {}",
            metric.to_string(),
            stats.get(metric),
            cfg.min_step,
            cfg.max_step,
            cfg.interval_seconds,
            cap,
            format_tick(cfg.last_tick_at_ms),
        );
    }
    println!();
    match today_stats {
        Some(day) => println!(
            "  {} ({}):  {} conversations, {} accounts, {} revenue",
            "Today".bold(),
            day.date,
            day.conversations,
            day.accounts,
            day.revenue
        ),
        None => println!("  {} ({}):  {}", "Today".bold(), today, "no entry".dimmed()),
    }
    println!(
        "  {}:  {} applied, last {}",
        "Ticks".bold(),
        tick_count,
        format_tick(latest.map(|t| t.ticked_at_ms)),
    );
    println!();

    Ok(())
}

async fn cmd_configure(runtime: Runtime, file: &Path, caller: &CallerArgs) -> Result<()> {
    let contents = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read settings file {}", file.display()))?;
    let update: SettingsUpdate =
        toml::from_str(&contents).context("Failed to parse settings update (TOML)")?;

    runtime
        .service
        .update_settings(&caller.identity(), &update)
        .await?;
    println!("{} Settings updated", ">>>".green().bold());

    // No daemon in this process to receive the kick.
    let report = runtime.pump.tick().await;
    print_report(&report);
    Ok(())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Load config, open the database and wire the pump and service together.
fn bootstrap(home_dir: &Path) -> Result<Runtime> {
    if !home_dir.exists() {
        std::fs::create_dir_all(home_dir).with_context(|| {
            format!("Failed to create home directory: {}", home_dir.display())
        })?;
    }

    let config_path = home_dir.join("autopump.toml");
    if !config_path.exists() {
        eprintln!(
            "{} No config at {:?}; writing defaults. Add admin_emails to allow writes.",
            "Note:".yellow().bold(),
            config_path
        );
        config::save_config(&AutopumpConfig::default(), &config_path)?;
    }

    let cfg = config::load_config(&config_path)?;

    let db_path = cfg.resolved_db_path();
    let db_path = Path::new(&db_path);
    let db = Database::open(db_path)
        .with_context(|| format!("Failed to open database at {}", db_path.display()))?;
    let db = Arc::new(Mutex::new(db));

    let pump = Arc::new(Autopump::with_system_defaults(db.clone()));
    let gate = Arc::new(ConfiguredAdmins::from_config(&cfg));
    let service = StatsService::new(
        db.clone(),
        gate,
        pump.kicker(),
        cfg.timezone_offset_minutes,
    );

    Ok(Runtime {
        config: cfg,
        db,
        pump,
        service,
    })
}

fn format_tick(at_ms: Option<i64>) -> String {
    at_ms
        .and_then(chrono::DateTime::from_timestamp_millis)
        .map(|d| d.to_rfc3339())
        .unwrap_or_else(|| "never".dimmed().to_string())
}

fn print_report(report: &TickReport) {
    let state = match report.state {
        PumpState::Armed => "armed".green(),
        PumpState::DisabledPoll => "disabled".yellow(),
    };
    println!(
        "  Tick: {} ({} changed), next in {}s",
        state,
        report.changes.len(),
        report.next_delay.as_secs()
    );
    for change in &report.changes {
        println!(
            "    {:<14} {} -> {}",
            change.metric.to_string(),
            change.previous,
            change.value
        );
    }
}
