pub mod schema;

pub use schema::AutopumpConfig;

use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Environment variable that relocates the autopump home directory.
pub const HOME_ENV: &str = "AUTOPUMP_HOME";

/// Widest real-world UTC offset, in minutes.
const MAX_OFFSET_MINUTES: i64 = 14 * 60;

/// Autopump home directory: `$AUTOPUMP_HOME`, else `~/.autopump`.
pub fn default_home_dir() -> PathBuf {
    home_dir_from(std::env::var(HOME_ENV).ok())
}

fn home_dir_from(env_home: Option<String>) -> PathBuf {
    if let Some(home) = env_home.filter(|h| !h.trim().is_empty()) {
        return PathBuf::from(shellexpand::tilde(&home).into_owned());
    }
    directories::BaseDirs::new()
        .map(|d| d.home_dir().join(".autopump"))
        .unwrap_or_else(|| PathBuf::from(".autopump"))
}

/// Load `autopump.toml` from `path`, or defaults if the file is absent.
pub fn load_config(path: &Path) -> Result<AutopumpConfig> {
    if !path.exists() {
        return Ok(AutopumpConfig::default());
    }

    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let config: AutopumpConfig = toml::from_str(&contents)
        .with_context(|| format!("Failed to parse {} (TOML)", path.display()))?;
    validate(&config).with_context(|| format!("Invalid config in {}", path.display()))?;

    if config.admin_emails.is_empty() && config.admin_roles.is_empty() {
        warn!(
            "{} lists no admin_emails or admin_roles; every gated write will be rejected",
            path.display()
        );
    }
    Ok(config)
}

fn validate(config: &AutopumpConfig) -> Result<()> {
    if config.timezone_offset_minutes.abs() > MAX_OFFSET_MINUTES {
        bail!(
            "timezone_offset_minutes = {} is outside +/-{MAX_OFFSET_MINUTES}",
            config.timezone_offset_minutes
        );
    }
    if config.db_path.trim().is_empty() {
        bail!("db_path must not be empty");
    }
    Ok(())
}

/// Write `config` to `path` as TOML, creating parent directories.
pub fn save_config(config: &AutopumpConfig, path: &Path) -> Result<()> {
    let contents = toml::to_string_pretty(config).context("Failed to serialize autopump config")?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, contents)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}
