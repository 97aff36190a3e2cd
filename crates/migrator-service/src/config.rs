use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use migrator_engine::{ValidatorSettings, MAX_BATCH_SIZE};
use serde::Deserialize;

pub const DEFAULT_TOPIC: &str = "inconsistent_interactive";

/// Runtime settings for one migrated table. Missing YAML keys keep their defaults.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MigratorConfig {
    pub bind: SocketAddr,
    pub src_db: PathBuf,
    pub dst_db: PathBuf,
    pub events_db: PathBuf,
    pub topic: String,
    pub batch_size: i64,
    pub query_timeout_ms: u64,
    pub fixer_poll_interval_ms: u64,
}

impl Default for MigratorConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 4020)),
            src_db: PathBuf::from("./src.sqlite3"),
            dst_db: PathBuf::from("./dst.sqlite3"),
            events_db: PathBuf::from("./events.sqlite3"),
            topic: DEFAULT_TOPIC.to_string(),
            batch_size: 100,
            query_timeout_ms: 1_000,
            fixer_poll_interval_ms: 500,
        }
    }
}

impl MigratorConfig {
    /// # Errors
    /// Returns an error when the YAML is malformed or the values are out of range.
    pub fn from_yaml(text: &str) -> Result<Self> {
        // An empty document deserializes to unit, not to an empty map.
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Self = serde_yaml::from_str(text).context("invalid migrator config")?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults when `path` is `None`.
    ///
    /// # Errors
    /// Returns an error when the file cannot be read or parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::from_yaml(&text).with_context(|| format!("failed to load config {}", path.display()))
    }

    /// # Errors
    /// Returns an error naming the first out-of-range value.
    pub fn validate(&self) -> Result<()> {
        if !(1..=MAX_BATCH_SIZE).contains(&self.batch_size) {
            bail!("batch_size must be between 1 and {MAX_BATCH_SIZE}, got {}", self.batch_size);
        }
        if self.query_timeout_ms == 0 {
            bail!("query_timeout_ms must be positive");
        }
        if self.topic.trim().is_empty() {
            bail!("topic must not be empty");
        }
        Ok(())
    }

    #[must_use]
    pub fn validator_settings(&self) -> ValidatorSettings {
        ValidatorSettings {
            batch_size: self.batch_size,
            query_timeout: Duration::from_millis(self.query_timeout_ms),
        }
    }

    #[must_use]
    pub fn fixer_poll_interval(&self) -> Duration {
        Duration::from_millis(self.fixer_poll_interval_ms)
    }
}
