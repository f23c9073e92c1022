//! Logger settings: an optional TOML file (`LOGGER_CONFIG`, default
//! `logger.toml`) overlaid with environment variables.
//!
//! Everything is read through a lookup closure so tests never touch the
//! process environment.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::message::{is_valid_filter, TopicMap};

const DEFAULT_CONFIG_PATH: &str = "logger.toml";

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub topics: Vec<TopicEntry>,
    #[serde(default)]
    pub retry: RetryPolicy,
    pub dead_letter_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TopicEntry {
    /// Exact topic or MQTT filter (`+` / `#`).
    pub topic: String,
    pub event_type: String,
}

/// Storage retry schedule: `attempts` tries in total, waiting
/// `base_delay_ms`, then doubling up to `max_delay_ms` between tries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            base_delay_ms: 200,
            max_delay_ms: 5_000,
        }
    }
}

impl RetryPolicy {
    /// Delay after failed attempt number `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(20);
        Duration::from_millis(self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms))
    }
}

// ---------------------------------------------------------------------------
// Resolved settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Settings {
    pub mqtt_host: Option<String>,
    pub mqtt_port: u16,
    pub mqtt_client_id: String,
    pub credentials: Option<(String, String)>,
    pub db_url: Option<String>,
    pub topics: TopicMap,
    pub retry: RetryPolicy,
    pub dead_letter_path: Option<PathBuf>,
}

impl Settings {
    /// Read the config file (if any) and overlay the environment.
    ///
    /// A missing default `logger.toml` is fine; a missing file that was
    /// named explicitly through `LOGGER_CONFIG` is an error.
    pub fn load(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let file = match var("LOGGER_CONFIG") {
            Some(path) => read_file(Path::new(&path))?,
            None if Path::new(DEFAULT_CONFIG_PATH).exists() => {
                read_file(Path::new(DEFAULT_CONFIG_PATH))?
            }
            None => FileConfig::default(),
        };
        Self::from_parts(file, var)
    }

    pub fn from_parts(file: FileConfig, var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut entries: Vec<(String, String)> = file
            .topics
            .into_iter()
            .map(|t| (t.topic, t.event_type))
            .collect();
        for (key, event_type) in [("AIRCON_TOPIC", "aircon"), ("IRRIGATION_TOPIC", "irrigation")] {
            if let Some(topic) = var(key).filter(|t| !t.trim().is_empty()) {
                entries.push((topic, event_type.to_string()));
            }
        }

        let credentials = var("MQTT_USERNAME").map(|user| (user, var("MQTT_PASSWORD").unwrap_or_default()));

        let settings = Self {
            mqtt_host: var("MQTT_HOST").filter(|h| !h.trim().is_empty()),
            mqtt_port: var("MQTT_PORT")
                .and_then(|s| s.parse().ok())
                .unwrap_or(1883),
            mqtt_client_id: var("MQTT_CLIENT_ID")
                .unwrap_or_else(|| "irrigation-logger".to_string()),
            credentials,
            db_url: var("DB_URL")
                .or_else(|| var("DATABASE_URL"))
                .filter(|u| !u.trim().is_empty()),
            topics: TopicMap::new(entries),
            retry: file.retry,
            dead_letter_path: var("DEAD_LETTER_PATH")
                .map(PathBuf::from)
                .or(file.dead_letter_path),
        };
        settings.validate()?;
        Ok(settings)
    }

    /// Reject malformed entries. Every violation is reported at once.
    fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        for (filter, event_type) in self.topics.entries() {
            if !is_valid_filter(filter) {
                errors.push(format!("topic '{filter}': not a valid MQTT topic filter"));
            }
            if event_type.trim().is_empty() {
                errors.push(format!("topic '{filter}': event_type is empty"));
            }
        }

        if self.retry.attempts == 0 {
            errors.push("retry.attempts must be at least 1".to_string());
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            errors.push(format!(
                "retry.base_delay_ms ({}) exceeds retry.max_delay_ms ({})",
                self.retry.base_delay_ms, self.retry.max_delay_ms
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    /// Reasons the logger cannot run with these settings. Empty means ready.
    pub fn missing(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.topics.is_empty() {
            missing.push("no topics configured (AIRCON_TOPIC, IRRIGATION_TOPIC or [[topics]])");
        }
        if self.mqtt_host.is_none() {
            missing.push("MQTT_HOST not set");
        }
        if self.db_url.is_none() {
            missing.push("DB_URL not set");
        }
        missing
    }
}

fn read_file(path: &Path) -> Result<FileConfig> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config: {}", path.display()))?;
    toml::from_str(&contents).with_context(|| format!("failed to parse config: {}", path.display()))
}

// ===========================================================================
// Tests
// ===========================================================================
