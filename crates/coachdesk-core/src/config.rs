//! CoachDesk configuration system.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::{CoachDeskError, Result};

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoachDeskConfig {
    /// SQLite database holding the dashboard tables and the dispatch ledger.
    #[serde(default = "default_database_path")]
    pub database_path: String,
    #[serde(default)]
    pub automation: AutomationConfig,
    #[serde(default)]
    pub channel: ChannelConfig,
    /// Message templates keyed by template reference.
    #[serde(default)]
    pub templates: BTreeMap<String, TemplateConfig>,
}

fn default_database_path() -> String { "~/.coachdesk/coachdesk.db".into() }

impl Default for CoachDeskConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            automation: AutomationConfig::default(),
            channel: ChannelConfig::default(),
            templates: BTreeMap::new(),
        }
    }
}

impl CoachDeskConfig {
    /// Load config from the default path (~/.coachdesk/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| CoachDeskError::Config(format!("Failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| CoachDeskError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to the default path.
    pub fn save(&self) -> Result<()> {
        let path = Self::default_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| CoachDeskError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(&path, content)?;
        Ok(())
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.automation.sweep_interval_secs == 0 {
            return Err(CoachDeskError::Config("automation.sweep_interval_secs must be > 0".into()));
        }
        if self.automation.concurrency == 0 {
            return Err(CoachDeskError::Config("automation.concurrency must be > 0".into()));
        }
        if self.automation.manual_max_per_day == 0 {
            return Err(CoachDeskError::Config("automation.manual_max_per_day must be > 0".into()));
        }
        Ok(())
    }

    /// Database path with `~` expanded.
    pub fn database_file(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.database_path).to_string())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the CoachDesk home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".coachdesk")
    }
}

/// Automation engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutomationConfig {
    /// Seconds between scheduled sweeps. Also the look-back tolerance for
    /// threshold-crossing triggers, so each sweep only sees new occasions.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    /// Max concurrent per-recipient pipelines (bounds outbound channel calls).
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Daily cap for raw-message bulk sends that are not tied to a rule.
    #[serde(default = "default_manual_max_per_day")]
    pub manual_max_per_day: u32,
    /// Age after which a still-reserved record is reported as stale.
    #[serde(default = "default_stale_reservation")]
    pub stale_reservation_secs: u64,
}

fn default_sweep_interval() -> u64 { 300 }
fn default_concurrency() -> usize { 8 }
fn default_manual_max_per_day() -> u32 { 3 }
fn default_stale_reservation() -> u64 { 900 }

impl Default for AutomationConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_sweep_interval(),
            concurrency: default_concurrency(),
            manual_max_per_day: default_manual_max_per_day(),
            stale_reservation_secs: default_stale_reservation(),
        }
    }
}

/// Outbound channel configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// "log", "webhook" or "telegram".
    #[serde(default = "default_channel_kind")]
    pub kind: String,
    #[serde(default)]
    pub webhook_url: String,
    #[serde(default)]
    pub webhook_headers: Vec<(String, String)>,
    #[serde(default)]
    pub telegram_bot_token: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

fn default_channel_kind() -> String { "log".into() }
fn default_timeout() -> u64 { 10 }

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            kind: default_channel_kind(),
            webhook_url: String::new(),
            webhook_headers: vec![],
            telegram_bot_token: String::new(),
            timeout_secs: default_timeout(),
        }
    }
}

/// A message template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateConfig {
    #[serde(default)]
    pub subject: String,
    pub body: String,
}
