use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_database_url")]
    pub database_url: String,
    #[serde(default)]
    pub workers: Workers,
    #[serde(default)]
    pub gmail: GmailConfig,
    /// Absent section disables push delivery and the reminder worker.
    pub fcm: Option<FcmConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workers {
    #[serde(default = "default_wake_interval")]
    pub wake_interval_secs: u64,
    #[serde(default = "default_reminder_interval")]
    pub reminder_interval_secs: u64,
    /// Cap on concurrent notification-enrichment tasks.
    #[serde(default = "default_enrichment_concurrency")]
    pub enrichment_concurrency: usize,
    /// Bound on any single mailbox fetch or push dispatch call.
    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_secs: u64,
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GmailConfig {
    /// OAuth client credentials file. When missing, label sync and
    /// notification enrichment are disabled at startup.
    #[serde(default = "default_credentials_path")]
    pub credentials_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FcmConfig {
    pub server_key: String,
}

fn default_database_url() -> String {
    "sqlite:mailboard.db?mode=rwc".to_string()
}

fn default_wake_interval() -> u64 {
    60
}

fn default_reminder_interval() -> u64 {
    60
}

fn default_enrichment_concurrency() -> usize {
    8
}

fn default_fetch_timeout() -> u64 {
    10
}

fn default_event_buffer() -> usize {
    256
}

fn default_credentials_path() -> String {
    "credentials.json".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: default_database_url(),
            workers: Workers::default(),
            gmail: GmailConfig::default(),
            fcm: None,
        }
    }
}

impl Default for Workers {
    fn default() -> Self {
        Self {
            wake_interval_secs: default_wake_interval(),
            reminder_interval_secs: default_reminder_interval(),
            enrichment_concurrency: default_enrichment_concurrency(),
            fetch_timeout_secs: default_fetch_timeout(),
            event_buffer: default_event_buffer(),
        }
    }
}

impl Default for GmailConfig {
    fn default() -> Self {
        Self {
            credentials_path: default_credentials_path(),
        }
    }
}

impl Config {
    pub fn load() -> Self {
        Self::load_from("settings.toml")
    }

    pub fn load_from<P: AsRef<Path>>(path: P) -> Self {
        match fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => config,
                Err(err) => {
                    warn!(error = %err, "settings file is invalid, falling back to defaults");
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }
}
