//! Configuration loading
//!
//! Settings come from a TOML file with environment-variable overrides on
//! top; the environment wins so secrets never need to live on disk. The
//! default file location is the platform config directory
//! (`cardsink/cardsink.toml`).

use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file unreadable: {0}")]
    Unreadable(String),

    #[error("config file invalid: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server: ServerSettings,
    pub store: StoreSettings,
    pub source: SourceSettings,
    pub extractor: ExtractorSettings,
    pub pipeline: PipelineSettings,
    pub retry: RetrySettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub bind_addr: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8385".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    /// Path of the analytical store database file.
    pub database_path: PathBuf,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("cardsink.db"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SourceSettings {
    pub api_base: String,
    pub api_key: String,
    pub api_token: String,
    /// Public URL the platform delivers notifications to.
    pub callback_url: String,
    pub fetch_timeout_s: u64,
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self {
            api_base: "https://api.trello.com/1".to_string(),
            api_key: String::new(),
            api_token: String::new(),
            callback_url: String::new(),
            fetch_timeout_s: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExtractorSettings {
    pub api_base: String,
    pub api_key: String,
    pub model_id: String,
    pub timeout_s: u64,
    /// Hard cap on extractor input size, in bytes.
    pub max_input_length: usize,
}

impl Default for ExtractorSettings {
    fn default() -> Self {
        Self {
            api_base: "https://generativelanguage.googleapis.com".to_string(),
            api_key: String::new(),
            model_id: "gemini-2.5-flash-lite".to_string(),
            timeout_s: 300,
            max_input_length: 10_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    pub worker_concurrency: usize,
    pub channel_capacity: usize,
    pub overflow_log_path: PathBuf,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            worker_concurrency: 8,
            channel_capacity: 256,
            overflow_log_path: PathBuf::from("cardsink-overflow.jsonl"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub tick_s: u64,
    pub base_s: i64,
    pub max_attempts: i64,
    pub cap_s: i64,
    /// Age past which an unprocessed event with no open pending work is
    /// re-driven.
    pub stalled_after_s: i64,
    pub claim_batch: i64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            tick_s: 30,
            base_s: 60,
            max_attempts: 10,
            cap_s: 3600,
            stalled_after_s: 600,
            claim_batch: 50,
        }
    }
}

impl Settings {
    /// Load settings: defaults, then the TOML file if present, then
    /// environment overrides.
    pub fn load(explicit_path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = explicit_path
            .map(PathBuf::from)
            .or_else(default_config_path);

        let mut settings = match path {
            Some(ref p) if p.exists() => {
                let content = std::fs::read_to_string(p)
                    .map_err(|e| ConfigError::Unreadable(format!("{}: {e}", p.display())))?;
                let parsed: Settings = toml::from_str(&content)
                    .map_err(|e| ConfigError::Invalid(format!("{}: {e}", p.display())))?;
                info!("Loaded configuration from {}", p.display());
                parsed
            }
            Some(ref p) => {
                if explicit_path.is_some() {
                    return Err(ConfigError::Unreadable(format!(
                        "{}: file not found",
                        p.display()
                    )));
                }
                Settings::default()
            }
            None => Settings::default(),
        };

        settings.apply_env_overrides();
        settings.warn_on_missing_credentials();
        Ok(settings)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("CARDSINK_BIND_ADDR") {
            self.server.bind_addr = v;
        }
        if let Ok(v) = std::env::var("CARDSINK_DATABASE_PATH") {
            self.store.database_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("CARDSINK_SOURCE_API_KEY") {
            self.source.api_key = v;
        }
        if let Ok(v) = std::env::var("CARDSINK_SOURCE_API_TOKEN") {
            self.source.api_token = v;
        }
        if let Ok(v) = std::env::var("CARDSINK_CALLBACK_URL") {
            self.source.callback_url = v;
        }
        if let Ok(v) = std::env::var("CARDSINK_EXTRACTOR_API_KEY") {
            self.extractor.api_key = v;
        }
        if let Ok(v) = std::env::var("CARDSINK_EXTRACTOR_MODEL_ID") {
            self.extractor.model_id = v;
        }
    }

    fn warn_on_missing_credentials(&self) {
        if self.source.api_key.is_empty() || self.source.api_token.is_empty() {
            warn!(
                "Source platform credentials not configured; set CARDSINK_SOURCE_API_KEY / CARDSINK_SOURCE_API_TOKEN or the [source] section"
            );
        }
        if self.extractor.api_key.is_empty() {
            warn!("Extractor API key not configured; set CARDSINK_EXTRACTOR_API_KEY or [extractor] api_key");
        }
    }
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("cardsink").join("cardsink.toml"))
}
