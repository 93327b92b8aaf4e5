use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::suggestions::MAX_SUGGESTIONS;
use crate::transport::{Classifiers, ReconnectPolicy, StreamPolicy};

/// Environment variable overriding the configured base URL.
pub const BASE_URL_ENV: &str = "TUTOR_CHAT_BASE_URL";

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root of the tutor service, e.g. `https://api.example.com/prod`
    pub base_url: String,

    /// Use the server-push stream; otherwise single-shot requests only
    pub streaming: bool,

    /// Major classifier sent with every question
    pub major: String,

    /// Sub-field classifier sent with every question
    pub sub_field: String,

    pub followup_mode: FollowupMode,

    /// Number of follow-up questions to ask for
    pub suggest_count: u8,

    /// Retry a stalled stream over the single-shot transport
    pub fallback_on_stall: bool,

    /// Where the conversation id is persisted
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_path: Option<PathBuf>,

    pub timeouts: TimeoutConfig,
}

/// How follow-up questions are produced by the server
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum FollowupMode {
    Never,
    Single,
    #[default]
    Multi,
}

/// Timeout and reconnect settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Grace period for the first answer fragment after the stream opens
    pub stall_ms: u64,
    /// Absolute ceiling on one stream
    pub max_stream_secs: u64,
    /// End-to-end deadline of a single-shot request
    pub request_secs: u64,
    /// Base delay of the linear reconnect backoff
    pub reconnect_base_ms: u64,
    pub max_reconnects: u32,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            stall_ms: 5_000,
            max_stream_secs: 300,
            request_secs: 30,
            reconnect_base_ms: 1_000,
            max_reconnects: 2,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            base_url: "http://localhost:8000".to_string(),
            streaming: true,
            major: String::new(),
            sub_field: String::new(),
            followup_mode: FollowupMode::Multi,
            suggest_count: 3,
            fallback_on_stall: false,
            state_path: None,
            timeouts: TimeoutConfig::default(),
        }
    }
}

impl Config {
    /// Load `~/.tutor-chat/config.toml`, or defaults if it does not exist.
    pub fn load() -> Result<Self> {
        let path = Self::default_path()?;
        Self::load_from(&path)
    }

    /// Load configuration from an explicit file
    pub fn load_from(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file {}", path.display()))?
        } else {
            Config::default()
        };

        if let Ok(base_url) = std::env::var(BASE_URL_ENV) {
            if !base_url.trim().is_empty() {
                config.base_url = base_url;
            }
        }

        Ok(config)
    }

    /// Save configuration to file
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("Failed to create config directory")?;
        }
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, content).context("Failed to write config file")?;
        Ok(())
    }

    pub fn home_dir() -> Result<PathBuf> {
        let home = dirs::home_dir().context("Could not find home directory")?;
        Ok(home.join(".tutor-chat"))
    }

    pub fn default_path() -> Result<PathBuf> {
        Ok(Self::home_dir()?.join("config.toml"))
    }

    /// Persisted conversation state file
    pub fn state_path(&self) -> Result<PathBuf> {
        match &self.state_path {
            Some(path) => Ok(path.clone()),
            None => Ok(Self::home_dir()?.join("state.json")),
        }
    }

    /// Parsed base URL with trailing slashes removed
    pub fn base_url(&self) -> Result<Url> {
        let trimmed = self.base_url.trim().trim_end_matches('/');
        Url::parse(trimmed).with_context(|| format!("Invalid base URL: {}", self.base_url))
    }

    pub fn classifiers(&self) -> Classifiers {
        Classifiers {
            major: self.major.clone(),
            sub_field: self.sub_field.clone(),
        }
    }

    /// Suggestion count clamped to what the normalizer keeps
    pub fn desired_suggestions(&self) -> u8 {
        self.suggest_count.clamp(1, MAX_SUGGESTIONS as u8)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.request_secs)
    }

    pub fn stream_policy(&self) -> StreamPolicy {
        StreamPolicy {
            stall_timeout: Duration::from_millis(self.timeouts.stall_ms),
            max_duration: Duration::from_secs(self.timeouts.max_stream_secs),
            reconnect: ReconnectPolicy {
                max_retries: self.timeouts.max_reconnects,
                base_delay: Duration::from_millis(self.timeouts.reconnect_base_ms),
            },
        }
    }
}
