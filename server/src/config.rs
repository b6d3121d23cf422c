use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::info;

use crate::engine::hub::HubSettings;
use crate::engine::relay::ChannelNaming;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid value {value:?} for {key}")]
    InvalidEnv { key: &'static str, value: String },
}

/// Top-level server configuration, loaded from roomchat.toml.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct ServerConfig {
    pub server: ServerSection,
    pub chat: ChatSection,
    pub relay: RelaySection,
    pub bans: BansSection,
    pub auth: AuthSection,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub web_address: String,
    /// Allowed CORS origin. Any origin is allowed when this points at localhost.
    pub public_url: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            web_address: "0.0.0.0:8080".into(),
            public_url: "http://localhost:8080".into(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ChatSection {
    pub outbound_queue_capacity: usize,
    pub idle_grace_secs: u64,
    pub sweep_interval_secs: u64,
    pub dedup_clear_secs: u64,
    /// Inbound frames longer than this (in bytes) are dropped.
    pub max_message_length: usize,
    /// How long a reader waits after its broadcast hit a full queue.
    pub backpressure_pause_ms: u64,
    pub system_name: String,
    pub profanity_words: Vec<String>,
}

impl Default for ChatSection {
    fn default() -> Self {
        Self {
            outbound_queue_capacity: 256,
            idle_grace_secs: 10 * 60,
            sweep_interval_secs: 30 * 60,
            dedup_clear_secs: 60 * 60,
            max_message_length: 2000,
            backpressure_pause_ms: 50,
            system_name: "roomchat".into(),
            profanity_words: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[default]
    Memory,
    Redis,
}

impl FromStr for Backend {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(Backend::Memory),
            "redis" => Ok(Backend::Redis),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RelaySection {
    pub backend: Backend,
    pub redis_url: String,
    pub channel_prefix: String,
    pub channel_suffix: String,
}

impl Default for RelaySection {
    fn default() -> Self {
        let naming = ChannelNaming::default();
        Self {
            backend: Backend::Memory,
            redis_url: "redis://127.0.0.1:6379/".into(),
            channel_prefix: naming.prefix,
            channel_suffix: naming.suffix,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct BansSection {
    pub backend: Backend,
    pub redis_url: String,
    pub default_minutes: u64,
    pub min_minutes: u64,
    pub max_minutes: u64,
}

impl Default for BansSection {
    fn default() -> Self {
        Self {
            backend: Backend::Memory,
            redis_url: "redis://127.0.0.1:6379/".into(),
            default_minutes: 5,
            min_minutes: 1,
            max_minutes: 15,
        }
    }
}

impl BansSection {
    /// Ban length for an admin request: the default when absent or below
    /// `min_minutes`, otherwise capped at `max_minutes`.
    pub fn clamp_minutes(&self, requested: Option<i64>) -> u64 {
        let max = self.max_minutes.max(self.min_minutes);
        let fallback = self.default_minutes.clamp(self.min_minutes, max);
        match requested {
            Some(m) if m >= self.min_minutes as i64 => (m as u64).min(max),
            _ => fallback,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct AuthSection {
    pub jwt_secret: String,
    pub cookie_name: String,
}

impl Default for AuthSection {
    fn default() -> Self {
        Self {
            jwt_secret: "roomchat-dev-secret-change-me".into(),
            cookie_name: "roomchat_session".into(),
        }
    }
}

impl ServerConfig {
    /// Load config from a TOML file, falling back to defaults if the file doesn't
    /// exist. Environment variables override TOML values.
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let mut config = if Path::new(path).exists() {
            let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                path: path.to_string(),
                source,
            })?;
            Self::from_toml(path, &contents)?
        } else {
            info!("No config file found at {}, using defaults", path);
            Self::default()
        };

        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_toml(path: &str, contents: &str) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|source| ConfigError::Parse {
            path: path.to_string(),
            source,
        })
    }

    /// Apply overrides from a variable lookup (the process environment in production).
    pub fn apply_overrides<F>(&mut self, get: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = get("WEB_ADDRESS") {
            self.server.web_address = v;
        }
        if let Some(v) = get("PUBLIC_URL") {
            self.server.public_url = v;
        }
        if let Some(v) = get("REDIS_URL") {
            self.relay.redis_url = v.clone();
            self.bans.redis_url = v;
        }
        if let Some(v) = get("RELAY_BACKEND") {
            self.relay.backend = parse("RELAY_BACKEND", v)?;
        }
        if let Some(v) = get("BAN_BACKEND") {
            self.bans.backend = parse("BAN_BACKEND", v)?;
        }
        if let Some(v) = get("JWT_SECRET") {
            self.auth.jwt_secret = v;
        }
        if let Some(v) = get("IDLE_GRACE_SECS") {
            self.chat.idle_grace_secs = parse("IDLE_GRACE_SECS", v)?;
        }
        if let Some(v) = get("SWEEP_INTERVAL_SECS") {
            self.chat.sweep_interval_secs = parse("SWEEP_INTERVAL_SECS", v)?;
        }
        if let Some(v) = get("DEDUP_CLEAR_SECS") {
            self.chat.dedup_clear_secs = parse("DEDUP_CLEAR_SECS", v)?;
        }
        if let Some(v) = get("OUTBOUND_QUEUE_CAPACITY") {
            self.chat.outbound_queue_capacity = parse("OUTBOUND_QUEUE_CAPACITY", v)?;
        }
        if let Some(v) = get("PROFANITY_WORDS") {
            self.chat.profanity_words = v
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        Ok(())
    }

    pub fn hub_settings(&self) -> HubSettings {
        // tokio intervals panic on a zero period.
        let secs = |s: u64| Duration::from_secs(s.max(1));
        HubSettings {
            queue_capacity: self.chat.outbound_queue_capacity.max(1),
            idle_grace: Duration::from_secs(self.chat.idle_grace_secs),
            sweep_interval: secs(self.chat.sweep_interval_secs),
            dedup_clear_interval: secs(self.chat.dedup_clear_secs),
            system_name: self.chat.system_name.clone(),
            channels: ChannelNaming {
                prefix: self.relay.channel_prefix.clone(),
                suffix: self.relay.channel_suffix.clone(),
            },
        }
    }
}

fn parse<T: FromStr>(key: &'static str, value: String) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidEnv { key, value })
}
