//! Configuration for ontime-server

use anyhow::{Context, Result};
use argon2::{
    Argon2,
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng},
};
use chrono::{FixedOffset, NaiveTime};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Server configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub reminders: ReminderConfig,
    #[serde(default)]
    pub push: PushConfig,
    /// Service tokens of the gateways allowed to call the API
    #[serde(default)]
    pub tokens: Vec<TokenConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Path to SQLite database file
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

/// Broadcast times and message texts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReminderConfig {
    /// Offset of the users' local time from UTC, in minutes
    #[serde(default)]
    pub utc_offset_minutes: i32,

    /// Local time of the broadcast about tomorrow's schedules
    #[serde(default = "default_evening_time")]
    pub evening_time: NaiveTime,

    /// Local time of the broadcast about today's schedules
    #[serde(default = "default_morning_time")]
    pub morning_time: NaiveTime,

    #[serde(default = "default_title")]
    pub title: String,

    #[serde(default = "default_prepare_message")]
    pub prepare_message: String,

    #[serde(default = "default_evening_message")]
    pub evening_message: String,

    #[serde(default = "default_morning_message")]
    pub morning_message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushConfig {
    /// Push service URL; messages are only logged when unset
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Sent as a bearer token to the push service
    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default = "default_push_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenConfig {
    /// Human-readable name for the token
    pub name: String,
    /// argon2 hash of the token
    pub token_hash: String,
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_db_path() -> PathBuf {
    PathBuf::from("ontime.sqlite")
}

fn default_evening_time() -> NaiveTime {
    NaiveTime::from_hms_opt(21, 0, 0).unwrap_or_default()
}

fn default_morning_time() -> NaiveTime {
    NaiveTime::from_hms_opt(8, 0, 0).unwrap_or_default()
}

fn default_title() -> String {
    "Schedule reminder".to_string()
}

fn default_prepare_message() -> String {
    "it's time to start getting ready.".to_string()
}

fn default_evening_message() -> String {
    "you have a schedule tomorrow.".to_string()
}

fn default_morning_message() -> String {
    "you have a schedule today.".to_string()
}

fn default_push_timeout() -> u64 {
    10
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

impl Default for ReminderConfig {
    fn default() -> Self {
        Self {
            utc_offset_minutes: 0,
            evening_time: default_evening_time(),
            morning_time: default_morning_time(),
            title: default_title(),
            prepare_message: default_prepare_message(),
            evening_message: default_evening_message(),
            morning_message: default_morning_message(),
        }
    }
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            api_key: None,
            timeout_secs: default_push_timeout(),
        }
    }
}

impl ReminderConfig {
    pub fn utc_offset(&self) -> Result<FixedOffset> {
        self.utc_offset_minutes
            .checked_mul(60)
            .and_then(FixedOffset::east_opt)
            .with_context(|| format!("Invalid UTC offset: {} minutes", self.utc_offset_minutes))
    }
}

impl Config {
    /// Default config path
    pub fn default_path() -> Result<PathBuf> {
        if let Ok(env_path) = std::env::var("ONTIME_CONFIG") {
            return Ok(PathBuf::from(env_path));
        }

        let local = PathBuf::from("config.toml");
        if local.exists() {
            return Ok(local);
        }

        // Docker default
        let data_config = PathBuf::from("/data/config.toml");
        if data_config.exists() {
            return Ok(data_config);
        }

        let config_dir = dirs::config_dir()
            .context("Could not determine config directory")?
            .join("ontime-server");

        Ok(config_dir.join("config.toml"))
    }

    /// Load config from default path
    pub fn load() -> Result<Self> {
        let path = Self::default_path()?;
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).context("Failed to read config file")?;
        let config: Self = toml::from_str(&content).context("Failed to parse config file")?;
        config.reminders.utc_offset()?;
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        let with_comments = format!(
            "# ontime-server configuration\n\n\
             {}\n\n\
             # Add gateway tokens with: ontime-server token --name <gateway>\n",
            content
        );

        std::fs::write(path, with_comments).context("Failed to write config file")?;

        Ok(())
    }

    /// Check a bearer token against the configured hashes
    pub fn validate_token(&self, token: &str) -> bool {
        let argon2 = Argon2::default();

        self.tokens.iter().any(|t| {
            PasswordHash::new(&t.token_hash)
                .map(|parsed| argon2.verify_password(token.as_bytes(), &parsed).is_ok())
                .unwrap_or(false)
        })
    }
}

/// Hash a token using argon2
pub fn hash_token(token: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let argon2 = Argon2::default();
    let hash = argon2
        .hash_password(token.as_bytes(), &salt)
        .map_err(|e| anyhow::anyhow!("Failed to hash token: {}", e))?;
    Ok(hash.to_string())
}
