//! Configuration for focus-sync server

use anyhow::{Context, Result, bail};
use argon2::{
    Argon2,
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::hub::HubSettings;
use crate::models::{ResetConfiguration, TimerPolicy};
use crate::scheduler;

/// Longest allowed gap between reset checks
const MAX_CHECK_INTERVAL_SECS: u64 = 300;

/// Server configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub timer: TimerPolicy,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub tokens: Vec<TokenConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Path to SQLite database file
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

/// Hub and device-channel tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// How long a device waits for its command to be confirmed
    #[serde(default = "default_ack_timeout_secs")]
    pub ack_timeout_secs: u64,

    /// Devices silent for longer than this are unregistered
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// Granularity of the running timer
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,

    #[serde(default = "default_checkpoint_interval_secs")]
    pub checkpoint_interval_secs: u64,

    #[serde(default = "default_device_channel_capacity")]
    pub device_channel_capacity: usize,

    #[serde(default = "default_request_capacity")]
    pub request_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Seconds between reset checks (at most 300)
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,

    /// Reset settings for sessions that have not configured their own
    #[serde(default)]
    pub default_reset: ResetConfiguration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenConfig {
    /// Human-readable name for the token
    pub name: String,
    /// The hashed API token (argon2 hash)
    pub token_hash: String,
    /// Account (session id) the token acts for; defaults to the token name
    #[serde(default)]
    pub account: Option<String>,
}

impl TokenConfig {
    pub fn account(&self) -> &str {
        self.account.as_deref().unwrap_or(&self.name)
    }
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3040
}

fn default_db_path() -> PathBuf {
    PathBuf::from("focus-sync.sqlite")
}

fn default_ack_timeout_secs() -> u64 {
    5
}

fn default_idle_timeout_secs() -> u64 {
    60
}

fn default_sweep_interval_secs() -> u64 {
    15
}

fn default_tick_interval_secs() -> u64 {
    1
}

fn default_checkpoint_interval_secs() -> u64 {
    30
}

fn default_device_channel_capacity() -> usize {
    32
}

fn default_request_capacity() -> usize {
    64
}

fn default_check_interval_secs() -> u64 {
    60
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

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            ack_timeout_secs: default_ack_timeout_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            tick_interval_secs: default_tick_interval_secs(),
            checkpoint_interval_secs: default_checkpoint_interval_secs(),
            device_channel_capacity: default_device_channel_capacity(),
            request_capacity: default_request_capacity(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: default_check_interval_secs(),
            default_reset: ResetConfiguration::default(),
        }
    }
}

impl Config {
    /// Default config path
    pub fn default_path() -> Result<PathBuf> {
        // Check environment variable first
        if let Ok(env_path) = std::env::var("FOCUS_SYNC_CONFIG") {
            return Ok(PathBuf::from(env_path));
        }

        // Check for config in current directory
        let local = PathBuf::from("config.toml");
        if local.exists() {
            return Ok(local);
        }

        // Check /data/config.toml (Docker default)
        let data_config = PathBuf::from("/data/config.toml");
        if data_config.exists() {
            return Ok(data_config);
        }

        // Then check XDG config
        let config_dir = dirs::config_dir()
            .context("Could not determine config directory")?
            .join("focus-sync");

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

    /// Load config from specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).context("Failed to read config file")?;
        let config: Self = toml::from_str(&content).context("Failed to parse config file")?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to specific path
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        let with_comments = format!(
            "# focus-sync configuration\n\n\
             {}\n\n\
             # Add device tokens as [[tokens]] entries with an argon2 token_hash.\n",
            content
        );

        std::fs::write(path, with_comments).context("Failed to write config file")?;

        Ok(())
    }

    /// Reject settings the engine cannot honour
    pub fn validate(&self) -> Result<()> {
        let check = self.scheduler.check_interval_secs;
        if check == 0 || check > MAX_CHECK_INTERVAL_SECS {
            bail!(
                "scheduler.check_interval_secs must be 1-{}, got {}",
                MAX_CHECK_INTERVAL_SECS,
                check
            );
        }

        for (name, secs) in [
            ("timer.work_secs", self.timer.work_secs),
            ("timer.short_break_secs", self.timer.short_break_secs),
            ("timer.long_break_secs", self.timer.long_break_secs),
            ("sync.ack_timeout_secs", self.sync.ack_timeout_secs),
            ("sync.tick_interval_secs", self.sync.tick_interval_secs),
            ("sync.checkpoint_interval_secs", self.sync.checkpoint_interval_secs),
            ("sync.sweep_interval_secs", self.sync.sweep_interval_secs),
        ] {
            if secs == 0 {
                bail!("{} must be greater than zero", name);
            }
        }

        scheduler::resolve_timezone(&self.scheduler.default_reset.timezone)
            .context("Invalid scheduler.default_reset.timezone")?;

        Ok(())
    }

    /// Hub tunables derived from this config
    pub fn hub_settings(&self) -> HubSettings {
        HubSettings {
            policy: self.timer.clone(),
            default_reset: self.scheduler.default_reset.clone(),
            ack_timeout: Duration::from_secs(self.sync.ack_timeout_secs),
            checkpoint_interval: Duration::from_secs(self.sync.checkpoint_interval_secs),
            tick_interval: Some(Duration::from_secs(self.sync.tick_interval_secs)),
            request_capacity: self.sync.request_capacity,
            device_channel_capacity: self.sync.device_channel_capacity,
        }
    }

    /// Create a token for `name`, store its hash, and return the plaintext once
    pub fn issue_token(&mut self, name: &str, account: Option<String>) -> Result<String> {
        if self.tokens.iter().any(|t| t.name == name) {
            bail!("Token '{}' already exists; revoke it first", name);
        }

        let token = generate_token();
        self.tokens.push(TokenConfig {
            name: name.to_string(),
            token_hash: hash_token(&token)?,
            account,
        });
        Ok(token)
    }

    /// Remove a token by name; false when no such token exists
    pub fn revoke_token(&mut self, name: &str) -> bool {
        let before = self.tokens.len();
        self.tokens.retain(|t| t.name != name);
        self.tokens.len() != before
    }

    /// Token entry matching a presented bearer token
    pub fn validate_token(&self, token: &str) -> Option<&TokenConfig> {
        let argon2 = Argon2::default();

        self.tokens.iter().find(|t| {
            PasswordHash::new(&t.token_hash)
                .map(|parsed| argon2.verify_password(token.as_bytes(), &parsed).is_ok())
                .unwrap_or(false)
        })
    }
}

fn generate_token() -> String {
    use rand::Rng;
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

    let bytes: [u8; 32] = rand::rng().random();
    let body: String = bytes
        .iter()
        .map(|b| ALPHABET[(*b as usize) % ALPHABET.len()] as char)
        .collect();

    format!("fst_{}", body)
}

/// Hash a token using argon2
pub fn hash_token(token: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(token.as_bytes(), &salt)
        .map_err(|e| anyhow::anyhow!("Failed to hash token: {}", e))?;
    Ok(hash.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ResetTimeOfDay;

    #[test]
    fn empty_file_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        config.validate().unwrap();
        assert_eq!(config.server.port, 3040);
        assert_eq!(config.sync.ack_timeout_secs, 5);
        assert_eq!(config.sync.idle_timeout_secs, 60);
        assert_eq!(config.timer.long_break_frequency, 4);
    }

    #[test]
    fn parses_scheduler_section() {
        let config: Config = toml::from_str(
            r#"
            [scheduler]
            check_interval_secs = 120

            [scheduler.default_reset]
            timezone = "America/New_York"
            reset_time = "07"
            "#,
        )
        .unwrap();
        config.validate().unwrap();
        assert_eq!(config.scheduler.default_reset.reset_time, ResetTimeOfDay::Hour(7));
        assert!(config.scheduler.default_reset.enabled);
    }

    #[test]
    fn rejects_slow_scheduler_and_bad_zone() {
        let mut config = Config::default();
        config.scheduler.check_interval_secs = 301;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.scheduler.default_reset.timezone = "Atlantis/Capital".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_malformed_reset_time_at_parse() {
        let parsed: Result<Config, _> = toml::from_str(
            r#"
            [scheduler.default_reset]
            reset_time = "31:00"
            "#,
        );
        assert!(parsed.is_err());
    }

    #[test]
    fn issued_tokens_verify_and_revoke() {
        let mut config = Config::default();
        let token = config.issue_token("laptop", Some("alice".to_string())).unwrap();
        assert!(token.starts_with("fst_"));
        assert!(config.issue_token("laptop", None).is_err());

        let entry = config.validate_token(&token).unwrap();
        assert_eq!(entry.name, "laptop");
        assert_eq!(entry.account(), "alice");

        assert!(config.revoke_token("laptop"));
        assert!(!config.revoke_token("laptop"));
        assert!(config.validate_token(&token).is_none());
    }

    #[test]
    fn save_and_reload_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut config = Config::default();
        config.tokens.push(TokenConfig {
            name: "phone".to_string(),
            token_hash: hash_token("secret").unwrap(),
            account: Some("alice".to_string()),
        });
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.tokens.len(), 1);
        assert_eq!(loaded.validate_token("secret").unwrap().account(), "alice");
        assert!(loaded.validate_token("wrong").is_none());
    }
}
