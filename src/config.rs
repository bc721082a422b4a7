//! Configuration file handling.
//!
//! Settings live in a TOML file under the user's config directory. A
//! missing file yields defaults; a malformed one is an error.

use crate::email::{FetchMode, SyncOptions};
use crate::provider::{Account, Provider};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

const CONFIG_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to write config {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Unknown account: {0}")]
    UnknownAccount(String),

    #[error("No accounts configured")]
    NoAccounts,
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Polling behaviour shared by every account
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    pub poll_interval_secs: u64,
    pub fetch_mode: FetchMode,
    pub sync_on_startup: bool,
    /// Artificial delay between streamed threads, for the local provider
    pub stream_delay_ms: Option<u64>,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            poll_interval_secs: 15,
            fetch_mode: FetchMode::Streaming,
            sync_on_startup: true,
            stream_delay_ms: None,
        }
    }
}

impl SyncSettings {
    pub fn to_options(&self) -> SyncOptions {
        SyncOptions {
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            fetch_mode: self.fetch_mode,
            sync_on_startup: self.sync_on_startup,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountConfig {
    pub email: String,
    #[serde(default)]
    pub provider: Provider,
    #[serde(default)]
    pub display_name: Option<String>,
    /// Inbox export read by the local mail service
    pub inbox_path: PathBuf,
    #[serde(default)]
    pub outbox_path: Option<PathBuf>,
}

impl AccountConfig {
    pub fn to_account(&self) -> Account {
        let mut account = Account::new(self.email.clone(), self.provider);
        account.display_name = self.display_name.clone();
        account
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub version: u32,
    /// Email of the account used when none is given on the command line
    pub default_account: Option<String>,
    pub database_path: Option<PathBuf>,
    pub log_file: Option<PathBuf>,
    pub sync: SyncSettings,
    pub accounts: Vec<AccountConfig>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            default_account: None,
            database_path: None,
            log_file: None,
            sync: SyncSettings::default(),
            accounts: Vec::new(),
        }
    }
}

impl AppConfig {
    /// `<config dir>/conversa/config.toml`
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("conversa")
            .join("config.toml")
    }

    /// Load from `path`, falling back to defaults when the file is absent
    pub fn load(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            info!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml(&content)?;

        debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn from_toml(content: &str) -> ConfigResult<Self> {
        let config: AppConfig = toml::from_str(content)?;
        if config.version > CONFIG_VERSION {
            warn!(
                "Config version {} is newer than supported version {}",
                config.version, CONFIG_VERSION
            );
        }
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| ConfigError::Write {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let content = toml::to_string_pretty(self)?;
        fs::write(path, content).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })?;

        debug!("Saved configuration to {}", path.display());
        Ok(())
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.sync.poll_interval_secs == 0 {
            return Err(ConfigError::Invalid("sync.poll_interval_secs must be positive".into()));
        }

        for (i, account) in self.accounts.iter().enumerate() {
            if account.email.trim().is_empty() {
                return Err(ConfigError::Invalid(format!("account #{} has no email", i + 1)));
            }
            let duplicate = self.accounts[..i]
                .iter()
                .any(|other| other.email.eq_ignore_ascii_case(&account.email));
            if duplicate {
                return Err(ConfigError::Invalid(format!("account {} listed twice", account.email)));
            }
        }

        if let Some(default) = &self.default_account {
            if !self.accounts.iter().any(|a| a.email.eq_ignore_ascii_case(default)) {
                return Err(ConfigError::UnknownAccount(default.clone()));
            }
        }

        Ok(())
    }

    /// Account by email, or the default account (then the first one)
    pub fn account(&self, email: Option<&str>) -> ConfigResult<&AccountConfig> {
        let wanted = email.or(self.default_account.as_deref());

        match wanted {
            Some(email) => self
                .accounts
                .iter()
                .find(|a| a.email.eq_ignore_ascii_case(email))
                .ok_or_else(|| ConfigError::UnknownAccount(email.to_string())),
            None => self.accounts.first().ok_or(ConfigError::NoAccounts),
        }
    }

    /// Database location, `<data dir>/conversa/mail.db` unless configured
    pub fn database_path(&self) -> PathBuf {
        self.database_path.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("conversa")
                .join("mail.db")
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const SAMPLE: &str = r#"
default_account = "me@x.com"

[sync]
poll_interval_secs = 30
fetch_mode = "batch"

[[accounts]]
email = "me@x.com"
provider = "gmail"
inbox_path = "/tmp/inbox.json"

[[accounts]]
email = "work@corp.com"
provider = "outlook"
display_name = "Work"
inbox_path = "/tmp/work.jsonl"
outbox_path = "/tmp/work-outbox.jsonl"
"#;

    #[test]
    fn test_parse_sample() {
        let config = AppConfig::from_toml(SAMPLE).unwrap();
        assert_eq!(config.sync.poll_interval_secs, 30);
        assert_eq!(config.sync.fetch_mode, FetchMode::Batch);
        assert!(config.sync.sync_on_startup);
        assert_eq!(config.accounts.len(), 2);
        assert_eq!(config.accounts[1].provider, Provider::Outlook);

        let options = config.sync.to_options();
        assert_eq!(options.poll_interval, Duration::from_secs(30));
    }

    #[test]
    fn test_account_lookup() {
        let config = AppConfig::from_toml(SAMPLE).unwrap();
        assert_eq!(config.account(None).unwrap().email, "me@x.com");
        assert_eq!(config.account(Some("WORK@corp.com")).unwrap().email, "work@corp.com");
        assert!(matches!(
            config.account(Some("nobody@x.com")),
            Err(ConfigError::UnknownAccount(_))
        ));

        let account = config.accounts[1].to_account();
        assert_eq!(account.display_name.as_deref(), Some("Work"));
        assert_eq!(account.provider, Provider::Outlook);
    }

    #[test]
    fn test_defaults_when_missing() {
        let temp_dir = tempdir().unwrap();
        let config = AppConfig::load(&temp_dir.path().join("config.toml")).unwrap();
        assert_eq!(config, AppConfig::default());
        assert_eq!(config.sync.poll_interval_secs, 15);
        assert_eq!(config.sync.fetch_mode, FetchMode::Streaming);
        assert!(matches!(config.account(None), Err(ConfigError::NoAccounts)));
    }

    #[test]
    fn test_rejects_invalid() {
        assert!(AppConfig::from_toml("[sync]\npoll_interval_secs = 0\n").is_err());
        assert!(AppConfig::from_toml("default_account = \"ghost@x.com\"\n").is_err());

        let duplicate = r#"
[[accounts]]
email = "me@x.com"
inbox_path = "a.json"

[[accounts]]
email = "ME@x.com"
inbox_path = "b.json"
"#;
        assert!(AppConfig::from_toml(duplicate).is_err());
    }

    #[test]
    fn test_save_and_reload() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("nested").join("config.toml");

        let mut config = AppConfig::from_toml(SAMPLE).unwrap();
        config.sync.stream_delay_ms = Some(250);
        config.save(&path).unwrap();

        let reloaded = AppConfig::load(&path).unwrap();
        assert_eq!(reloaded, config);
    }
}
