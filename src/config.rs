//! Configuration for backup and retention runs.
//!
//! Values are layered: built-in defaults, then an optional TOML file, then
//! environment overrides. The API credential is only ever taken from the
//! environment (which includes `.env` files loaded through dotenvy), never
//! from the TOML file.
//!
//! ```toml
//! source_dir = "/srv/app/data"
//! archive_dir = "/var/backups/offsite"
//!
//! [retention]
//! keep_local = 3
//! keep_remote = 7
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::archive::ArchiveNaming;
use crate::retention::RetentionPolicy;
use crate::upload::poller::{DEFAULT_SUCCESS_TOKENS, SuccessVocabulary};

/// Environment variable holding the remote store credential.
pub const API_KEY_VAR: &str = "UPLOADTHING_API_KEY";

/// Environment variable pointing at a config file.
pub const CONFIG_PATH_VAR: &str = "OFFSITE_CONFIG";

const SOURCE_DIR_VAR: &str = "OFFSITE_SOURCE_DIR";
const ARCHIVE_DIR_VAR: &str = "OFFSITE_ARCHIVE_DIR";
const KEEP_LOCAL_VAR: &str = "OFFSITE_KEEP_LOCAL";
const KEEP_REMOTE_VAR: &str = "OFFSITE_KEEP_REMOTE";
const API_URL_VAR: &str = "OFFSITE_API_URL";

/// Errors raised while loading or validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("UPLOADTHING_API_KEY is not set")]
    MissingCredential,

    #[error("no source directory configured (set source_dir or OFFSITE_SOURCE_DIR)")]
    MissingSourceDir,

    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// Static API credential sent with every remote request.
#[derive(Clone, PartialEq, Eq)]
pub struct ApiKey(String);

impl ApiKey {
    /// Wrap a credential, rejecting blank values.
    pub fn new(value: impl Into<String>) -> Option<Self> {
        let value = value.into().trim().to_string();
        if value.is_empty() { None } else { Some(Self(value)) }
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Read the credential from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| dotenvy::var(key).ok())
    }

    pub fn from_lookup(env: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        env(API_KEY_VAR)
            .and_then(Self::new)
            .ok_or(ConfigError::MissingCredential)
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ApiKey(***)")
    }
}

/// Remote store endpoint and request parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteSettings {
    pub base_url: String,
    pub slug: String,
    pub acl: String,
    pub content_disposition: String,
    /// Lifetime of a prepared upload URL.
    pub expires_in_secs: u64,
    /// Upper bound on the raw byte transfer.
    pub transfer_timeout_secs: u64,
    /// Timeout for the small JSON API calls.
    pub request_timeout_secs: u64,
}

impl Default for RemoteSettings {
    fn default() -> Self {
        Self {
            base_url: "https://api.uploadthing.com".to_string(),
            slug: "backupUploader".to_string(),
            acl: "private".to_string(),
            content_disposition: "attachment".to_string(),
            expires_in_secs: 300,
            transfer_timeout_secs: 720,
            request_timeout_secs: 30,
        }
    }
}

impl RemoteSettings {
    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_secs(self.transfer_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Completion polling budget and success vocabulary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollSettings {
    pub attempts: u32,
    pub interval_secs: u64,
    pub success_tokens: Vec<String>,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            attempts: 6,
            interval_secs: 15,
            success_tokens: DEFAULT_SUCCESS_TOKENS.iter().map(|t| t.to_string()).collect(),
        }
    }
}

impl PollSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn vocabulary(&self) -> SuccessVocabulary {
        SuccessVocabulary::new(self.success_tokens.iter().cloned())
    }
}

/// Cron expressions used by `schedule install`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleSettings {
    pub backup: String,
    pub prune: String,
}

impl Default for ScheduleSettings {
    fn default() -> Self {
        Self {
            backup: "0 3 * * *".to_string(),
            prune: "30 4 * * *".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Append logs to this file in addition to stderr.
    pub file: Option<PathBuf>,
}

/// Complete configuration for one invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    /// Directory tree to back up.
    pub source_dir: Option<PathBuf>,
    /// Where archives are written and where local retention looks.
    pub archive_dir: PathBuf,
    /// File name prefix shared by every archive this tool creates.
    pub archive_prefix: String,
    /// Patterns passed to the archiver as exclusions.
    pub exclude: Vec<String>,
    pub remote: RemoteSettings,
    pub poll: PollSettings,
    pub retention: RetentionPolicy,
    pub schedule: ScheduleSettings,
    pub logging: LoggingSettings,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            source_dir: None,
            archive_dir: default_archive_dir(),
            archive_prefix: "backup_".to_string(),
            exclude: Vec::new(),
            remote: RemoteSettings::default(),
            poll: PollSettings::default(),
            retention: RetentionPolicy::default(),
            schedule: ScheduleSettings::default(),
            logging: LoggingSettings::default(),
        }
    }
}

impl BackupConfig {
    /// Load configuration from the standard locations and the process
    /// environment.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load_with(explicit, |key| dotenvy::var(key).ok())
    }

    /// Load configuration using `env` for every environment lookup.
    ///
    /// An explicit path (argument or `OFFSITE_CONFIG`) must exist; the
    /// platform default path is only read when present.
    pub fn load_with(
        explicit: Option<&Path>,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let explicit = explicit
            .map(Path::to_path_buf)
            .or_else(|| env(CONFIG_PATH_VAR).map(PathBuf::from));

        let mut config = match explicit {
            Some(path) => Self::from_file(&path)?,
            None => match default_config_path() {
                Some(path) if path.is_file() => Self::from_file(&path)?,
                _ => Self::default(),
            },
        };

        config.apply_env(env)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply `OFFSITE_*` overrides.
    pub fn apply_env(&mut self, env: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(dir) = env(SOURCE_DIR_VAR).filter(|v| !v.trim().is_empty()) {
            self.source_dir = Some(PathBuf::from(dir));
        }
        if let Some(dir) = env(ARCHIVE_DIR_VAR).filter(|v| !v.trim().is_empty()) {
            self.archive_dir = PathBuf::from(dir);
        }
        if let Some(url) = env(API_URL_VAR).filter(|v| !v.trim().is_empty()) {
            self.remote.base_url = url;
        }
        if let Some(raw) = env(KEEP_LOCAL_VAR) {
            self.retention.keep_local = parse_count(KEEP_LOCAL_VAR, &raw)?;
        }
        if let Some(raw) = env(KEEP_REMOTE_VAR) {
            self.retention.keep_remote = parse_count(KEEP_REMOTE_VAR, &raw)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.archive_prefix.is_empty()
            || self.archive_prefix.contains(['/', '\\'])
        {
            return Err(ConfigError::Invalid {
                key: "archive_prefix",
                reason: "must be non-empty and contain no path separators".to_string(),
            });
        }
        if self.poll.attempts == 0 {
            return Err(ConfigError::Invalid {
                key: "poll.attempts",
                reason: "at least one attempt is required".to_string(),
            });
        }
        if self.poll.success_tokens.iter().all(|t| t.trim().is_empty()) {
            return Err(ConfigError::Invalid {
                key: "poll.success_tokens",
                reason: "at least one success token is required".to_string(),
            });
        }
        if self.remote.transfer_timeout_secs == 0 || self.remote.request_timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                key: "remote",
                reason: "timeouts must be greater than zero".to_string(),
            });
        }
        if self.remote.base_url.trim().is_empty() {
            return Err(ConfigError::Invalid {
                key: "remote.base_url",
                reason: "must not be empty".to_string(),
            });
        }
        Ok(())
    }

    /// The configured source directory, which every backup requires.
    pub fn require_source_dir(&self) -> Result<&Path, ConfigError> {
        self.source_dir
            .as_deref()
            .ok_or(ConfigError::MissingSourceDir)
    }

    pub fn naming(&self) -> ArchiveNaming {
        ArchiveNaming::new(&self.archive_prefix)
    }
}

fn parse_count(key: &'static str, raw: &str) -> Result<usize, ConfigError> {
    raw.trim().parse().map_err(|_| ConfigError::Invalid {
        key,
        reason: format!("expected a non-negative integer, got {raw:?}"),
    })
}

fn project_dirs() -> Option<directories::ProjectDirs> {
    directories::ProjectDirs::from("com", "offsite-backup", "offsite-backup")
}

/// `<config_dir>/config.toml` for the current user, if a home exists.
pub fn default_config_path() -> Option<PathBuf> {
    project_dirs().map(|dirs| dirs.config_dir().join("config.toml"))
}

/// `<config_dir>/.env`, loaded after the working-directory `.env`.
pub fn default_env_file() -> Option<PathBuf> {
    project_dirs().map(|dirs| dirs.config_dir().join(".env"))
}

fn default_archive_dir() -> PathBuf {
    project_dirs()
        .map(|dirs| dirs.data_dir().join("archives"))
        .unwrap_or_else(|| std::env::temp_dir().join("offsite-backup"))
}
