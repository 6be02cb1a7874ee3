//! Configuration: a human-editable TOML file loaded once at startup and
//! re-read on `SIGHUP`. Concerns are split into nested structs
//! (`DatabaseConfig` owns where the database file lives, `ExternalServerConfig`
//! owns the outbound sync settings) but collected into one `Config` the
//! binary loads up front, since this service has no UI layer to edit
//! settings interactively.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::model::ListenerSpec;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("duplicate listener port {0}")]
    DuplicatePort(u16),

    #[error("external_server.enabled is true but url is empty")]
    MissingServerUrl,

    #[error("external_server.sync_frequency is scheduled but interval_seconds is not set")]
    MissingInterval,

    #[error("external_server.sync_frequency is cron but cron_schedule is not set or invalid: {0}")]
    InvalidCronSchedule(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "lis-ingest.sqlite3".to_string(),
        }
    }
}

/// Outbound sync cadence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncFrequency {
    Realtime,
    Scheduled,
    Cron,
}

/// Opaque credential configuration handed to the pluggable `AuthProvider`:
/// the core treats the credential as opaque bytes injected into the request
/// by the provider, never inspecting or logging it itself.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "scheme", rename_all = "snake_case")]
pub enum AuthConfig {
    None,
    ApiKey {
        header: String,
        value: String,
    },
    Bearer {
        token: String,
    },
    Basic {
        username: String,
        password: String,
    },
    CustomHeaders {
        headers: HashMap<String, String>,
    },
    OAuth2ClientCredentials {
        token_url: String,
        client_id: String,
        client_secret: String,
        #[serde(default)]
        scope: Option<String>,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExternalServerConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub url: String,
    #[serde(default = "default_auth")]
    pub auth: AuthConfig,
    #[serde(default = "default_sync_frequency")]
    pub sync_frequency: SyncFrequency,
    #[serde(default)]
    pub interval_seconds: Option<u64>,
    #[serde(default)]
    pub cron_schedule: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_worker_pool_size")]
    pub worker_pool_size: usize,
}

fn default_auth() -> AuthConfig {
    AuthConfig::None
}

fn default_sync_frequency() -> SyncFrequency {
    SyncFrequency::Realtime
}

fn default_batch_size() -> usize {
    100
}

fn default_worker_pool_size() -> usize {
    4
}

impl Default for ExternalServerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: String::new(),
            auth: default_auth(),
            sync_frequency: default_sync_frequency(),
            interval_seconds: None,
            cron_schedule: None,
            batch_size: default_batch_size(),
            worker_pool_size: default_worker_pool_size(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub app_name: String,
    pub instance_id: String,
    pub listeners: Vec<ListenerSpec>,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub external_server: ExternalServerConfig,
    #[serde(default)]
    pub observer_channel_capacity: Option<usize>,
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Config = toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Path precedence: `--config` flag, then `LIS_CONFIG` env var, then
    /// `./config.toml`.
    pub fn resolve_path(cli_flag: Option<&str>) -> PathBuf {
        if let Some(path) = cli_flag {
            return PathBuf::from(path);
        }
        if let Ok(path) = std::env::var("LIS_CONFIG") {
            return PathBuf::from(path);
        }
        PathBuf::from("./config.toml")
    }

    pub fn observer_channel_capacity(&self) -> usize {
        self.observer_channel_capacity.unwrap_or(1024)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = std::collections::HashSet::new();
        for listener in &self.listeners {
            if !seen.insert(listener.port) {
                return Err(ConfigError::DuplicatePort(listener.port));
            }
        }
        if self.external_server.enabled {
            if self.external_server.url.is_empty() {
                return Err(ConfigError::MissingServerUrl);
            }
            match self.external_server.sync_frequency {
                SyncFrequency::Scheduled if self.external_server.interval_seconds.is_none() => {
                    return Err(ConfigError::MissingInterval);
                }
                SyncFrequency::Cron => {
                    let schedule = self
                        .external_server
                        .cron_schedule
                        .as_deref()
                        .ok_or_else(|| ConfigError::InvalidCronSchedule("not set".into()))?;
                    schedule
                        .parse::<cron::Schedule>()
                        .map_err(|e| ConfigError::InvalidCronSchedule(e.to_string()))?;
                }
                _ => {}
            }
        }
        Ok(())
    }
}

/// Watches `SIGHUP` on Unix and re-reads the config file, publishing each
/// successfully parsed `Config` for the Listener Supervisor's `reload`.
/// `SIGHUP` is the conventional daemon reload signal and needs no extra
/// crate or filesystem watcher.
#[cfg(unix)]
pub fn watch_for_reload(
    path: PathBuf,
) -> tokio::sync::mpsc::UnboundedReceiver<Config> {
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut signal = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
        {
            Ok(s) => s,
            Err(e) => {
                log::error!("failed to install SIGHUP handler: {e}");
                return;
            }
        };
        loop {
            signal.recv().await;
            log::info!("SIGHUP received, reloading config from {}", path.display());
            match Config::from_file(&path) {
                Ok(config) => {
                    if tx.send(config).is_err() {
                        break;
                    }
                }
                Err(e) => log::error!("config reload failed, keeping previous config: {e}"),
            }
        }
    });
    rx
}
