//! Runtime configuration for the sync engine.
//!
//! Environment variables take precedence over the OS credential store so a
//! terminal can be pointed at a staging dashboard without touching its
//! stored credentials.

use std::path::PathBuf;
use std::time::Duration;

use tracing::debug;

use crate::api::{self, DEFAULT_TIMEOUT};
use crate::error::SyncError;
use crate::storage;

pub const ENV_ADMIN_URL: &str = "POS_ADMIN_URL";
pub const ENV_API_KEY: &str = "POS_API_KEY";
pub const ENV_TERMINAL_ID: &str = "POS_TERMINAL_ID";
pub const ENV_DATA_DIR: &str = "POS_DATA_DIR";
pub const ENV_SYNC_INTERVAL_SECS: &str = "POS_SYNC_INTERVAL_SECS";
pub const ENV_PROBE_INTERVAL_SECS: &str = "POS_PROBE_INTERVAL_SECS";
pub const ENV_REQUEST_TIMEOUT_SECS: &str = "POS_REQUEST_TIMEOUT_SECS";
pub const ENV_SYNCED_RETENTION_DAYS: &str = "POS_SYNCED_RETENTION_DAYS";

const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(15);
const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(10);
const DEFAULT_SYNCED_RETENTION_DAYS: u64 = 7;
const SECS_PER_DAY: u64 = 24 * 60 * 60;

const APP_DIR_NAME: &str = "com.thesmall.pos-sync";

#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    pub admin_url: String,
    pub api_key: String,
    pub terminal_id: String,
    pub data_dir: PathBuf,
    pub request_timeout: Duration,
    /// Periodic sync while online with pending work. `None` syncs only on
    /// reconnect and on demand.
    pub sync_interval: Option<Duration>,
    /// Health-check cadence feeding the connectivity monitor. `None` leaves
    /// the monitor to whoever embeds the engine.
    pub probe_interval: Option<Duration>,
    /// Synced orders older than this are purged after each background
    /// cycle. `None` keeps them.
    pub synced_retention: Option<Duration>,
}

impl SyncConfig {
    /// Environment first, OS credential store second.
    pub fn from_env() -> Result<Self, SyncError> {
        Self::resolve(|key| std::env::var(key).ok(), storage::get_credential)
    }

    /// Build a config from two lookups: `env` keyed by `POS_*` names and
    /// `credential` keyed by credential-store names.
    pub fn resolve(
        env: impl Fn(&str) -> Option<String>,
        credential: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, SyncError> {
        let lookup = |env_key: &str, credential_key: &str| {
            env(env_key)
                .or_else(|| credential(credential_key))
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let raw_key = lookup(ENV_API_KEY, storage::KEY_API_KEY)
            .ok_or_else(|| SyncError::NotConfigured("API key".into()))?;

        let api_key = api::extract_api_key_from_connection_string(&raw_key)
            .unwrap_or_else(|| raw_key.clone());
        let admin_url = api::extract_admin_url_from_connection_string(&raw_key)
            .or_else(|| {
                lookup(ENV_ADMIN_URL, storage::KEY_ADMIN_URL)
                    .map(|u| api::normalize_admin_url(&u))
            })
            .ok_or_else(|| SyncError::NotConfigured("admin dashboard URL".into()))?;
        let terminal_id = api::extract_terminal_id_from_connection_string(&raw_key)
            .or_else(|| lookup(ENV_TERMINAL_ID, storage::KEY_TERMINAL_ID))
            .ok_or_else(|| SyncError::NotConfigured("terminal id".into()))?;

        let data_dir = env(ENV_DATA_DIR)
            .map(|d| d.trim().to_string())
            .filter(|d| !d.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(default_data_dir);

        let config = Self {
            admin_url,
            api_key,
            terminal_id,
            data_dir,
            request_timeout: parse_secs(env(ENV_REQUEST_TIMEOUT_SECS), Some(DEFAULT_TIMEOUT))
                .unwrap_or(DEFAULT_TIMEOUT),
            sync_interval: parse_secs(env(ENV_SYNC_INTERVAL_SECS), Some(DEFAULT_SYNC_INTERVAL)),
            probe_interval: parse_secs(env(ENV_PROBE_INTERVAL_SECS), Some(DEFAULT_PROBE_INTERVAL)),
            synced_retention: parse_days(
                env(ENV_SYNCED_RETENTION_DAYS),
                Some(DEFAULT_SYNCED_RETENTION_DAYS),
            ),
        };
        debug!(
            admin_url = %config.admin_url,
            terminal_id = %config.terminal_id,
            data_dir = %config.data_dir.display(),
            "Sync config resolved"
        );
        Ok(config)
    }

    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }
}

/// `0` disables; unparsable values fall back to `default`.
fn parse_secs(raw: Option<String>, default: Option<Duration>) -> Option<Duration> {
    match raw.as_deref().map(str::trim).map(str::parse::<u64>) {
        Some(Ok(0)) => None,
        Some(Ok(secs)) => Some(Duration::from_secs(secs)),
        Some(Err(_)) | None => default,
    }
}

/// Whole days, with the same rules as [`parse_secs`].
fn parse_days(raw: Option<String>, default: Option<u64>) -> Option<Duration> {
    let days = match raw.as_deref().map(str::trim).map(str::parse::<u64>) {
        Some(Ok(days)) => Some(days),
        Some(Err(_)) | None => default,
    };
    days.filter(|&d| d > 0)
        .map(|d| Duration::from_secs(d.saturating_mul(SECS_PER_DAY)))
}

/// Per-user application data directory.
pub fn default_data_dir() -> PathBuf {
    let base = std::env::var("LOCALAPPDATA")
        .or_else(|_| std::env::var("XDG_DATA_HOME"))
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            #[cfg(target_os = "windows")]
            {
                PathBuf::from(std::env::var("USERPROFILE").unwrap_or_else(|_| ".".into()))
                    .join("AppData")
                    .join("Local")
            }
            #[cfg(not(target_os = "windows"))]
            {
                PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()))
                    .join(".local")
                    .join("share")
            }
        });
    base.join(APP_DIR_NAME)
}
