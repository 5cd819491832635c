//! Terminal credentials in the OS credential store.
//!
//! Windows DPAPI, macOS Keychain and the Linux kernel keyring, all through
//! the `keyring` crate. Only the three values the sync engine needs live
//! here; everything else is in the queue database.

use keyring::Entry;
use tracing::{info, warn};

use crate::api;
use crate::error::SyncError;

const SERVICE_NAME: &str = "the-small-pos";

// Credential keys
pub const KEY_ADMIN_URL: &str = "admin_dashboard_url";
pub const KEY_TERMINAL_ID: &str = "terminal_id";
pub const KEY_API_KEY: &str = "pos_api_key";

const ALL_KEYS: &[&str] = &[KEY_ADMIN_URL, KEY_TERMINAL_ID, KEY_API_KEY];

fn keyring_error(key: &str, err: keyring::Error) -> SyncError {
    SyncError::storage(format!("keyring {key}: {err}"))
}

// ---------------------------------------------------------------------------
// Low-level helpers
// ---------------------------------------------------------------------------

/// Read one credential. Missing entries and platform errors both yield
/// `None`; the latter are logged.
pub fn get_credential(key: &str) -> Option<String> {
    let entry = match Entry::new(SERVICE_NAME, key) {
        Ok(e) => e,
        Err(e) => {
            warn!(key, error = %e, "keyring: failed to create entry");
            return None;
        }
    };
    match entry.get_password() {
        Ok(pw) => Some(pw),
        Err(keyring::Error::NoEntry) => None,
        Err(e) => {
            warn!(key, error = %e, "keyring: failed to read credential");
            None
        }
    }
}

pub fn set_credential(key: &str, value: &str) -> Result<(), SyncError> {
    let entry = Entry::new(SERVICE_NAME, key).map_err(|e| keyring_error(key, e))?;
    entry
        .set_password(value)
        .map_err(|e| keyring_error(key, e))
}

/// Delete one credential; a missing entry is not an error.
pub fn delete_credential(key: &str) -> Result<(), SyncError> {
    let entry = Entry::new(SERVICE_NAME, key).map_err(|e| keyring_error(key, e))?;
    match entry.delete_credential() {
        Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
        Err(e) => Err(keyring_error(key, e)),
    }
}

// ---------------------------------------------------------------------------
// Terminal credentials
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalCredentials {
    pub admin_url: Option<String>,
    pub terminal_id: String,
    pub api_key: String,
}

/// Work out what to store from onboarding input. `raw_api_key` may be a
/// plain key or a connection string; values decoded from a connection string
/// win over the explicit arguments.
pub fn resolve_terminal_credentials(
    raw_api_key: &str,
    terminal_id: Option<&str>,
    admin_url: Option<&str>,
) -> Result<TerminalCredentials, SyncError> {
    let mut api_key = raw_api_key.trim().to_string();
    let mut terminal_id = terminal_id
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());
    let mut admin_url = admin_url
        .map(api::normalize_admin_url)
        .filter(|s| !s.is_empty());

    if let Some(decoded_key) = api::extract_api_key_from_connection_string(raw_api_key) {
        api_key = decoded_key;
        if let Some(decoded_tid) = api::extract_terminal_id_from_connection_string(raw_api_key) {
            terminal_id = Some(decoded_tid);
        }
        if let Some(decoded_url) = api::extract_admin_url_from_connection_string(raw_api_key) {
            admin_url = Some(decoded_url);
        }
    }

    if api_key.is_empty() {
        return Err(SyncError::NotConfigured("missing API key".into()));
    }
    let terminal_id =
        terminal_id.ok_or_else(|| SyncError::NotConfigured("missing terminal id".into()))?;

    Ok(TerminalCredentials {
        admin_url,
        terminal_id,
        api_key,
    })
}

pub fn store_terminal_credentials(credentials: &TerminalCredentials) -> Result<(), SyncError> {
    set_credential(KEY_TERMINAL_ID, &credentials.terminal_id)?;
    set_credential(KEY_API_KEY, &credentials.api_key)?;
    if let Some(url) = credentials.admin_url.as_deref() {
        set_credential(KEY_ADMIN_URL, url)?;
    }
    info!(terminal_id = %credentials.terminal_id, "terminal credentials updated");
    Ok(())
}

/// Delete every stored credential (factory reset).
pub fn clear_credentials() -> Result<(), SyncError> {
    info!("deleting stored terminal credentials");
    for key in ALL_KEYS {
        delete_credential(key)?;
    }
    Ok(())
}
