//! Diagnostics for the sync engine.
//!
//! Provides:
//! - **About info**: version, build timestamp, git SHA, platform
//! - **Sync health**: schema version, queue counts, snapshot age, status
//! - **Diagnostics export**: health, queue contents, recent rejections and
//!   log files in a zip bundle.
//! - **Log rotation helpers**: used by `init_logging` to cap retained files.

use serde_json::{json, Value};
use std::fs;
use std::io::{Read as _, Write as _};
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

use crate::db;
use crate::error::SyncError;
use crate::sync::SyncOrchestrator;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Maximum number of log files to retain.
pub const MAX_LOG_FILES: usize = 10;

/// Maximum bytes copied from one log file into an export (5 MB).
pub const MAX_LOG_SIZE: u64 = 5 * 1024 * 1024;

/// Prefix of the daily rolling log files.
pub const LOG_FILE_PREFIX: &str = "pos-sync";

const RECENT_ERROR_LIMIT: i64 = 20;

#[derive(Debug, Clone, Copy)]
pub struct DiagnosticsExportOptions {
    pub include_logs: bool,
    pub redact_sensitive: bool,
}

impl Default for DiagnosticsExportOptions {
    fn default() -> Self {
        Self {
            include_logs: true,
            redact_sensitive: false,
        }
    }
}

// ---------------------------------------------------------------------------
// About info
// ---------------------------------------------------------------------------

/// Returns version, build timestamp, git SHA, and platform info.
pub fn get_about_info() -> Value {
    json!({
        "version": env!("CARGO_PKG_VERSION"),
        "buildTimestamp": env!("BUILD_TIMESTAMP"),
        "gitSha": env!("BUILD_GIT_SHA"),
        "platform": std::env::consts::OS,
        "arch": std::env::consts::ARCH,
        "rustVersion": env!("CARGO_PKG_RUST_VERSION"),
    })
}

// ---------------------------------------------------------------------------
// Sync health
// ---------------------------------------------------------------------------

/// Snapshot of everything an operator needs to judge whether the terminal
/// is keeping up with the dashboard.
pub fn get_sync_health(orchestrator: &SyncOrchestrator) -> Result<Value, SyncError> {
    let queue = orchestrator.queue();
    let db_state = queue.db();

    // Scoped so the connection lock is released before the queue helpers
    // take it again (std Mutex is not reentrant).
    let schema_version = {
        let conn = db_state.conn.lock()?;
        db::schema_version(&conn)
    };
    let db_size = fs::metadata(&db_state.db_path).map(|m| m.len()).unwrap_or(0);

    let counts = queue.queue_counts()?;
    let pulled_at = queue.snapshot_pulled_at()?;
    let has_sync_token = queue.sync_token()?.is_some();
    let indicator = orchestrator.indicator()?;
    let status = orchestrator.status();

    Ok(json!({
        "schemaVersion": schema_version,
        "dbSizeBytes": db_size,
        "online": orchestrator.connectivity().is_online(),
        "status": status,
        "indicator": indicator,
        "queue": counts,
        "snapshot": {
            "pulledAt": pulled_at,
            "ageSeconds": pulled_at.map(|at| (chrono::Utc::now() - at).num_seconds()),
            "hasSyncToken": has_sync_token,
        },
        "recentErrors": queue.recent_errors(RECENT_ERROR_LIMIT)?,
    }))
}

// ---------------------------------------------------------------------------
// Diagnostics export (zip bundle)
// ---------------------------------------------------------------------------

fn zip_error(err: impl std::fmt::Display) -> SyncError {
    SyncError::storage(format!("diagnostics zip: {err}"))
}

fn write_json_entry(
    zip: &mut ZipWriter<fs::File>,
    name: &str,
    value: Value,
    export_options: DiagnosticsExportOptions,
    file_options: SimpleFileOptions,
) -> Result<(), SyncError> {
    let value = redact_value_for_export(value, export_options.redact_sensitive);
    let body = serde_json::to_vec_pretty(&value).map_err(zip_error)?;
    zip.start_file(name, file_options).map_err(zip_error)?;
    zip.write_all(&body).map_err(zip_error)?;
    Ok(())
}

/// Write a diagnostics zip into `output_dir` and return its path.
pub fn export_diagnostics(
    orchestrator: &SyncOrchestrator,
    output_dir: &Path,
    log_dir: &Path,
    export_options: DiagnosticsExportOptions,
) -> Result<PathBuf, SyncError> {
    fs::create_dir_all(output_dir).map_err(zip_error)?;

    let timestamp = chrono::Utc::now().format("%Y%m%d_%H%M%S").to_string();
    let zip_path = output_dir.join(format!("thesmall-pos-sync-diagnostics-{timestamp}.zip"));

    let file = fs::File::create(&zip_path).map_err(zip_error)?;
    let mut zip = ZipWriter::new(file);
    let file_options =
        SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);

    let queue = orchestrator.queue();

    // 1. About info
    write_json_entry(&mut zip, "about.json", get_about_info(), export_options, file_options)?;

    // 2. Sync health
    write_json_entry(
        &mut zip,
        "sync_health.json",
        get_sync_health(orchestrator)?,
        export_options,
        file_options,
    )?;

    // 3. Queue contents still waiting on the server or a human
    let pending_orders = queue.list_pending_orders()?;
    let error_orders = queue.list_error_orders()?;
    let pending_payments = queue.list_pending_payments()?;
    write_json_entry(
        &mut zip,
        "queue.json",
        json!({
            "pendingOrders": pending_orders,
            "errorOrders": error_orders,
            "pendingPayments": pending_payments,
        }),
        export_options,
        file_options,
    )?;

    // 4. Recent rejections
    write_json_entry(
        &mut zip,
        "sync_errors.json",
        json!(queue.recent_errors(RECENT_ERROR_LIMIT)?),
        export_options,
        file_options,
    )?;

    // 5. Log files (never in a redacted bundle: they are free text)
    if export_options.include_logs && !export_options.redact_sensitive {
        for path in log_files(log_dir) {
            let Some(fname) = path.file_name().map(|n| n.to_string_lossy().to_string()) else {
                continue;
            };
            let mut buf = Vec::new();
            match fs::File::open(&path) {
                Ok(f) => {
                    if let Err(e) = f.take(MAX_LOG_SIZE).read_to_end(&mut buf) {
                        warn!("Skipping unreadable log {}: {e}", path.display());
                        continue;
                    }
                }
                Err(e) => {
                    warn!("Skipping unreadable log {}: {e}", path.display());
                    continue;
                }
            }
            zip.start_file(format!("logs/{fname}"), file_options)
                .map_err(zip_error)?;
            zip.write_all(&buf).map_err(zip_error)?;
        }
    }

    zip.finish().map_err(zip_error)?;
    info!(path = %zip_path.display(), "Diagnostics bundle written");
    Ok(zip_path)
}

fn redact_value_for_export(value: Value, enabled: bool) -> Value {
    if !enabled {
        return value;
    }
    redact_sensitive_fields(value)
}

fn redact_sensitive_fields(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut redacted = serde_json::Map::new();
            for (key, value) in map {
                if should_redact_key(&key) {
                    redacted.insert(key, Value::String("[REDACTED]".to_string()));
                } else {
                    redacted.insert(key, redact_sensitive_fields(value));
                }
            }
            Value::Object(redacted)
        }
        Value::Array(items) => {
            Value::Array(items.into_iter().map(redact_sensitive_fields).collect())
        }
        other => other,
    }
}

fn should_redact_key(key: &str) -> bool {
    let normalized = key.to_ascii_lowercase();
    let sensitive_markers = [
        "api_key",
        "apikey",
        "secret",
        "password",
        "token",
        "authorization",
        "notes",
        "clientid",
        "customer",
    ];
    sensitive_markers
        .iter()
        .any(|marker| normalized.contains(marker))
}

// ---------------------------------------------------------------------------
// Log rotation
// ---------------------------------------------------------------------------

fn is_log_file(path: &Path) -> bool {
    path.is_file()
        && path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with(&format!("{LOG_FILE_PREFIX}.")))
}

/// Log files in `log_dir`, newest first.
fn log_files(log_dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(log_dir) else {
        return Vec::new();
    };
    let mut files: Vec<(PathBuf, std::time::SystemTime)> = entries
        .flatten()
        .filter(|entry| is_log_file(&entry.path()))
        .map(|entry| {
            let modified = entry
                .metadata()
                .ok()
                .and_then(|m| m.modified().ok())
                .unwrap_or(std::time::UNIX_EPOCH);
            (entry.path(), modified)
        })
        .collect();
    files.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| b.0.cmp(&a.0)));
    files.into_iter().map(|(path, _)| path).collect()
}

/// Prune old log files, keeping only the most recent `MAX_LOG_FILES`.
pub fn prune_old_logs(log_dir: &Path) {
    for path in log_files(log_dir).iter().skip(MAX_LOG_FILES) {
        if let Err(e) = fs::remove_file(path) {
            warn!("Failed to prune log file {}: {e}", path.display());
        }
    }
}
