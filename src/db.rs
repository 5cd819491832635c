//! Local SQLite database layer for the offline sync queue.
//!
//! Uses rusqlite with WAL mode. Unlike the rest of the POS database the queue
//! runs with `synchronous = FULL`: an enqueue that returned must survive a
//! crash or power loss, otherwise a cashier's order silently disappears.

use rusqlite::{params, Connection};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{error, info, warn};

use crate::error::SyncError;

/// Shared handle to the queue database.
pub struct DbState {
    pub conn: Mutex<Connection>,
    pub db_path: PathBuf,
}

/// Current schema version. Bump when adding new migrations.
pub const CURRENT_SCHEMA_VERSION: i32 = 2;

const DB_FILE_NAME: &str = "pos-sync.db";

/// Initialize the database at `{data_dir}/pos-sync.db`.
///
/// Creates the directory if needed, opens the connection, sets pragmas and
/// runs pending migrations. Unlike a disposable cache, the queue file is
/// never deleted on open failure: it may hold orders not yet on the server.
pub fn init(data_dir: &Path) -> Result<DbState, SyncError> {
    fs::create_dir_all(data_dir)
        .map_err(|e| SyncError::storage(format!("create data dir: {e}")))?;

    let db_path = data_dir.join(DB_FILE_NAME);
    info!("Opening sync queue database at {}", db_path.display());

    let conn = match open_and_configure(&db_path) {
        Ok(c) => c,
        Err(first_err) => {
            warn!("Queue database open failed ({first_err}), retrying once");
            open_and_configure(&db_path)?
        }
    };

    run_migrations(&conn)?;

    info!("Sync queue database ready (schema v{CURRENT_SCHEMA_VERSION})");

    Ok(DbState {
        conn: Mutex::new(conn),
        db_path,
    })
}

/// In-memory database with the full schema. Nothing survives drop.
pub fn init_in_memory() -> Result<DbState, SyncError> {
    let conn = Connection::open_in_memory()?;
    conn.execute_batch(
        "PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;",
    )?;
    run_migrations(&conn)?;
    Ok(DbState {
        conn: Mutex::new(conn),
        db_path: PathBuf::from(":memory:"),
    })
}

fn open_and_configure(path: &Path) -> Result<Connection, SyncError> {
    let conn = Connection::open(path)?;

    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = FULL;",
    )?;

    Ok(conn)
}

/// Run all pending migrations up to `CURRENT_SCHEMA_VERSION`.
fn run_migrations(conn: &Connection) -> Result<(), SyncError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )?;

    let current = schema_version(conn);
    if current >= CURRENT_SCHEMA_VERSION {
        info!("Queue schema up to date (v{current})");
        return Ok(());
    }

    info!("Migrating queue schema from v{current} to v{CURRENT_SCHEMA_VERSION}");

    if current < 1 {
        migrate_v1(conn)?;
    }
    if current < 2 {
        migrate_v2(conn)?;
    }

    Ok(())
}

/// Highest applied migration, 0 for a fresh file.
pub fn schema_version(conn: &Connection) -> i32 {
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )
    .unwrap_or(0)
}

/// Migration v1: queue tables, snapshot and settings.
fn migrate_v1(conn: &Connection) -> Result<(), SyncError> {
    conn.execute_batch(
        "
        -- local_settings (category/key/value store)
        CREATE TABLE IF NOT EXISTS local_settings (
            id TEXT PRIMARY KEY DEFAULT (lower(hex(randomblob(16)))),
            setting_category TEXT NOT NULL,
            setting_key TEXT NOT NULL,
            setting_value TEXT NOT NULL,
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now')),
            UNIQUE(setting_category, setting_key)
        );

        -- pending_orders (seq preserves insertion order)
        CREATE TABLE IF NOT EXISTS pending_orders (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            temp_id TEXT UNIQUE NOT NULL,
            items TEXT NOT NULL DEFAULT '[]',
            channel TEXT NOT NULL,
            table_id INTEGER,
            customer_id INTEGER,
            shift_id INTEGER NOT NULL,
            created_at TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending'
                CHECK(status IN ('pending', 'synced', 'error')),
            error_message TEXT,
            rejection_kind TEXT,
            real_id INTEGER,
            order_number INTEGER,
            synced_at TEXT,
            updated_at TEXT DEFAULT (datetime('now'))
        );

        -- pending_payments (always keyed to the order's temp id)
        CREATE TABLE IF NOT EXISTS pending_payments (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            payment_id TEXT UNIQUE NOT NULL,
            temp_order_id TEXT NOT NULL,
            method TEXT NOT NULL,
            amount REAL NOT NULL,
            tendered REAL,
            change_given REAL,
            created_at TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending'
                CHECK(status IN ('pending', 'synced', 'error')),
            error_message TEXT,
            synced_at TEXT,
            updated_at TEXT DEFAULT (datetime('now')),
            FOREIGN KEY(temp_order_id) REFERENCES pending_orders(temp_id) ON DELETE CASCADE
        );

        -- sync_snapshot (single row, replaced wholesale)
        CREATE TABLE IF NOT EXISTS sync_snapshot (
            id INTEGER PRIMARY KEY CHECK(id = 1),
            products TEXT NOT NULL DEFAULT '[]',
            categories TEXT NOT NULL DEFAULT '[]',
            printer_routing TEXT NOT NULL DEFAULT '[]',
            server_time TEXT NOT NULL,
            sync_token TEXT NOT NULL,
            pulled_at TEXT DEFAULT (datetime('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_pending_orders_status ON pending_orders(status);
        CREATE INDEX IF NOT EXISTS idx_pending_orders_order_number ON pending_orders(order_number);
        CREATE INDEX IF NOT EXISTS idx_pending_payments_status ON pending_payments(status);
        CREATE INDEX IF NOT EXISTS idx_pending_payments_order ON pending_payments(temp_order_id);

        INSERT INTO schema_version (version) VALUES (1);
        ",
    )
    .map_err(|e| {
        error!("Migration v1 failed: {e}");
        SyncError::storage(format!("migration v1: {e}"))
    })?;

    info!("Applied migration v1");
    Ok(())
}

fn column_exists(conn: &Connection, table: &str, column: &str) -> Result<bool, SyncError> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Migration v2: push attempt accounting on queued orders.
fn migrate_v2(conn: &Connection) -> Result<(), SyncError> {
    if !column_exists(conn, "pending_orders", "push_attempts")? {
        conn.execute_batch(
            "ALTER TABLE pending_orders ADD COLUMN push_attempts INTEGER NOT NULL DEFAULT 0;",
        )?;
    }
    if !column_exists(conn, "pending_orders", "last_attempt_at")? {
        conn.execute_batch("ALTER TABLE pending_orders ADD COLUMN last_attempt_at TEXT;")?;
    }

    conn.execute_batch("INSERT INTO schema_version (version) VALUES (2);")
        .map_err(|e| {
            error!("Migration v2 failed: {e}");
            SyncError::storage(format!("migration v2: {e}"))
        })?;

    info!("Applied migration v2 (push attempt accounting)");
    Ok(())
}

// ---------------------------------------------------------------------------
// Settings helpers
// ---------------------------------------------------------------------------

/// Get a single setting value.
pub fn get_setting(conn: &Connection, category: &str, key: &str) -> Option<String> {
    conn.query_row(
        "SELECT setting_value FROM local_settings WHERE setting_category = ?1 AND setting_key = ?2",
        params![category, key],
        |row| row.get(0),
    )
    .ok()
}

/// Insert or update a setting.
pub fn set_setting(
    conn: &Connection,
    category: &str,
    key: &str,
    value: &str,
) -> Result<(), SyncError> {
    conn.execute(
        "INSERT INTO local_settings (setting_category, setting_key, setting_value, updated_at)
         VALUES (?1, ?2, ?3, datetime('now'))
         ON CONFLICT(setting_category, setting_key) DO UPDATE SET
            setting_value = excluded.setting_value,
            updated_at = excluded.updated_at",
        params![category, key, value],
    )?;
    Ok(())
}
