//! Local SQLite database layer.
//!
//! Uses rusqlite with WAL mode. Provides schema migrations, a small
//! bookkeeping key/value table for engine state, and the shared connection
//! handle used by the store, outbox and settings modules.

use rusqlite::{params, Connection, OptionalExtension};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{error, info, warn};

use crate::error::{Error, Result};

/// Shared database handle. Every store operation locks `conn` for the
/// duration of a single statement or short transaction.
pub struct DbState {
    pub conn: Mutex<Connection>,
    pub db_path: PathBuf,
}

/// Current schema version. Bump when adding new migrations.
const CURRENT_SCHEMA_VERSION: i32 = 2;

const DB_FILE_NAME: &str = "fieldrep.db";

/// Initialize the database at `{data_dir}/fieldrep.db`.
///
/// Creates the directory if needed, opens the connection, sets pragmas,
/// and runs any pending migrations. On open failure, deletes the file and
/// retries once.
pub fn init(data_dir: &Path) -> Result<DbState> {
    fs::create_dir_all(data_dir)
        .map_err(|e| Error::LocalStore(format!("failed to create data dir: {e}")))?;

    let db_path = data_dir.join(DB_FILE_NAME);
    info!("Opening database at {}", db_path.display());

    let conn = match open_and_configure(&db_path) {
        Ok(c) => c,
        Err(first_err) => {
            warn!(
                "Database open failed ({}), deleting and retrying once",
                first_err
            );
            if db_path.exists() {
                let _ = fs::remove_file(&db_path);
                let _ = fs::remove_file(db_path.with_extension("db-wal"));
                let _ = fs::remove_file(db_path.with_extension("db-shm"));
            }
            open_and_configure(&db_path).map_err(|e| {
                Error::LocalStore(format!("database open failed after retry: {e}"))
            })?
        }
    };

    run_migrations(&conn)?;

    info!("Database initialized (schema v{CURRENT_SCHEMA_VERSION})");

    Ok(DbState {
        conn: Mutex::new(conn),
        db_path,
    })
}

/// Open a fully migrated in-memory database.
pub fn open_in_memory() -> Result<DbState> {
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

/// Open the database file and apply pragmas.
fn open_and_configure(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path).map_err(|e| Error::LocalStore(format!("sqlite open: {e}")))?;

    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )
    .map_err(|e| Error::LocalStore(format!("pragma setup: {e}")))?;

    // Fail fast on a corrupt file so `init` can take the retry path.
    conn.query_row("SELECT COUNT(*) FROM sqlite_master", [], |row| {
        row.get::<_, i64>(0)
    })
    .map_err(|e| Error::LocalStore(format!("sqlite probe: {e}")))?;

    Ok(conn)
}

/// Run all pending migrations up to `CURRENT_SCHEMA_VERSION`.
fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )
    .map_err(|e| Error::LocalStore(format!("create schema_version: {e}")))?;

    let current: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current >= CURRENT_SCHEMA_VERSION {
        info!("Database schema up to date (v{current})");
        return Ok(());
    }

    info!("Migrating database from v{current} to v{CURRENT_SCHEMA_VERSION}");

    if current < 1 {
        migrate_v1(conn)?;
    }
    if current < 2 {
        migrate_v2(conn)?;
    }

    Ok(())
}

/// Migration v1: one table per collection, session cache, outbox.
fn migrate_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS farmacias (
            id TEXT PRIMARY KEY,
            data TEXT NOT NULL,
            updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
        );
        CREATE TABLE IF NOT EXISTS opticas (
            id TEXT PRIMARY KEY,
            data TEXT NOT NULL,
            updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
        );
        CREATE TABLE IF NOT EXISTS productos (
            id TEXT PRIMARY KEY,
            data TEXT NOT NULL,
            updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
        );
        CREATE TABLE IF NOT EXISTS pedidos (
            id TEXT PRIMARY KEY,
            data TEXT NOT NULL,
            updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
        );
        CREATE TABLE IF NOT EXISTS visitas (
            id TEXT PRIMARY KEY,
            data TEXT NOT NULL,
            updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
        );
        CREATE TABLE IF NOT EXISTS mine (
            id TEXT PRIMARY KEY,
            data TEXT NOT NULL,
            updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
        );
        CREATE TABLE IF NOT EXISTS settings (
            id TEXT PRIMARY KEY,
            data TEXT NOT NULL,
            updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
        );

        -- auth (cached session, single row keyed 'session')
        CREATE TABLE IF NOT EXISTS auth (
            id TEXT PRIMARY KEY,
            data TEXT NOT NULL,
            updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
        );

        -- outbox (append-only)
        CREATE TABLE IF NOT EXISTS outbox (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            id TEXT UNIQUE NOT NULL,
            op TEXT NOT NULL CHECK (op IN ('put', 'delete')),
            store TEXT NOT NULL,
            key TEXT NOT NULL,
            data TEXT,
            created_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_outbox_created_at ON outbox(created_at, seq);
        CREATE INDEX IF NOT EXISTS idx_outbox_store_key ON outbox(store, key);

        INSERT INTO schema_version (version) VALUES (1);
        ",
    )
    .map_err(|e| {
        error!("Migration v1 failed: {e}");
        Error::LocalStore(format!("migration v1: {e}"))
    })?;

    info!("Applied migration v1");
    Ok(())
}

/// Migration v2: engine bookkeeping (last sync time, last pull counts).
fn migrate_v2(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS sync_meta (
            meta_key TEXT PRIMARY KEY,
            meta_value TEXT NOT NULL,
            updated_at TEXT DEFAULT (datetime('now'))
        );

        INSERT INTO schema_version (version) VALUES (2);
        ",
    )
    .map_err(|e| {
        error!("Migration v2 failed: {e}");
        Error::LocalStore(format!("migration v2: {e}"))
    })?;

    info!("Applied migration v2 (sync_meta table)");
    Ok(())
}

// ---------------------------------------------------------------------------
// Bookkeeping helpers
// ---------------------------------------------------------------------------

/// Get a single engine bookkeeping value.
pub fn get_meta(conn: &Connection, key: &str) -> Result<Option<String>> {
    let value = conn
        .query_row(
            "SELECT meta_value FROM sync_meta WHERE meta_key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()?;
    Ok(value)
}

/// Insert or update an engine bookkeeping value.
pub fn set_meta(conn: &Connection, key: &str, value: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO sync_meta (meta_key, meta_value, updated_at)
         VALUES (?1, ?2, datetime('now'))
         ON CONFLICT(meta_key) DO UPDATE SET
            meta_value = excluded.meta_value,
            updated_at = excluded.updated_at",
        params![key, value],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_names(conn: &Connection) -> Vec<String> {
        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap();
        stmt.query_map([], |row| row.get(0))
            .unwrap()
            .filter_map(|r| r.ok())
            .collect()
    }

    #[test]
    fn test_migrations_create_all_tables() {
        let db = open_in_memory().expect("open");
        let conn = db.conn.lock().unwrap();
        let tables = table_names(&conn);
        for expected in [
            "auth",
            "farmacias",
            "mine",
            "opticas",
            "outbox",
            "pedidos",
            "productos",
            "schema_version",
            "settings",
            "sync_meta",
            "visitas",
        ] {
            assert!(
                tables.iter().any(|t| t == expected),
                "missing table {expected}"
            );
        }

        let version: i32 = conn
            .query_row("SELECT MAX(version) FROM schema_version", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(version, CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn test_migrations_are_idempotent() {
        let db = open_in_memory().expect("open");
        let conn = db.conn.lock().unwrap();
        run_migrations(&conn).expect("second run");
        let rows: i32 = conn
            .query_row("SELECT COUNT(*) FROM schema_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(rows, CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn test_outbox_op_check_constraint() {
        let db = open_in_memory().expect("open");
        let conn = db.conn.lock().unwrap();
        let bad = conn.execute(
            "INSERT INTO outbox (id, op, store, key, created_at)
             VALUES ('e1', 'merge', 'farmacias', 'f1', '2024-01-01T00:00:00Z')",
            [],
        );
        assert!(bad.is_err(), "unknown op should be rejected");
    }

    #[test]
    fn test_wal_mode_on_file_db() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = init(dir.path()).expect("init");
        let conn = db.conn.lock().unwrap();
        let mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
    }

    #[test]
    fn test_meta_crud() {
        let db = open_in_memory().expect("open");
        let conn = db.conn.lock().unwrap();
        assert_eq!(get_meta(&conn, "last_sync_at").unwrap(), None);
        set_meta(&conn, "last_sync_at", "2024-01-01T00:00:00Z").unwrap();
        set_meta(&conn, "last_sync_at", "2024-02-01T00:00:00Z").unwrap();
        assert_eq!(
            get_meta(&conn, "last_sync_at").unwrap().as_deref(),
            Some("2024-02-01T00:00:00Z")
        );
    }
}
