use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, OpenFlags};
use std::path::Path;

use crate::candle::Interval;
use crate::error::HubError;

pub type DbPool = Pool<SqliteConnectionManager>;

/// Create a read-write SQLite pool for the candle database, creating the file
/// and its parent directory when missing.
pub fn open_rw_pool(path: &Path, max_size: u32) -> Result<DbPool, HubError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .map_err(|e| HubError::Storage(format!("create {}: {e}", parent.display())))?;
        }
    }

    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_NO_MUTEX
        | OpenFlags::SQLITE_OPEN_URI;
    let manager = SqliteConnectionManager::file(path)
        .with_flags(flags)
        .with_init(|conn| conn.busy_timeout(std::time::Duration::from_secs(5)));
    let pool = Pool::builder().max_size(max_size.max(1)).build(manager)?;

    let conn = pool.get()?;
    ensure_schema(&conn)?;
    tracing::info!("candle store ready at {}", path.display());
    Ok(pool)
}

/// Single-connection in-memory pool. Every `memory()` connection is its own
/// database, so the pool is capped at one.
pub fn open_memory_pool() -> Result<DbPool, HubError> {
    let pool = Pool::builder()
        .max_size(1)
        .build(SqliteConnectionManager::memory())?;
    let conn = pool.get()?;
    ensure_schema(&conn)?;
    Ok(pool)
}

/// Create one table per supported interval. Prices are TEXT so decimals are
/// stored exactly.
pub fn ensure_schema(conn: &Connection) -> Result<(), HubError> {
    // Pragmas (best-effort).
    let _ = conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;");

    for interval in Interval::all() {
        let table = interval.table_name();
        conn.execute_batch(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                exchange TEXT NOT NULL,
                symbol TEXT NOT NULL,
                epoch INTEGER NOT NULL,
                open TEXT NOT NULL,
                high TEXT NOT NULL,
                low TEXT NOT NULL,
                close TEXT NOT NULL,
                volume TEXT NOT NULL,
                PRIMARY KEY (exchange, symbol, epoch)
            );
            "#
        ))?;
    }
    Ok(())
}
