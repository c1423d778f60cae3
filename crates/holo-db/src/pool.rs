//! Opening the turn history database.
//!
//! [`open_history_db`] is the single entry point: it prepares the file's
//! directory, pools connections with the pragmas turn appends rely on, and
//! brings the schema up to date before anyone reads from it.

use crate::migrations::{run_migrations, MigrationError};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, OpenFlags};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Path that selects a private in-memory database.
pub const IN_MEMORY: &str = ":memory:";

pub type DbPool = Pool<SqliteConnectionManager>;

/// Connection settings, taken from the `[database]` config section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryDbSettings {
    /// How long a writer waits on a locked database before failing.
    pub busy_timeout_ms: u64,
    pub max_connections: u32,
}

impl Default for HistoryDbSettings {
    fn default() -> Self {
        Self {
            busy_timeout_ms: 5_000,
            max_connections: 8,
        }
    }
}

#[derive(Debug, Error)]
pub enum OpenError {
    #[error("cannot create database directory {path}: {source}")]
    Directory {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("cannot open database pool: {0}")]
    Pool(#[from] r2d2::Error),

    #[error(transparent)]
    Migration(#[from] MigrationError),
}

/// Opens (creating if needed) the history database at `path` and applies
/// pending migrations. Returns the pool and how many migrations ran.
///
/// Every connection to [`IN_MEMORY`] is its own database, so that path gets
/// a single-connection pool.
///
/// # Errors
///
/// Fails if the directory cannot be created, a connection cannot be opened
/// or configured, or a migration fails.
pub fn open_history_db(
    path: &str,
    settings: HistoryDbSettings,
) -> Result<(DbPool, usize), OpenError> {
    let in_memory = path == IN_MEMORY;
    if !in_memory {
        ensure_parent_dir(Path::new(path))?;
    }
    let max_size = if in_memory {
        1
    } else {
        settings.max_connections.max(1)
    };

    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_FULL_MUTEX;
    let busy_timeout_ms = settings.busy_timeout_ms;
    let manager = SqliteConnectionManager::file(path)
        .with_flags(flags)
        .with_init(move |conn| prepare_connection(conn, busy_timeout_ms));
    let pool = Pool::builder().max_size(max_size).build(manager)?;

    let applied = {
        let conn = pool.get()?;
        run_migrations(&conn)?
    };
    tracing::debug!(path, max_size, applied, "turn history database ready");
    Ok((pool, applied))
}

fn ensure_parent_dir(path: &Path) -> Result<(), OpenError> {
    let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) else {
        return Ok(());
    };
    std::fs::create_dir_all(dir).map_err(|source| OpenError::Directory {
        path: dir.to_path_buf(),
        source,
    })
}

/// WAL lets the history endpoints read while sessions append; `NORMAL`
/// sync is durable under WAL except on power loss.
fn prepare_connection(conn: &mut Connection, busy_timeout_ms: u64) -> Result<(), rusqlite::Error> {
    let journal_mode: String = conn.query_row("PRAGMA journal_mode = WAL;", [], |row| row.get(0))?;
    if journal_mode != "wal" && journal_mode != "memory" {
        return Err(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_ERROR),
            Some(format!("journal mode stayed {journal_mode}, expected wal")),
        ));
    }
    conn.execute_batch(&format!(
        "PRAGMA foreign_keys = ON;
         PRAGMA synchronous = NORMAL;
         PRAGMA busy_timeout = {busy_timeout_ms};"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pragma(conn: &Connection, name: &str) -> i64 {
        conn.query_row(&format!("PRAGMA {name};"), [], |row| row.get(0))
            .unwrap()
    }

    #[test]
    fn opens_nested_path_and_migrates_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data/history/turns.db");
        let path = path.to_str().unwrap();
        let settings = HistoryDbSettings {
            busy_timeout_ms: 2_500,
            max_connections: 3,
        };

        let (pool, applied) = open_history_db(path, settings).unwrap();
        assert!(applied > 0);
        assert_eq!(pool.max_size(), 3);

        let conn = pool.get().unwrap();
        let mode: String = conn
            .query_row("PRAGMA journal_mode;", [], |row| row.get(0))
            .unwrap();
        assert_eq!(mode, "wal");
        assert_eq!(pragma(&conn, "busy_timeout"), 2_500);
        assert_eq!(pragma(&conn, "foreign_keys"), 1);
        // NORMAL
        assert_eq!(pragma(&conn, "synchronous"), 1);
        drop(conn);
        drop(pool);

        let (_, applied) = open_history_db(path, settings).unwrap();
        assert_eq!(applied, 0);
    }

    #[test]
    fn in_memory_database_is_a_single_connection() {
        let (pool, applied) = open_history_db(IN_MEMORY, HistoryDbSettings::default()).unwrap();
        assert!(applied > 0);
        assert_eq!(pool.max_size(), 1);

        // The schema is visible through the pool's only connection.
        let conn = pool.get().unwrap();
        let turns: i64 = conn
            .query_row("SELECT COUNT(*) FROM turns", [], |row| row.get(0))
            .unwrap();
        assert_eq!(turns, 0);
    }

    #[test]
    fn unusable_directory_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("occupied");
        std::fs::write(&blocker, b"not a directory").unwrap();
        let path = blocker.join("turns.db");

        let err = open_history_db(path.to_str().unwrap(), HistoryDbSettings::default())
            .unwrap_err();
        assert!(matches!(err, OpenError::Directory { .. }), "{err}");
    }
}
