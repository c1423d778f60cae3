//! Embedded SQL migration runner.
//!
//! Migrations are SQL files compiled into the binary and applied in order on
//! startup. Applied names are recorded in `_holo_migrations`, so each
//! migration runs once per database.

use rusqlite::Connection;
use thiserror::Error;

struct Migration {
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. New migrations are appended here.
const MIGRATIONS: &[Migration] = &[
    Migration {
        name: "000_sessions",
        sql: include_str!("migrations/000_sessions.sql"),
    },
    Migration {
        name: "001_turns",
        sql: include_str!("migrations/001_turns.sql"),
    },
];

/// Errors that can occur during migration execution.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// A SQL statement within a migration failed.
    #[error("migration '{name}' failed: {source}")]
    ExecutionFailed {
        name: String,
        source: rusqlite::Error,
    },

    /// Failed to query migration state.
    #[error("failed to check migration state: {0}")]
    StateQuery(rusqlite::Error),
}

/// Applies every pending migration and returns how many ran.
///
/// # Errors
///
/// Returns `MigrationError` if a migration fails or the tracking table
/// cannot be read. A failed migration is rolled back as a whole.
pub fn run_migrations(conn: &Connection) -> Result<usize, MigrationError> {
    apply(conn, MIGRATIONS)
}

fn apply(conn: &Connection, migrations: &[Migration]) -> Result<usize, MigrationError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS _holo_migrations (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );",
    )
    .map_err(|e| MigrationError::ExecutionFailed {
        name: "_holo_migrations_bootstrap".to_string(),
        source: e,
    })?;

    let mut applied = 0;

    for migration in migrations {
        let done: bool = conn
            .query_row(
                "SELECT COUNT(*) > 0 FROM _holo_migrations WHERE name = ?1",
                [migration.name],
                |row| row.get(0),
            )
            .map_err(MigrationError::StateQuery)?;

        if done {
            tracing::debug!(migration = migration.name, "already applied");
            continue;
        }

        let failed = |e| MigrationError::ExecutionFailed {
            name: migration.name.to_string(),
            source: e,
        };

        let tx = conn.unchecked_transaction().map_err(failed)?;
        tx.execute_batch(migration.sql).map_err(failed)?;
        tx.execute(
            "INSERT INTO _holo_migrations (name) VALUES (?1)",
            [migration.name],
        )
        .map_err(failed)?;
        tx.commit().map_err(failed)?;

        tracing::info!(migration = migration.name, "applied migration");
        applied += 1;
    }

    Ok(applied)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_database_applies_everything_once() {
        let conn = Connection::open_in_memory().unwrap();
        assert_eq!(run_migrations(&conn).unwrap(), MIGRATIONS.len());
        assert_eq!(run_migrations(&conn).unwrap(), 0);

        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN ('sessions', 'turns')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 2);
    }

    #[test]
    fn failing_migration_leaves_no_trace() {
        let conn = Connection::open_in_memory().unwrap();
        let broken = [Migration {
            name: "999_broken",
            sql: "CREATE TABLE scratch (id INTEGER); INSERT INTO missing VALUES (1);",
        }];

        let err = apply(&conn, &broken).unwrap_err();
        assert!(matches!(err, MigrationError::ExecutionFailed { ref name, .. } if name == "999_broken"));

        let scratch: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE name = 'scratch'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(scratch, 0);
        let recorded: i64 = conn
            .query_row("SELECT COUNT(*) FROM _holo_migrations", [], |row| row.get(0))
            .unwrap();
        assert_eq!(recorded, 0);
    }
}
