//! Persistence for finalized conversational turns.
//!
//! Provides the pooled (`r2d2`) history database, opened in WAL mode with
//! its embedded SQL migrations applied, and the queries behind turn
//! history, export and deletion. The session orchestrator never blocks on this crate directly:
//! callers run these functions on the blocking pool.
//!
//! # Design decisions
//!
//! - **SQLite with WAL mode**: a single streaming node owns its history; WAL
//!   allows the HTTP history endpoints to read while sessions append.
//! - **Turns stored as JSON plus indexed columns**: the full [`Turn`] is kept
//!   verbatim for export, while `session_id`, `turn_id` and `completion` are
//!   real columns for filtering.
//!
//! [`Turn`]: holo_types::Turn

mod migrations;
mod pool;
mod turns;

pub use migrations::{run_migrations, MigrationError};
pub use pool::{open_history_db, DbPool, HistoryDbSettings, OpenError, IN_MEMORY};
pub use turns::{
    close_session_record, count_turns, delete_session_turns, export_session, get_session_record,
    insert_session_record, list_turns, save_turn, SessionRecord, StoreError,
};
