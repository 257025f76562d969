//! [`SqliteStore`] -- SQLite-backed storage implementation.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::Connection;
use tracing::{debug, info};

use crate::error::{Result, StorageError};
use crate::sqlite::schema;

/// SQLite-backed implementation of the [`Storage`](crate::traits::Storage) trait.
///
/// Wraps a [`rusqlite::Connection`] in a `Mutex`. Every operation, including
/// each read-modify-write of a node's linked-id sets, runs while holding the
/// lock, so writes to the same node never interleave.
pub struct SqliteStore {
    pub(crate) conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Opens (or creates) the form graph database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!(?path, "opening form graph database");
        let conn = Connection::open(path)
            .map_err(|e| StorageError::Connection(format!("failed to open {}: {e}", path.display())))?;
        Self::with_connection(conn)
    }

    /// Opens a private in-memory graph.
    pub fn open_in_memory() -> Result<Self> {
        debug!("opening in-memory form graph");
        let conn = Connection::open_in_memory()
            .map_err(|e| StorageError::Connection(format!("failed to open in-memory db: {e}")))?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        // Cascading deletes of capacities and variables rely on foreign keys.
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .map_err(|e| StorageError::Connection(format!("failed to set pragmas: {e}")))?;
        ensure_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub(crate) fn lock_conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| StorageError::Connection(format!("mutex poisoned: {e}")))
    }

    /// Checkpoints the write-ahead log.
    pub(crate) fn close_impl(&self) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")
            .map_err(|e| StorageError::Connection(format!("checkpoint failed: {e}")))?;
        debug!("database checkpointed");
        Ok(())
    }
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore").finish_non_exhaustive()
    }
}

/// Brings the schema up to [`schema::SCHEMA_VERSION`]. A database written by
/// a newer release is refused rather than downgraded.
fn ensure_schema(conn: &Connection) -> Result<()> {
    let stored: i32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    if stored == schema::SCHEMA_VERSION {
        debug!(version = stored, "schema up to date");
        return Ok(());
    }
    if stored > schema::SCHEMA_VERSION {
        return Err(StorageError::Migration {
            name: format!("schema v{stored}"),
            reason: format!("this build only understands up to v{}", schema::SCHEMA_VERSION),
        });
    }

    for (i, stmt) in schema::SCHEMA_STATEMENTS.iter().enumerate() {
        conn.execute_batch(stmt).map_err(|e| StorageError::Migration {
            name: format!("schema statement {i}"),
            reason: e.to_string(),
        })?;
    }
    conn.pragma_update(None, "user_version", schema::SCHEMA_VERSION)?;
    info!(from = stored, to = schema::SCHEMA_VERSION, "schema upgraded");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn user_version(store: &SqliteStore) -> i32 {
        let conn = store.lock_conn().unwrap();
        conn.query_row("PRAGMA user_version", [], |row| row.get(0)).unwrap()
    }

    #[test]
    fn fresh_store_is_empty_and_versioned() {
        let store = SqliteStore::open_in_memory().unwrap();
        let conn = store.lock_conn().unwrap();
        let count: i32 = conn
            .query_row("SELECT COUNT(*) FROM nodes", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
        drop(conn);
        assert_eq!(user_version(&store), schema::SCHEMA_VERSION);
    }

    #[test]
    fn schema_is_applied_once() {
        let store = SqliteStore::open_in_memory().unwrap();
        let conn = store.lock_conn().unwrap();
        ensure_schema(&conn).unwrap();
        conn.pragma_update(None, "user_version", 1).unwrap();
        ensure_schema(&conn).unwrap();
        drop(conn);
        assert_eq!(user_version(&store), schema::SCHEMA_VERSION);
    }

    #[test]
    fn newer_schema_is_refused() {
        let conn = Connection::open_in_memory().unwrap();
        conn.pragma_update(None, "user_version", schema::SCHEMA_VERSION + 1).unwrap();
        let err = ensure_schema(&conn).unwrap_err();
        assert!(matches!(err, StorageError::Migration { .. }), "{err}");
    }

    #[test]
    fn file_database_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("graph.db");
        {
            let store = SqliteStore::open(&path).unwrap();
            store.close_impl().unwrap();
        }
        assert!(path.exists());
        let reopened = SqliteStore::open(&path).unwrap();
        assert_eq!(user_version(&reopened), schema::SCHEMA_VERSION);
    }
}
