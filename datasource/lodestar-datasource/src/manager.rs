//! Registry of business data sources and the AT phase-2 entry points.
//!
//! The coordinator addresses an AT branch by its `resource_id`; this
//! registry maps that id to a live connection into the business database so
//! phase-2 can delete or replay the branch's undo log.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use rusqlite::Connection;
use tracing::{debug, info};

use crate::undo::UndoLogManager;
use crate::{DatasourceError, DsResult};

/// Thread-safe registry of registered business databases.
#[derive(Default)]
pub struct DataSourceManager {
    sources: DashMap<String, Arc<Mutex<Connection>>>,
}

impl DataSourceManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a business database under its resource id. The undo-log
    /// table is created if missing.
    pub fn register(&self, resource_id: impl Into<String>, conn: Connection) -> DsResult<()> {
        let resource_id = resource_id.into();
        UndoLogManager::init(&conn)?;
        self.sources.insert(resource_id.clone(), Arc::new(Mutex::new(conn)));
        info!(resource_id, "datasource registered");
        Ok(())
    }

    pub fn deregister(&self, resource_id: &str) {
        self.sources.remove(resource_id);
        info!(resource_id, "datasource removed");
    }

    pub fn contains(&self, resource_id: &str) -> bool {
        self.sources.contains_key(resource_id)
    }

    pub fn resource_ids(&self) -> Vec<String> {
        self.sources.iter().map(|e| e.key().clone()).collect()
    }

    /// Run `f` against the connection registered for `resource_id`.
    pub fn with_connection<T>(
        &self,
        resource_id: &str,
        f: impl FnOnce(&Connection) -> DsResult<T>,
    ) -> DsResult<T> {
        let source = self
            .sources
            .get(resource_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| DatasourceError::UnknownResource(resource_id.to_string()))?;
        let conn = source.lock();
        f(&conn)
    }

    /// AT phase-2 commit: the branch's undo records are no longer needed.
    pub fn commit_branch(&self, resource_id: &str, xid: &str, branch_id: i64) -> DsResult<usize> {
        let deleted = self.with_connection(resource_id, |conn| UndoLogManager::delete(conn, xid, branch_id))?;
        debug!(resource_id, xid, branch_id, deleted, "AT branch committed");
        Ok(deleted)
    }

    /// AT phase-2 rollback: replay the undo log as reverse SQL.
    pub fn rollback_branch(&self, resource_id: &str, xid: &str, branch_id: i64) -> DsResult<()> {
        self.with_connection(resource_id, |conn| UndoLogManager::compensate(conn, xid, branch_id))?;
        debug!(resource_id, xid, branch_id, "AT branch rolled back");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::SqlType;
    use crate::records::TableRecords;

    fn manager_with_account_db() -> DataSourceManager {
        let manager = DataSourceManager::new();
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE account (id INTEGER PRIMARY KEY, bal INTEGER NOT NULL);
             INSERT INTO account (id, bal) VALUES (1, 100);",
        )
        .unwrap();
        manager.register("sqlite:orders", conn).unwrap();
        manager
    }

    #[test]
    fn commit_branch_deletes_undo_records() {
        let manager = manager_with_account_db();
        manager
            .with_connection("sqlite:orders", |conn| {
                let before = TableRecords::capture(conn, "account", "id", "SELECT * FROM account", &[]).unwrap();
                conn.execute("UPDATE account SET bal = 90 WHERE id = 1", []).unwrap();
                let after = TableRecords::capture(conn, "account", "id", "SELECT * FROM account", &[]).unwrap();
                UndoLogManager::insert(
                    conn,
                    "svc:1:1",
                    1001,
                    "account",
                    SqlType::Update,
                    Some(&before),
                    Some(&after),
                    "UPDATE account SET bal = ?",
                    None,
                )
            })
            .unwrap();

        assert_eq!(manager.commit_branch("sqlite:orders", "svc:1:1", 1001).unwrap(), 1);
        manager
            .with_connection("sqlite:orders", |conn| {
                assert_eq!(UndoLogManager::count(conn, "svc:1:1", 1001).unwrap(), 0);
                Ok(())
            })
            .unwrap();

        // The committed business write stays in place.
        manager
            .with_connection("sqlite:orders", |conn| {
                let bal: i64 = conn
                    .query_row("SELECT bal FROM account WHERE id = 1", [], |r| r.get(0))
                    .unwrap();
                assert_eq!(bal, 90);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn rollback_branch_compensates() {
        let manager = manager_with_account_db();
        manager
            .with_connection("sqlite:orders", |conn| {
                let before = TableRecords::capture(conn, "account", "id", "SELECT * FROM account", &[]).unwrap();
                conn.execute("UPDATE account SET bal = 90 WHERE id = 1", []).unwrap();
                let after = TableRecords::capture(conn, "account", "id", "SELECT * FROM account", &[]).unwrap();
                UndoLogManager::insert(
                    conn,
                    "svc:1:2",
                    1002,
                    "account",
                    SqlType::Update,
                    Some(&before),
                    Some(&after),
                    "UPDATE account SET bal = ?",
                    None,
                )
            })
            .unwrap();

        manager.rollback_branch("sqlite:orders", "svc:1:2", 1002).unwrap();
        manager
            .with_connection("sqlite:orders", |conn| {
                let bal: i64 = conn
                    .query_row("SELECT bal FROM account WHERE id = 1", [], |r| r.get(0))
                    .unwrap();
                assert_eq!(bal, 100);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn unknown_resource_is_an_error() {
        let manager = DataSourceManager::new();
        let err = manager.commit_branch("sqlite:missing", "svc:1:1", 1).unwrap_err();
        assert!(matches!(err, DatasourceError::UnknownResource(_)));
    }
}
