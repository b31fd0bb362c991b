//! SQLite-backed metadata store.
//!
//! Materialises the coordinator's relational schema: GLOBAL_TABLE,
//! BRANCH_TABLE and GLOBAL_LOCK. Statuses are persisted as their numeric
//! codes so the schema survives enum renames.

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::Connection;

use lodestar_core::model::{
    now_millis, BranchStatus, BranchTransaction, BranchType, GlobalStatus, GlobalTransaction,
};
use lodestar_core::{CoreError, CoreResult};

use super::{GlobalLock, LockOutcome, MetadataStore};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS global_table (
    xid              TEXT PRIMARY KEY,
    status           INTEGER NOT NULL,
    application_id   TEXT NOT NULL,
    transaction_name TEXT NOT NULL,
    timeout_ms       INTEGER NOT NULL,
    begin_time_ms    INTEGER NOT NULL,
    application_data TEXT
);
CREATE TABLE IF NOT EXISTS branch_table (
    branch_id         INTEGER PRIMARY KEY,
    xid               TEXT NOT NULL,
    resource_group_id TEXT NOT NULL,
    resource_id       TEXT NOT NULL,
    branch_type       TEXT NOT NULL,
    lock_key          TEXT,
    status            INTEGER NOT NULL,
    application_data  TEXT,
    begin_time_ms     INTEGER NOT NULL,
    end_time_ms       INTEGER,
    timeout_ms        INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_branch_table_xid ON branch_table (xid);
CREATE TABLE IF NOT EXISTS global_lock (
    row_key        TEXT PRIMARY KEY,
    xid            TEXT NOT NULL,
    branch_id      INTEGER NOT NULL,
    acquired_at_ms INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_global_lock_xid ON global_lock (xid);
";

fn storage(err: rusqlite::Error) -> CoreError {
    CoreError::Storage(err.to_string())
}

fn branch_type_str(branch_type: BranchType) -> String {
    branch_type.to_string()
}

fn branch_type_from_str(s: &str) -> BranchType {
    match s {
        "TCC" => BranchType::Tcc,
        "XA" => BranchType::Xa,
        "MQ" => BranchType::Mq,
        "HTTP" => BranchType::Http,
        _ => BranchType::At,
    }
}

/// Relational store over a single SQLite database.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the store at `path`. `:memory:` works for tests.
    pub fn open(path: &str) -> CoreResult<Self> {
        let conn = Connection::open(path).map_err(storage)?;
        conn.execute_batch(SCHEMA).map_err(storage)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn open_in_memory() -> CoreResult<Self> {
        let conn = Connection::open_in_memory().map_err(storage)?;
        conn.execute_batch(SCHEMA).map_err(storage)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn row_to_global(row: &rusqlite::Row<'_>) -> rusqlite::Result<GlobalTransaction> {
        let status_code: u8 = row.get(1)?;
        Ok(GlobalTransaction {
            xid: row.get(0)?,
            status: GlobalStatus::from_code(status_code).unwrap_or(GlobalStatus::Finished),
            application_id: row.get(2)?,
            transaction_name: row.get(3)?,
            timeout_ms: row.get(4)?,
            begin_time_ms: row.get(5)?,
            application_data: row.get(6)?,
        })
    }

    fn row_to_branch(row: &rusqlite::Row<'_>) -> rusqlite::Result<BranchTransaction> {
        let branch_type: String = row.get(4)?;
        let status_code: u8 = row.get(6)?;
        Ok(BranchTransaction {
            branch_id: row.get(0)?,
            xid: row.get(1)?,
            resource_group_id: row.get(2)?,
            resource_id: row.get(3)?,
            branch_type: branch_type_from_str(&branch_type),
            lock_key: row.get(5)?,
            status: BranchStatus::from_code(status_code),
            application_data: row.get(7)?,
            begin_time_ms: row.get(8)?,
            end_time_ms: row.get(9)?,
            timeout_ms: row.get(10)?,
        })
    }
}

#[async_trait]
impl MetadataStore for SqliteStore {
    async fn put_global(&self, global: &GlobalTransaction) -> CoreResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO global_table \
             (xid, status, application_id, transaction_name, timeout_ms, begin_time_ms, application_data) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![
                global.xid,
                global.status.code(),
                global.application_id,
                global.transaction_name,
                global.timeout_ms,
                global.begin_time_ms,
                global.application_data
            ],
        )
        .map_err(storage)?;
        Ok(())
    }

    async fn global(&self, xid: &str) -> CoreResult<Option<GlobalTransaction>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT xid, status, application_id, transaction_name, timeout_ms, begin_time_ms, application_data \
                 FROM global_table WHERE xid = ?1",
            )
            .map_err(storage)?;
        let mut rows = stmt.query([xid]).map_err(storage)?;
        match rows.next().map_err(storage)? {
            Some(row) => Ok(Some(Self::row_to_global(row).map_err(storage)?)),
            None => Ok(None),
        }
    }

    async fn update_global_status(&self, xid: &str, status: GlobalStatus) -> CoreResult<()> {
        let conn = self.conn.lock();
        let updated = conn
            .execute(
                "UPDATE global_table SET status = ?1 WHERE xid = ?2",
                rusqlite::params![status.code(), xid],
            )
            .map_err(storage)?;
        if updated == 0 {
            return Err(CoreError::GlobalNotFound(xid.to_string()));
        }
        Ok(())
    }

    async fn remove_global(&self, xid: &str) -> CoreResult<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM global_table WHERE xid = ?1", [xid])
            .map_err(storage)?;
        Ok(())
    }

    async fn globals(&self) -> CoreResult<Vec<GlobalTransaction>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT xid, status, application_id, transaction_name, timeout_ms, begin_time_ms, application_data \
                 FROM global_table",
            )
            .map_err(storage)?;
        let globals = stmt
            .query_map([], Self::row_to_global)
            .map_err(storage)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(storage)?;
        Ok(globals)
    }

    async fn put_branch(&self, branch: &BranchTransaction) -> CoreResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO branch_table \
             (branch_id, xid, resource_group_id, resource_id, branch_type, lock_key, status, \
              application_data, begin_time_ms, end_time_ms, timeout_ms) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            rusqlite::params![
                branch.branch_id,
                branch.xid,
                branch.resource_group_id,
                branch.resource_id,
                branch_type_str(branch.branch_type),
                branch.lock_key,
                branch.status.code(),
                branch.application_data,
                branch.begin_time_ms,
                branch.end_time_ms,
                branch.timeout_ms
            ],
        )
        .map_err(storage)?;
        Ok(())
    }

    async fn branch(&self, branch_id: i64) -> CoreResult<Option<BranchTransaction>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT branch_id, xid, resource_group_id, resource_id, branch_type, lock_key, status, \
                 application_data, begin_time_ms, end_time_ms, timeout_ms \
                 FROM branch_table WHERE branch_id = ?1",
            )
            .map_err(storage)?;
        let mut rows = stmt.query([branch_id]).map_err(storage)?;
        match rows.next().map_err(storage)? {
            Some(row) => Ok(Some(Self::row_to_branch(row).map_err(storage)?)),
            None => Ok(None),
        }
    }

    async fn update_branch_status(
        &self,
        branch_id: i64,
        status: BranchStatus,
        end_time_ms: Option<i64>,
    ) -> CoreResult<()> {
        let conn = self.conn.lock();
        let updated = match end_time_ms {
            Some(end) => conn
                .execute(
                    "UPDATE branch_table SET status = ?1, end_time_ms = ?2 WHERE branch_id = ?3",
                    rusqlite::params![status.code(), end, branch_id],
                )
                .map_err(storage)?,
            None => conn
                .execute(
                    "UPDATE branch_table SET status = ?1 WHERE branch_id = ?2",
                    rusqlite::params![status.code(), branch_id],
                )
                .map_err(storage)?,
        };
        if updated == 0 {
            return Err(CoreError::Internal(format!("branch not found: {branch_id}")));
        }
        Ok(())
    }

    async fn branches_of(&self, xid: &str) -> CoreResult<Vec<BranchTransaction>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT branch_id, xid, resource_group_id, resource_id, branch_type, lock_key, status, \
                 application_data, begin_time_ms, end_time_ms, timeout_ms \
                 FROM branch_table WHERE xid = ?1 ORDER BY branch_id",
            )
            .map_err(storage)?;
        let branches = stmt
            .query_map([xid], Self::row_to_branch)
            .map_err(storage)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(storage)?;
        Ok(branches)
    }

    async fn all_branches(&self) -> CoreResult<Vec<BranchTransaction>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT branch_id, xid, resource_group_id, resource_id, branch_type, lock_key, status, \
                 application_data, begin_time_ms, end_time_ms, timeout_ms \
                 FROM branch_table",
            )
            .map_err(storage)?;
        let branches = stmt
            .query_map([], Self::row_to_branch)
            .map_err(storage)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(storage)?;
        Ok(branches)
    }

    async fn remove_branches_of(&self, xid: &str) -> CoreResult<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM branch_table WHERE xid = ?1", [xid])
            .map_err(storage)?;
        Ok(())
    }

    async fn try_lock_rows(&self, row_keys: &[String], xid: &str, branch_id: i64) -> CoreResult<LockOutcome> {
        let conn = self.conn.lock();
        let tx = conn.unchecked_transaction().map_err(storage)?;

        for row_key in row_keys {
            let holder: Option<String> = tx
                .query_row(
                    "SELECT xid FROM global_lock WHERE row_key = ?1",
                    [row_key],
                    |row| row.get(0),
                )
                .map(Some)
                .or_else(|err| match err {
                    rusqlite::Error::QueryReturnedNoRows => Ok(None),
                    other => Err(other),
                })
                .map_err(storage)?;
            if let Some(holder_xid) = holder {
                if holder_xid != xid {
                    return Ok(LockOutcome::Conflict {
                        row_key: row_key.clone(),
                        holder_xid,
                    });
                }
            }
        }
        let now = now_millis();
        for row_key in row_keys {
            tx.execute(
                "INSERT OR IGNORE INTO global_lock (row_key, xid, branch_id, acquired_at_ms) \
                 VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![row_key, xid, branch_id, now],
            )
            .map_err(storage)?;
        }
        tx.commit().map_err(storage)?;
        Ok(LockOutcome::Acquired)
    }

    async fn unlock_by_xid(&self, xid: &str) -> CoreResult<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM global_lock WHERE xid = ?1", [xid])
            .map_err(storage)?;
        Ok(())
    }

    async fn locks_of(&self, xid: &str) -> CoreResult<Vec<GlobalLock>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT row_key, xid, branch_id, acquired_at_ms FROM global_lock WHERE xid = ?1")
            .map_err(storage)?;
        let locks = stmt
            .query_map([xid], |row| {
                Ok(GlobalLock {
                    row_key: row.get(0)?,
                    xid: row.get(1)?,
                    branch_id: row.get(2)?,
                    acquired_at_ms: row.get(3)?,
                })
            })
            .map_err(storage)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(storage)?;
        Ok(locks)
    }
}
