//! Undo-log persistence and AT-mode compensation.
//!
//! The undo log lives in the business database, next to the data it
//! protects. A record is inserted in the same local transaction as the
//! business DML; that atomicity is what makes AT rollback sound. Phase-2
//! commit deletes the records, phase-2 rollback replays them:
//!
//! - INSERT is reversed by a DELETE keyed on the after-image's primary keys
//! - UPDATE is reversed by restoring the before-image values, keyed on pk
//! - DELETE is reversed by re-inserting the before-image rows
//!
//! Before any reverse statement runs, the current table state is checked
//! against the after-image; a mismatch means some non-AT writer touched the
//! rows and compensation aborts with a dirty-write error.

use rusqlite::Connection;
use tracing::{debug, warn};

use lodestar_core::model::now_millis;

use crate::parser::SqlType;
use crate::records::{CellValue, TableRecords};
use crate::{DatasourceError, DsResult};

/// Schema of the `undo_log` table plus its indexes.
pub const UNDO_LOG_DDL: &str = "
CREATE TABLE IF NOT EXISTS undo_log (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    xid         TEXT    NOT NULL,
    branch_id   INTEGER NOT NULL,
    table_name  TEXT    NOT NULL,
    sql_type    TEXT    NOT NULL,
    before_image TEXT,
    after_image  TEXT,
    sql_text    TEXT    NOT NULL,
    parameters  TEXT,
    log_status  INTEGER NOT NULL DEFAULT 0,
    create_time INTEGER NOT NULL,
    update_time INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_undo_log_xid_branch ON undo_log (xid, branch_id);
CREATE INDEX IF NOT EXISTS idx_undo_log_create_time ON undo_log (create_time);
";

/// Undo-log record lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UndoLogStatus {
    Normal = 0,
    Compensating = 1,
    Compensated = 2,
}

impl UndoLogStatus {
    pub fn code(self) -> i64 {
        self as i64
    }

    pub fn from_code(code: i64) -> Self {
        match code {
            1 => UndoLogStatus::Compensating,
            2 => UndoLogStatus::Compensated,
            _ => UndoLogStatus::Normal,
        }
    }
}

/// One undo-log row.
#[derive(Debug, Clone)]
pub struct UndoLogEntry {
    pub id: i64,
    pub xid: String,
    pub branch_id: i64,
    pub table_name: String,
    pub sql_type: SqlType,
    pub before_image: Option<TableRecords>,
    pub after_image: Option<TableRecords>,
    pub sql_text: String,
    pub parameters: Option<String>,
    pub log_status: UndoLogStatus,
    pub create_time: i64,
    pub update_time: i64,
}

/// Storage, query and compensation over the `undo_log` table.
///
/// Stateless; every method takes the connection it should run on so that the
/// insert path can participate in the caller's open transaction.
pub struct UndoLogManager;

impl UndoLogManager {
    /// Create the undo-log table if missing.
    pub fn init(conn: &Connection) -> DsResult<()> {
        conn.execute_batch(UNDO_LOG_DDL)?;
        Ok(())
    }

    /// Insert a record. Runs on the caller's connection so it commits (or
    /// rolls back) together with the business DML.
    #[allow(clippy::too_many_arguments)]
    pub fn insert(
        conn: &Connection,
        xid: &str,
        branch_id: i64,
        table_name: &str,
        sql_type: SqlType,
        before_image: Option<&TableRecords>,
        after_image: Option<&TableRecords>,
        sql_text: &str,
        parameters: Option<&str>,
    ) -> DsResult<()> {
        let before_json = before_image
            .filter(|r| !r.is_empty())
            .map(serde_json::to_string)
            .transpose()?;
        let after_json = after_image
            .filter(|r| !r.is_empty())
            .map(serde_json::to_string)
            .transpose()?;
        if before_json.is_none() && after_json.is_none() {
            // No data changed; nothing to undo.
            return Ok(());
        }
        let now = now_millis();
        conn.execute(
            "INSERT INTO undo_log (xid, branch_id, table_name, sql_type, before_image, after_image, \
             sql_text, parameters, log_status, create_time, update_time) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            rusqlite::params![
                xid,
                branch_id,
                table_name,
                sql_type.as_str(),
                before_json,
                after_json,
                sql_text,
                parameters,
                UndoLogStatus::Normal.code(),
                now,
                now
            ],
        )?;
        debug!(xid, branch_id, table = table_name, "undo log recorded");
        Ok(())
    }

    /// The `Normal` record for a branch, if any.
    pub fn find_normal(conn: &Connection, xid: &str, branch_id: i64) -> DsResult<Option<UndoLogEntry>> {
        let mut stmt = conn.prepare(
            "SELECT id, xid, branch_id, table_name, sql_type, before_image, after_image, \
             sql_text, parameters, log_status, create_time, update_time \
             FROM undo_log WHERE xid = ?1 AND branch_id = ?2 AND log_status = ?3",
        )?;
        let mut rows = stmt.query(rusqlite::params![xid, branch_id, UndoLogStatus::Normal.code()])?;
        let Some(row) = rows.next()? else {
            return Ok(None);
        };
        let before_json: Option<String> = row.get(5)?;
        let after_json: Option<String> = row.get(6)?;
        let sql_type: String = row.get(4)?;
        Ok(Some(UndoLogEntry {
            id: row.get(0)?,
            xid: row.get(1)?,
            branch_id: row.get(2)?,
            table_name: row.get(3)?,
            sql_type: SqlType::from_str_loose(&sql_type),
            before_image: before_json.map(|j| serde_json::from_str(&j)).transpose()?,
            after_image: after_json.map(|j| serde_json::from_str(&j)).transpose()?,
            sql_text: row.get(7)?,
            parameters: row.get(8)?,
            log_status: UndoLogStatus::from_code(row.get(9)?),
            create_time: row.get(10)?,
            update_time: row.get(11)?,
        }))
    }

    /// Delete every undo record of a branch; phase-2 commit.
    pub fn delete(conn: &Connection, xid: &str, branch_id: i64) -> DsResult<usize> {
        let deleted = conn.execute(
            "DELETE FROM undo_log WHERE xid = ?1 AND branch_id = ?2",
            rusqlite::params![xid, branch_id],
        )?;
        debug!(xid, branch_id, deleted, "undo log deleted");
        Ok(deleted)
    }

    pub fn mark_status(conn: &Connection, id: i64, status: UndoLogStatus) -> DsResult<()> {
        conn.execute(
            "UPDATE undo_log SET log_status = ?1, update_time = ?2 WHERE id = ?3",
            rusqlite::params![status.code(), now_millis(), id],
        )?;
        Ok(())
    }

    /// Count of undo records for a branch, any status.
    pub fn count(conn: &Connection, xid: &str, branch_id: i64) -> DsResult<i64> {
        let count = conn.query_row(
            "SELECT COUNT(*) FROM undo_log WHERE xid = ?1 AND branch_id = ?2",
            rusqlite::params![xid, branch_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Phase-2 rollback: verify the after-image, execute the reverse
    /// statement, and retire the record, all in one local transaction.
    pub fn compensate(conn: &Connection, xid: &str, branch_id: i64) -> DsResult<()> {
        let tx = conn.unchecked_transaction()?;

        let Some(entry) = Self::find_normal(&tx, xid, branch_id)? else {
            return Err(DatasourceError::NoUndoLog {
                xid: xid.to_string(),
                branch_id,
            });
        };

        Self::mark_status(&tx, entry.id, UndoLogStatus::Compensating)?;
        Self::verify_after_image(&tx, &entry)?;
        Self::execute_reverse(&tx, &entry)?;
        Self::mark_status(&tx, entry.id, UndoLogStatus::Compensated)?;
        Self::delete(&tx, xid, branch_id)?;

        tx.commit()?;
        debug!(xid, branch_id, table = %entry.table_name, "branch compensated");
        Ok(())
    }

    /// Current rows must equal the after-image; anything else is a dirty
    /// write by a non-AT participant and compensation must not proceed.
    fn verify_after_image(conn: &Connection, entry: &UndoLogEntry) -> DsResult<()> {
        let pk_column = image_pk_column(entry);
        let expected_pks = match entry.sql_type {
            // Rows that existed after the DML.
            SqlType::Insert | SqlType::Update => entry
                .after_image
                .as_ref()
                .map(|r| r.pk_values())
                .transpose()?
                .unwrap_or_default(),
            // Rows removed by the DML; they must still be gone.
            SqlType::Delete => entry
                .before_image
                .as_ref()
                .map(|r| r.pk_values())
                .transpose()?
                .unwrap_or_default(),
            _ => Vec::new(),
        };

        let current = TableRecords::capture_by_pks(conn, &entry.table_name, &pk_column, &expected_pks)?;

        let matches = match entry.sql_type {
            SqlType::Insert | SqlType::Update => match &entry.after_image {
                Some(after) => after.same_rows(&current)?,
                None => current.is_empty(),
            },
            SqlType::Delete => current.is_empty(),
            _ => true,
        };

        if matches {
            Ok(())
        } else {
            warn!(
                xid = %entry.xid,
                branch_id = entry.branch_id,
                table = %entry.table_name,
                "dirty write detected, compensation aborted"
            );
            Err(DatasourceError::DirtyWrite {
                table: entry.table_name.clone(),
            })
        }
    }

    fn execute_reverse(conn: &Connection, entry: &UndoLogEntry) -> DsResult<()> {
        let pk_column = image_pk_column(entry);
        match entry.sql_type {
            SqlType::Insert => {
                let Some(after) = &entry.after_image else {
                    return Ok(());
                };
                let pks = after.pk_values()?;
                if pks.is_empty() {
                    return Ok(());
                }
                let placeholders = vec!["?"; pks.len()].join(", ");
                let sql = format!(
                    "DELETE FROM {} WHERE {} IN ({})",
                    entry.table_name, pk_column, placeholders
                );
                conn.execute(&sql, rusqlite::params_from_iter(pks.iter()))?;
            }
            SqlType::Update => {
                let Some(before) = &entry.before_image else {
                    return Ok(());
                };
                let pk_idx = before
                    .columns
                    .iter()
                    .position(|c| c.eq_ignore_ascii_case(&pk_column))
                    .ok_or_else(|| DatasourceError::NoPrimaryKey(entry.table_name.clone()))?;
                let assignments = before
                    .columns
                    .iter()
                    .map(|c| format!("{c} = ?"))
                    .collect::<Vec<_>>()
                    .join(", ");
                let sql = format!(
                    "UPDATE {} SET {} WHERE {} = ?",
                    entry.table_name, assignments, pk_column
                );
                for row in &before.rows {
                    let mut params: Vec<&CellValue> = row.iter().collect();
                    params.push(&row[pk_idx]);
                    conn.execute(&sql, rusqlite::params_from_iter(params))?;
                }
            }
            SqlType::Delete => {
                let Some(before) = &entry.before_image else {
                    return Ok(());
                };
                if before.rows.is_empty() {
                    return Ok(());
                }
                let column_list = before.columns.join(", ");
                let placeholders = vec!["?"; before.columns.len()].join(", ");
                let sql = format!(
                    "INSERT INTO {} ({}) VALUES ({})",
                    entry.table_name, column_list, placeholders
                );
                for row in &before.rows {
                    conn.execute(&sql, rusqlite::params_from_iter(row.iter()))?;
                }
            }
            _ => {}
        }
        Ok(())
    }
}

fn image_pk_column(entry: &UndoLogEntry) -> String {
    entry
        .after_image
        .as_ref()
        .or(entry.before_image.as_ref())
        .map(|r| r.pk_column.clone())
        .unwrap_or_else(|| "id".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::CellValue;

    fn business_db() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE account (id INTEGER PRIMARY KEY, bal INTEGER NOT NULL);
             INSERT INTO account (id, bal) VALUES (1, 100);",
        )
        .unwrap();
        UndoLogManager::init(&conn).unwrap();
        conn
    }

    fn snapshot(conn: &Connection, sql: &str, params: &[CellValue]) -> TableRecords {
        TableRecords::capture(conn, "account", "id", sql, params).unwrap()
    }

    #[test]
    fn update_compensation_restores_before_image() {
        let conn = business_db();
        let before = snapshot(&conn, "SELECT * FROM account WHERE id = 1", &[]);
        conn.execute("UPDATE account SET bal = 90 WHERE id = 1", []).unwrap();
        let after = snapshot(&conn, "SELECT * FROM account WHERE id = 1", &[]);

        UndoLogManager::insert(
            &conn,
            "svc:1:1",
            1001,
            "account",
            SqlType::Update,
            Some(&before),
            Some(&after),
            "UPDATE account SET bal = ? WHERE id = ?",
            None,
        )
        .unwrap();

        UndoLogManager::compensate(&conn, "svc:1:1", 1001).unwrap();

        let bal: i64 = conn
            .query_row("SELECT bal FROM account WHERE id = 1", [], |r| r.get(0))
            .unwrap();
        assert_eq!(bal, 100);
        assert_eq!(UndoLogManager::count(&conn, "svc:1:1", 1001).unwrap(), 0);
    }

    #[test]
    fn insert_compensation_deletes_the_row() {
        let conn = business_db();
        conn.execute("INSERT INTO account (id, bal) VALUES (7, 10)", []).unwrap();
        let after = snapshot(&conn, "SELECT * FROM account WHERE id = 7", &[]);

        UndoLogManager::insert(
            &conn,
            "svc:1:2",
            1002,
            "account",
            SqlType::Insert,
            None,
            Some(&after),
            "INSERT INTO account (id, bal) VALUES (?, ?)",
            None,
        )
        .unwrap();

        UndoLogManager::compensate(&conn, "svc:1:2", 1002).unwrap();

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM account WHERE id = 7", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn delete_compensation_reinserts_before_image() {
        let conn = business_db();
        let before = snapshot(&conn, "SELECT * FROM account WHERE id = 1", &[]);
        conn.execute("DELETE FROM account WHERE id = 1", []).unwrap();

        UndoLogManager::insert(
            &conn,
            "svc:1:3",
            1003,
            "account",
            SqlType::Delete,
            Some(&before),
            None,
            "DELETE FROM account WHERE id = ?",
            None,
        )
        .unwrap();

        UndoLogManager::compensate(&conn, "svc:1:3", 1003).unwrap();

        let bal: i64 = conn
            .query_row("SELECT bal FROM account WHERE id = 1", [], |r| r.get(0))
            .unwrap();
        assert_eq!(bal, 100);
    }

    #[test]
    fn dirty_write_aborts_compensation_and_keeps_the_log() {
        let conn = business_db();
        let before = snapshot(&conn, "SELECT * FROM account WHERE id = 1", &[]);
        conn.execute("UPDATE account SET bal = 90 WHERE id = 1", []).unwrap();
        let after = snapshot(&conn, "SELECT * FROM account WHERE id = 1", &[]);

        UndoLogManager::insert(
            &conn,
            "svc:1:4",
            1004,
            "account",
            SqlType::Update,
            Some(&before),
            Some(&after),
            "UPDATE account SET bal = ? WHERE id = ?",
            None,
        )
        .unwrap();

        // Interloper writes outside the transaction framework.
        conn.execute("UPDATE account SET bal = 5 WHERE id = 1", []).unwrap();

        let err = UndoLogManager::compensate(&conn, "svc:1:4", 1004).unwrap_err();
        assert!(matches!(err, DatasourceError::DirtyWrite { .. }));

        // The failed attempt rolled back; the record is still Normal.
        let entry = UndoLogManager::find_normal(&conn, "svc:1:4", 1004).unwrap();
        assert!(entry.is_some());
        let bal: i64 = conn
            .query_row("SELECT bal FROM account WHERE id = 1", [], |r| r.get(0))
            .unwrap();
        assert_eq!(bal, 5);
    }

    #[test]
    fn compensate_without_log_is_no_undo_log() {
        let conn = business_db();
        let err = UndoLogManager::compensate(&conn, "svc:9:9", 9).unwrap_err();
        assert!(matches!(err, DatasourceError::NoUndoLog { .. }));
    }

    #[test]
    fn unchanged_statement_writes_no_log() {
        let conn = business_db();
        let empty = TableRecords::empty("account", "id");
        UndoLogManager::insert(
            &conn,
            "svc:1:5",
            1005,
            "account",
            SqlType::Update,
            Some(&empty),
            Some(&empty),
            "UPDATE account SET bal = ? WHERE id = ?",
            None,
        )
        .unwrap();
        assert_eq!(UndoLogManager::count(&conn, "svc:1:5", 1005).unwrap(), 0);
    }
}
