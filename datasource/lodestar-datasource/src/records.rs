//! Row-image capture.
//!
//! A [`TableRecords`] is a snapshot of a set of rows from one table: the
//! column names, the primary-key column, and one row of typed cells per
//! affected record. Images are captured immediately before and after a
//! business DML and serialized into the undo log; at rollback time the
//! after-image is compared against the live table to detect dirty writes.

use std::collections::HashMap;

use rusqlite::types::{ToSqlOutput, Value, ValueRef};
use rusqlite::{Connection, ToSql};
use serde::{Deserialize, Serialize};

use crate::{DatasourceError, DsResult};

/// One typed cell of a captured row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CellValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl CellValue {
    pub fn from_value_ref(value: ValueRef<'_>) -> Self {
        match value {
            ValueRef::Null => CellValue::Null,
            ValueRef::Integer(i) => CellValue::Integer(i),
            ValueRef::Real(f) => CellValue::Real(f),
            ValueRef::Text(t) => CellValue::Text(String::from_utf8_lossy(t).into_owned()),
            ValueRef::Blob(b) => CellValue::Blob(b.to_vec()),
        }
    }
}

impl ToSql for CellValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            CellValue::Null => ToSqlOutput::Owned(Value::Null),
            CellValue::Integer(i) => ToSqlOutput::Owned(Value::Integer(*i)),
            CellValue::Real(f) => ToSqlOutput::Owned(Value::Real(*f)),
            CellValue::Text(t) => ToSqlOutput::Owned(Value::Text(t.clone())),
            CellValue::Blob(b) => ToSqlOutput::Owned(Value::Blob(b.clone())),
        })
    }
}

impl std::fmt::Display for CellValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CellValue::Null => f.write_str("NULL"),
            CellValue::Integer(i) => write!(f, "{i}"),
            CellValue::Real(r) => write!(f, "{r}"),
            CellValue::Text(t) => f.write_str(t),
            CellValue::Blob(b) => write!(f, "0x{}", hex(b)),
        }
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// The primary-key column of a table, from `PRAGMA table_info`.
///
/// AT mode addresses rows by primary key (lock keys, after-image lookup,
/// reverse SQL), so a table without one cannot participate.
pub fn primary_key_column(conn: &Connection, table: &str) -> DsResult<String> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let pk: i64 = row.get(5)?;
        if pk == 1 {
            let name: String = row.get(1)?;
            return Ok(name);
        }
    }
    Err(DatasourceError::NoPrimaryKey(table.to_string()))
}

/// A snapshot of rows from one table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableRecords {
    pub table_name: String,
    pub pk_column: String,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<CellValue>>,
}

impl TableRecords {
    pub fn empty(table_name: impl Into<String>, pk_column: impl Into<String>) -> Self {
        Self {
            table_name: table_name.into(),
            pk_column: pk_column.into(),
            columns: Vec::new(),
            rows: Vec::new(),
        }
    }

    /// Capture the rows selected by `sql` with `params`.
    pub fn capture(
        conn: &Connection,
        table_name: &str,
        pk_column: &str,
        sql: &str,
        params: &[CellValue],
    ) -> DsResult<Self> {
        let mut stmt = conn.prepare(sql)?;
        let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
        let column_count = columns.len();
        let mut rows_out = Vec::new();
        let mut rows = stmt.query(rusqlite::params_from_iter(params.iter()))?;
        while let Some(row) = rows.next()? {
            let mut cells = Vec::with_capacity(column_count);
            for idx in 0..column_count {
                cells.push(CellValue::from_value_ref(row.get_ref(idx)?));
            }
            rows_out.push(cells);
        }
        Ok(Self {
            table_name: table_name.to_string(),
            pk_column: pk_column.to_string(),
            columns,
            rows: rows_out,
        })
    }

    /// Capture rows addressed by primary key.
    pub fn capture_by_pks(
        conn: &Connection,
        table_name: &str,
        pk_column: &str,
        pks: &[CellValue],
    ) -> DsResult<Self> {
        if pks.is_empty() {
            return Ok(Self::empty(table_name, pk_column));
        }
        let placeholders = vec!["?"; pks.len()].join(", ");
        let sql = format!("SELECT * FROM {table_name} WHERE {pk_column} IN ({placeholders})");
        Self::capture(conn, table_name, pk_column, &sql, pks)
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    fn pk_index(&self) -> DsResult<usize> {
        self.columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(&self.pk_column))
            .ok_or_else(|| DatasourceError::NoPrimaryKey(self.table_name.clone()))
    }

    /// Primary-key values of every captured row.
    pub fn pk_values(&self) -> DsResult<Vec<CellValue>> {
        if self.rows.is_empty() {
            return Ok(Vec::new());
        }
        let idx = self.pk_index()?;
        Ok(self.rows.iter().map(|row| row[idx].clone()).collect())
    }

    /// Rows keyed by the display form of their primary key.
    pub fn rows_by_pk(&self) -> DsResult<HashMap<String, &Vec<CellValue>>> {
        if self.rows.is_empty() {
            return Ok(HashMap::new());
        }
        let idx = self.pk_index()?;
        Ok(self
            .rows
            .iter()
            .map(|row| (row[idx].to_string(), row))
            .collect())
    }

    /// Compare two snapshots as row sets, ignoring row order.
    pub fn same_rows(&self, other: &TableRecords) -> DsResult<bool> {
        if self.rows.len() != other.rows.len() {
            return Ok(false);
        }
        if self.rows.is_empty() {
            return Ok(true);
        }
        if self.columns != other.columns {
            return Ok(false);
        }
        let mine = self.rows_by_pk()?;
        let theirs = other.rows_by_pk()?;
        Ok(mine.len() == theirs.len()
            && mine.iter().all(|(pk, row)| theirs.get(pk).is_some_and(|o| o == &*row)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_db() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE account (id INTEGER PRIMARY KEY, bal INTEGER NOT NULL, owner TEXT);
             INSERT INTO account (id, bal, owner) VALUES (1, 100, 'ada');
             INSERT INTO account (id, bal, owner) VALUES (2, 250, 'ben');",
        )
        .unwrap();
        conn
    }

    #[test]
    fn detects_primary_key_column() {
        let conn = sample_db();
        assert_eq!(primary_key_column(&conn, "account").unwrap(), "id");
    }

    #[test]
    fn missing_primary_key_is_an_error() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE nopk (a INTEGER, b TEXT);").unwrap();
        assert!(matches!(
            primary_key_column(&conn, "nopk"),
            Err(DatasourceError::NoPrimaryKey(_))
        ));
    }

    #[test]
    fn captures_rows_with_params() {
        let conn = sample_db();
        let records = TableRecords::capture(
            &conn,
            "account",
            "id",
            "SELECT * FROM account WHERE id = ?",
            &[CellValue::Integer(1)],
        )
        .unwrap();
        assert_eq!(records.row_count(), 1);
        assert_eq!(records.columns, vec!["id", "bal", "owner"]);
        assert_eq!(records.rows[0][1], CellValue::Integer(100));
        assert_eq!(records.pk_values().unwrap(), vec![CellValue::Integer(1)]);
    }

    #[test]
    fn captures_by_pk_set() {
        let conn = sample_db();
        let records = TableRecords::capture_by_pks(
            &conn,
            "account",
            "id",
            &[CellValue::Integer(1), CellValue::Integer(2)],
        )
        .unwrap();
        assert_eq!(records.row_count(), 2);
    }

    #[test]
    fn empty_pk_set_captures_nothing() {
        let conn = sample_db();
        let records = TableRecords::capture_by_pks(&conn, "account", "id", &[]).unwrap();
        assert!(records.is_empty());
    }

    #[test]
    fn same_rows_ignores_order() {
        let conn = sample_db();
        let all = TableRecords::capture(&conn, "account", "id", "SELECT * FROM account ORDER BY id", &[]).unwrap();
        let reversed =
            TableRecords::capture(&conn, "account", "id", "SELECT * FROM account ORDER BY id DESC", &[]).unwrap();
        assert!(all.same_rows(&reversed).unwrap());
    }

    #[test]
    fn same_rows_detects_divergence() {
        let conn = sample_db();
        let before = TableRecords::capture(&conn, "account", "id", "SELECT * FROM account", &[]).unwrap();
        conn.execute("UPDATE account SET bal = 0 WHERE id = 1", []).unwrap();
        let after = TableRecords::capture(&conn, "account", "id", "SELECT * FROM account", &[]).unwrap();
        assert!(!before.same_rows(&after).unwrap());
    }

    #[test]
    fn records_serialize_round_trip() {
        let conn = sample_db();
        let records = TableRecords::capture(&conn, "account", "id", "SELECT * FROM account", &[]).unwrap();
        let json = serde_json::to_string(&records).unwrap();
        let back: TableRecords = serde_json::from_str(&json).unwrap();
        assert_eq!(back, records);
    }
}
