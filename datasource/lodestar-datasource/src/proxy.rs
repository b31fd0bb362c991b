//! The intercepting connection wrapper.
//!
//! [`ProxyConnection`] wraps a `rusqlite::Connection` and interposes on DML
//! execution only; queries and DDL pass straight through. With a
//! transaction context bound and a supported statement, one call to
//! [`ProxyConnection::execute`] performs the full AT phase-1 sequence:
//! parse, before-image, business DML, after-image, branch registration with
//! global locks, undo-log insert, local commit, phase-1 report. A lock
//! conflict rolls the local transaction back and surfaces as a retryable
//! error to the business code.

use std::sync::Arc;

use rusqlite::Connection;
use tracing::{debug, warn};

use lodestar_core::model::{BranchStatus, BranchType};
use lodestar_core::protocol::BranchRegisterRequest;
use lodestar_core::{CoreResult, TransactionContext};

use crate::parser::{self, ParsedSql, SqlType};
use crate::records::{primary_key_column, CellValue, TableRecords};
use crate::undo::UndoLogManager;
use crate::{DatasourceError, DsResult};

/// Synchronous seam between the driver-side interceptor and the coordinator.
///
/// The interceptor runs on blocking database threads; implementations bridge
/// to the async [`TcClient`] (or straight to an in-process coordinator in
/// tests).
///
/// [`TcClient`]: https://docs.rs/lodestar-client
pub trait BranchSession: Send + Sync {
    /// Register a branch, acquiring global locks. Fails with `LockConflict`
    /// when another global transaction holds a requested row.
    fn register_branch(&self, request: BranchRegisterRequest) -> CoreResult<i64>;

    /// Report the phase-1 outcome of a branch.
    fn report_branch(&self, branch_id: i64, status: BranchStatus) -> CoreResult<()>;
}

/// A connection wrapper that makes local DML part of a global transaction.
pub struct ProxyConnection {
    conn: Connection,
    resource_id: String,
    session: Arc<dyn BranchSession>,
    context: Option<TransactionContext>,
}

impl ProxyConnection {
    /// Wrap a connection. The undo-log table is created on the spot so the
    /// first intercepted statement has somewhere to write.
    pub fn new(conn: Connection, resource_id: impl Into<String>, session: Arc<dyn BranchSession>) -> DsResult<Self> {
        UndoLogManager::init(&conn)?;
        Ok(Self {
            conn,
            resource_id: resource_id.into(),
            session,
            context: None,
        })
    }

    /// Bind the ambient transaction context; subsequent DML is intercepted.
    pub fn bind_context(&mut self, context: TransactionContext) {
        self.context = Some(context);
    }

    /// Drop the binding; subsequent statements pass through.
    pub fn unbind_context(&mut self) {
        self.context = None;
    }

    pub fn context(&self) -> Option<&TransactionContext> {
        self.context.as_ref()
    }

    /// Direct access for reads and DDL.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Execute one mutating statement (DML or DDL).
    ///
    /// DML inside a bound transaction context runs the interception
    /// algorithm; DDL and DML outside a transaction pass straight through.
    /// Reads go through [`ProxyConnection::connection`].
    pub fn execute(&mut self, sql: &str, params: &[CellValue]) -> DsResult<usize> {
        let Some(context) = self.context.clone() else {
            return Ok(self.conn.execute(sql, rusqlite::params_from_iter(params.iter()))?);
        };
        if !parser::is_supported_dml(sql) {
            return Ok(self.conn.execute(sql, rusqlite::params_from_iter(params.iter()))?);
        }
        let sets = [params.to_vec()];
        self.execute_intercepted(context, sql, &sets)
            .map(|counts| counts.into_iter().sum())
    }

    /// Execute one statement once per parameter set (batch DML).
    ///
    /// Images are captured per row; the batch produces a single undo-log
    /// record and a single branch.
    pub fn execute_batch_dml(&mut self, sql: &str, param_sets: &[Vec<CellValue>]) -> DsResult<Vec<usize>> {
        if param_sets.is_empty() {
            return Ok(Vec::new());
        }
        let context = self.context.clone();
        match context {
            Some(context) if parser::is_supported_dml(sql) => self.execute_intercepted(context, sql, param_sets),
            _ => {
                let mut counts = Vec::with_capacity(param_sets.len());
                for params in param_sets {
                    counts.push(self.conn.execute(sql, rusqlite::params_from_iter(params.iter()))?);
                }
                Ok(counts)
            }
        }
    }

    fn execute_intercepted(
        &mut self,
        context: TransactionContext,
        sql: &str,
        param_sets: &[Vec<CellValue>],
    ) -> DsResult<Vec<usize>> {
        let parsed = parser::parse(sql)?;
        let pk_column = primary_key_column(&self.conn, &parsed.table_name)?;

        let tx = self.conn.unchecked_transaction()?;

        let mut before = TableRecords::empty(&parsed.table_name, &pk_column);
        let mut after = TableRecords::empty(&parsed.table_name, &pk_column);
        let mut counts = Vec::with_capacity(param_sets.len());

        for params in param_sets {
            let mut captured_before = TableRecords::empty(&parsed.table_name, &pk_column);
            if let Some(image_sql) = parsed.before_image_sql() {
                let where_params = &params[parsed.set_placeholders.min(params.len())..];
                captured_before =
                    TableRecords::capture(&tx, &parsed.table_name, &pk_column, &image_sql, where_params)?;
            }

            counts.push(tx.execute(&parsed.original, rusqlite::params_from_iter(params.iter()))?);

            let pks = after_image_keys(&tx, &parsed, &pk_column, &captured_before, params)?;
            let captured_after = TableRecords::capture_by_pks(&tx, &parsed.table_name, &pk_column, &pks)?;
            merge_rows(&mut before, captured_before);
            merge_rows(&mut after, captured_after);
        }

        let lock_key = build_lock_key(&parsed, &before, &after)?;

        let request = BranchRegisterRequest {
            xid: context.xid.clone(),
            resource_group_id: context.resource_group_id.clone(),
            resource_id: self.resource_id.clone(),
            branch_type: BranchType::At,
            lock_key: lock_key.clone(),
            application_data: None,
        };
        let branch_id = match self.session.register_branch(request) {
            Ok(id) => id,
            Err(err) => {
                // The local transaction rolls back with the registration
                // failure; business code sees a retryable lock conflict.
                drop(tx);
                warn!(xid = %context.xid, table = %parsed.table_name, %err, "branch registration failed");
                return Err(err.into());
            }
        };

        UndoLogManager::insert(
            &tx,
            &context.xid,
            branch_id,
            &parsed.table_name,
            parsed.sql_type,
            Some(&before),
            Some(&after),
            &parsed.original,
            Some(&serialize_params(param_sets)?),
        )?;

        if let Err(err) = tx.commit() {
            let _ = self.session.report_branch(branch_id, BranchStatus::PhaseOneFailed);
            return Err(err.into());
        }

        self.session.report_branch(branch_id, BranchStatus::PhaseOneDone)?;
        debug!(
            xid = %context.xid,
            branch_id,
            table = %parsed.table_name,
            sql_type = parsed.sql_type.as_str(),
            lock_key = lock_key.as_deref().unwrap_or(""),
            "phase-1 complete"
        );
        Ok(counts)
    }
}

/// Primary keys of the rows the statement just touched.
fn after_image_keys(
    conn: &Connection,
    parsed: &ParsedSql,
    pk_column: &str,
    before: &TableRecords,
    params: &[CellValue],
) -> DsResult<Vec<CellValue>> {
    match parsed.sql_type {
        SqlType::Insert => {
            // Prefer the pk value supplied by the statement; fall back to
            // the generated rowid for auto-assigned keys.
            let supplied = parsed
                .columns
                .iter()
                .position(|c| c.eq_ignore_ascii_case(pk_column))
                .and_then(|idx| params.get(idx).cloned());
            Ok(vec![supplied.unwrap_or(CellValue::Integer(conn.last_insert_rowid()))])
        }
        SqlType::Update | SqlType::Delete => before.pk_values(),
        _ => Ok(Vec::new()),
    }
}

fn merge_rows(target: &mut TableRecords, captured: TableRecords) {
    if target.columns.is_empty() {
        target.columns = captured.columns;
    }
    target.rows.extend(captured.rows);
}

/// `table:pk1,pk2,...` over the affected primary keys.
fn build_lock_key(parsed: &ParsedSql, before: &TableRecords, after: &TableRecords) -> DsResult<Option<String>> {
    let pks = match parsed.sql_type {
        SqlType::Insert => after.pk_values()?,
        SqlType::Update | SqlType::Delete => before.pk_values()?,
        _ => Vec::new(),
    };
    if pks.is_empty() {
        return Ok(None);
    }
    let keys = pks.iter().map(|pk| pk.to_string()).collect::<Vec<_>>().join(",");
    Ok(Some(format!("{}:{}", parsed.table_name, keys)))
}

fn serialize_params(param_sets: &[Vec<CellValue>]) -> DsResult<String> {
    Ok(serde_json::to_string(param_sets)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    /// Scripted coordinator stand-in.
    #[derive(Default)]
    struct RecordingSession {
        registrations: Mutex<Vec<BranchRegisterRequest>>,
        reports: Mutex<Vec<(i64, BranchStatus)>>,
        reject_with_lock_conflict: bool,
    }

    impl BranchSession for RecordingSession {
        fn register_branch(&self, request: BranchRegisterRequest) -> CoreResult<i64> {
            if self.reject_with_lock_conflict {
                return Err(lodestar_core::CoreError::LockConflict {
                    row_key: request.lock_key.clone().unwrap_or_default(),
                });
            }
            let mut registrations = self.registrations.lock();
            registrations.push(request);
            Ok(1000 + registrations.len() as i64)
        }

        fn report_branch(&self, branch_id: i64, status: BranchStatus) -> CoreResult<()> {
            self.reports.lock().push((branch_id, status));
            Ok(())
        }
    }

    fn proxy_with(session: Arc<RecordingSession>) -> ProxyConnection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE account (id INTEGER PRIMARY KEY, bal INTEGER NOT NULL);
             CREATE TABLE ledger (id INTEGER PRIMARY KEY, amt INTEGER NOT NULL);
             INSERT INTO account (id, bal) VALUES (1, 100);",
        )
        .unwrap();
        ProxyConnection::new(conn, "sqlite:orders", session).unwrap()
    }

    #[test]
    fn statements_pass_through_without_context() {
        let session = Arc::new(RecordingSession::default());
        let mut proxy = proxy_with(session.clone());

        let affected = proxy
            .execute("UPDATE account SET bal = ? WHERE id = ?", &[CellValue::Integer(90), CellValue::Integer(1)])
            .unwrap();
        assert_eq!(affected, 1);
        assert!(session.registrations.lock().is_empty());
        assert_eq!(UndoLogManager::count(proxy.connection(), "", 0).unwrap_or(0), 0);
    }

    #[test]
    fn ddl_bypasses_interception_even_in_transaction() {
        let session = Arc::new(RecordingSession::default());
        let mut proxy = proxy_with(session.clone());
        proxy.bind_context(TransactionContext::new("svc:1:1"));

        proxy
            .execute("CREATE INDEX idx_account_bal ON account (bal)", &[])
            .unwrap();
        assert!(session.registrations.lock().is_empty());
    }

    #[test]
    fn update_in_transaction_registers_branch_and_writes_undo_log() {
        let session = Arc::new(RecordingSession::default());
        let mut proxy = proxy_with(session.clone());
        proxy.bind_context(TransactionContext::new("svc:1:1"));

        let affected = proxy
            .execute("UPDATE account SET bal = ? WHERE id = ?", &[CellValue::Integer(90), CellValue::Integer(1)])
            .unwrap();
        assert_eq!(affected, 1);

        let registrations = session.registrations.lock();
        assert_eq!(registrations.len(), 1);
        assert_eq!(registrations[0].xid, "svc:1:1");
        assert_eq!(registrations[0].branch_type, BranchType::At);
        assert_eq!(registrations[0].lock_key.as_deref(), Some("account:1"));

        let reports = session.reports.lock();
        assert_eq!(reports.as_slice(), &[(1001, BranchStatus::PhaseOneDone)]);

        let entry = UndoLogManager::find_normal(proxy.connection(), "svc:1:1", 1001)
            .unwrap()
            .expect("undo log row");
        assert_eq!(entry.table_name, "account");
        assert_eq!(entry.sql_type, SqlType::Update);
        let before = entry.before_image.unwrap();
        assert_eq!(before.rows[0][1], CellValue::Integer(100));
        let after = entry.after_image.unwrap();
        assert_eq!(after.rows[0][1], CellValue::Integer(90));
    }

    #[test]
    fn insert_lock_key_uses_generated_or_supplied_pk() {
        let session = Arc::new(RecordingSession::default());
        let mut proxy = proxy_with(session.clone());
        proxy.bind_context(TransactionContext::new("svc:1:1"));

        proxy
            .execute(
                "INSERT INTO ledger (id, amt) VALUES (?, ?)",
                &[CellValue::Integer(7), CellValue::Integer(10)],
            )
            .unwrap();

        let registrations = session.registrations.lock();
        assert_eq!(registrations[0].lock_key.as_deref(), Some("ledger:7"));
    }

    #[test]
    fn lock_conflict_rolls_back_the_local_transaction() {
        let session = Arc::new(RecordingSession {
            reject_with_lock_conflict: true,
            ..Default::default()
        });
        let mut proxy = proxy_with(session.clone());
        proxy.bind_context(TransactionContext::new("svc:1:1"));

        let err = proxy
            .execute("UPDATE account SET bal = ? WHERE id = ?", &[CellValue::Integer(90), CellValue::Integer(1)])
            .unwrap_err();
        assert!(matches!(err, DatasourceError::LockConflict { .. }));
        assert!(err.is_retryable());

        // Business write was rolled back together with the undo log.
        let bal: i64 = proxy
            .connection()
            .query_row("SELECT bal FROM account WHERE id = 1", [], |r| r.get(0))
            .unwrap();
        assert_eq!(bal, 100);
        assert!(session.reports.lock().is_empty());
    }

    #[test]
    fn batch_dml_writes_one_undo_record_with_per_row_images() {
        let session = Arc::new(RecordingSession::default());
        let mut proxy = proxy_with(session.clone());
        proxy.bind_context(TransactionContext::new("svc:1:1"));

        let counts = proxy
            .execute_batch_dml(
                "INSERT INTO ledger (id, amt) VALUES (?, ?)",
                &[
                    vec![CellValue::Integer(1), CellValue::Integer(5)],
                    vec![CellValue::Integer(2), CellValue::Integer(6)],
                    vec![CellValue::Integer(3), CellValue::Integer(7)],
                ],
            )
            .unwrap();
        assert_eq!(counts, vec![1, 1, 1]);

        let registrations = session.registrations.lock();
        assert_eq!(registrations.len(), 1, "one branch per logical statement");
        assert_eq!(registrations[0].lock_key.as_deref(), Some("ledger:1,2,3"));

        let entry = UndoLogManager::find_normal(proxy.connection(), "svc:1:1", 1001)
            .unwrap()
            .expect("undo log row");
        assert_eq!(entry.after_image.unwrap().row_count(), 3);
    }

    #[test]
    fn unbinding_context_stops_interception() {
        let session = Arc::new(RecordingSession::default());
        let mut proxy = proxy_with(session.clone());
        proxy.bind_context(TransactionContext::new("svc:1:1"));
        proxy.unbind_context();

        proxy
            .execute("UPDATE account SET bal = ? WHERE id = ?", &[CellValue::Integer(90), CellValue::Integer(1)])
            .unwrap();
        assert!(session.registrations.lock().is_empty());
    }
}
