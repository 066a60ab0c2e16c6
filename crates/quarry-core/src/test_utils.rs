//! Recording connection for tests
//!
//! [`MockConnection`] answers queries from a scripted queue and records every
//! statement it receives, so tests can assert on the exact SQL a call
//! produced without a database.

use crate::connection::{Connection, TxConnection};
use crate::error::{Error, Result};
use crate::record::Rows;
use crate::statement::ExecResult;
use crate::value::Value;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

#[derive(Default)]
struct MockState {
    executed: Vec<(String, Vec<Value>)>,
    queried: Vec<(String, Vec<Value>)>,
    /// Statements and transaction events in arrival order
    log: Vec<String>,
    responses: VecDeque<Rows>,
    failure: Option<String>,
    commit_failure: Option<String>,
    rows_affected: u64,
    no_transactions: bool,
}

/// In-memory [`Connection`] recording each call
#[derive(Clone, Default)]
pub struct MockConnection {
    state: Arc<Mutex<MockState>>,
}

impl MockConnection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connection whose `begin` keeps the default `TransactionUnsupported`
    pub fn without_transactions() -> Self {
        let conn = Self::new();
        conn.state.lock().no_transactions = true;
        conn
    }

    /// Queue the rows returned by the next query
    pub fn respond(&self, rows: Rows) {
        self.state.lock().responses.push_back(rows);
    }

    /// Make the next execute or query fail with a backend error
    pub fn fail_next(&self, message: impl Into<String>) {
        self.state.lock().failure = Some(message.into());
    }

    /// Make the next commit fail
    pub fn fail_commit(&self, message: impl Into<String>) {
        self.state.lock().commit_failure = Some(message.into());
    }

    /// Row count reported by every execute
    pub fn set_rows_affected(&self, rows: u64) {
        self.state.lock().rows_affected = rows;
    }

    pub fn executed(&self) -> Vec<(String, Vec<Value>)> {
        self.state.lock().executed.clone()
    }

    pub fn queried(&self) -> Vec<(String, Vec<Value>)> {
        self.state.lock().queried.clone()
    }

    /// SQL text of every execute
    pub fn executed_sql(&self) -> Vec<String> {
        self.state
            .lock()
            .executed
            .iter()
            .map(|(sql, _)| sql.clone())
            .collect()
    }

    /// Statements and `BEGIN`/`COMMIT`/`ROLLBACK` events in order
    pub fn log(&self) -> Vec<String> {
        self.state.lock().log.clone()
    }

    fn take_failure(state: &mut MockState) -> Result<()> {
        match state.failure.take() {
            Some(message) => Err(Error::backend("", message)),
            None => Ok(()),
        }
    }
}

impl Connection for MockConnection {
    fn execute(&self, sql: &str, args: &[Value]) -> Result<ExecResult> {
        let mut state = self.state.lock();
        state.log.push(sql.to_string());
        Self::take_failure(&mut state)?;
        state.executed.push((sql.to_string(), args.to_vec()));
        Ok(ExecResult {
            rows_affected: state.rows_affected,
            last_insert_id: None,
        })
    }

    fn query(&self, sql: &str, args: &[Value]) -> Result<Rows> {
        let mut state = self.state.lock();
        state.log.push(sql.to_string());
        Self::take_failure(&mut state)?;
        state.queried.push((sql.to_string(), args.to_vec()));
        Ok(state.responses.pop_front().unwrap_or_default())
    }

    fn begin(&self) -> Result<Arc<dyn TxConnection>> {
        let mut state = self.state.lock();
        if state.no_transactions {
            return Err(Error::TransactionUnsupported);
        }
        state.log.push("BEGIN".to_string());
        Ok(Arc::new(MockTx { conn: self.clone() }))
    }
}

struct MockTx {
    conn: MockConnection,
}

impl TxConnection for MockTx {
    fn connection(&self) -> Arc<dyn Connection> {
        Arc::new(self.conn.clone())
    }

    fn commit(&self) -> Result<()> {
        let mut state = self.conn.state.lock();
        if let Some(message) = state.commit_failure.take() {
            state.log.push("COMMIT FAILED".to_string());
            return Err(Error::backend("", message));
        }
        state.log.push("COMMIT".to_string());
        Ok(())
    }

    fn rollback(&self) -> Result<()> {
        self.conn.state.lock().log.push("ROLLBACK".to_string());
        Ok(())
    }
}
