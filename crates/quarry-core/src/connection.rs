//! Driver capability consumed by [`crate::Db`]
//!
//! Drivers receive SQL already rendered with their dialect's placeholders and
//! the argument list in bind order. Keys, documents and lists arrive
//! flattened to strings (see [`Value::to_arg`]).

use crate::error::{Error, Result};
use crate::record::Rows;
use crate::statement::ExecResult;
use crate::value::Value;
use std::sync::Arc;

/// Prepare/execute/query capability of a database driver
pub trait Connection: Send + Sync {
    fn execute(&self, sql: &str, args: &[Value]) -> Result<ExecResult>;

    fn query(&self, sql: &str, args: &[Value]) -> Result<Rows>;

    /// First row of a query, `None` when the query matched nothing
    fn query_row(&self, sql: &str, args: &[Value]) -> Result<Option<Vec<Value>>> {
        Ok(self.query(sql, args)?.rows.into_iter().next())
    }

    /// Liveness check run when a handle is opened
    fn ping(&self) -> Result<()> {
        self.query("SELECT 1", &[]).map(|_| ())
    }

    /// Start a transaction. Connections that cannot do so keep the default.
    fn begin(&self) -> Result<Arc<dyn TxConnection>> {
        Err(Error::TransactionUnsupported)
    }
}

/// An open transaction
pub trait TxConnection: Send + Sync {
    /// Connection that runs statements inside the transaction
    fn connection(&self) -> Arc<dyn Connection>;

    fn commit(&self) -> Result<()>;

    fn rollback(&self) -> Result<()>;
}
