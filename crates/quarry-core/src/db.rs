//! Database handle: executes compiled statements and runs transactions

use crate::builder::Builder;
use crate::connection::{Connection, TxConnection};
use crate::cursor::Pagination;
use crate::dialect::{version_at_least, Dialect, TableInfo};
use crate::error::{Error, Result};
use crate::filter::{Filter, Operator};
use crate::key::Key;
use crate::model::{CharSet, Entity, Model, KEY_FIELD};
use crate::query::Query;
use crate::record::Rows;
use crate::scope::Scope;
use crate::statement::{ExecResult, Fragment, Statement};
use crate::value::Value;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Hook receiving every executed statement, after it ran
pub type LogHandler = Arc<dyn Fn(&Statement) + Send + Sync>;

/// Handle to one database on one driver
///
/// Cloning is cheap: the connection and dialect are shared. A clone created
/// by [`Db::run_in_transaction`] routes every statement through the
/// transaction's connection.
#[derive(Clone)]
pub struct Db {
    id: Uuid,
    driver: String,
    name: String,
    conn: Arc<dyn Connection>,
    dialect: Arc<dyn Dialect>,
    charset: CharSet,
    omits: Vec<String>,
    logger: Option<LogHandler>,
}

impl Db {
    pub fn new(
        driver: impl Into<String>,
        name: impl Into<String>,
        conn: Arc<dyn Connection>,
        dialect: Arc<dyn Dialect>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            driver: driver.into(),
            name: name.into(),
            conn,
            dialect,
            charset: CharSet::default(),
            omits: Vec::new(),
            logger: None,
        }
    }

    pub fn with_charset(mut self, charset: CharSet) -> Self {
        self.charset = charset;
        self
    }

    /// Install a statement hook
    pub fn with_logger(mut self, logger: impl Fn(&Statement) + Send + Sync + 'static) -> Self {
        self.logger = Some(Arc::new(logger));
        self
    }

    /// Unique id of this handle
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn driver(&self) -> &str {
        &self.driver
    }

    /// Database name the handle was opened with
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dialect(&self) -> &Arc<dyn Dialect> {
        &self.dialect
    }

    pub fn connection(&self) -> &Arc<dyn Connection> {
        &self.conn
    }

    pub fn charset(&self) -> &CharSet {
        &self.charset
    }

    /// Handle whose upserts and saves skip the given columns
    pub fn omit<I, S>(&self, columns: I) -> Db
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut db = self.clone();
        db.omits.extend(columns.into_iter().map(Into::into));
        db
    }

    fn scope(&self) -> Scope {
        Scope {
            omits: self.omits.clone(),
            ..Default::default()
        }
    }

    fn builder(&self) -> Builder {
        Builder::new(self.clone(), self.scope())
    }

    // ----- statement execution -----

    fn trace(&self, stmt: &Statement, outcome: &str) {
        debug!(
            driver = %self.driver,
            sql = %stmt.sql(),
            args = ?stmt.args(),
            elapsed_ms = stmt.elapsed().as_secs_f64() * 1000.0,
            outcome,
            "statement"
        );
        if let Some(logger) = &self.logger {
            logger(stmt);
        }
    }

    /// Run a mutation
    pub fn exec_stmt(&self, stmt: &mut Statement) -> Result<ExecResult> {
        let sql = stmt.sql();
        stmt.start_trace();
        let result = self.conn.execute(&sql, stmt.args());
        stmt.stop_trace();
        match result {
            Ok(res) => {
                stmt.set_result(res);
                self.trace(stmt, "ok");
                Ok(res)
            }
            Err(err) => {
                self.trace(stmt, "error");
                Err(err.context("execute"))
            }
        }
    }

    /// Run a query
    pub fn query_stmt(&self, stmt: &mut Statement) -> Result<Rows> {
        let sql = stmt.sql();
        stmt.start_trace();
        let result = self.conn.query(&sql, stmt.args());
        stmt.stop_trace();
        self.trace(stmt, if result.is_ok() { "ok" } else { "error" });
        result.map_err(|err| err.context("query"))
    }

    fn statement(&self, fragment: Fragment) -> Statement {
        Statement::new(fragment, self.dialect.clone())
    }

    /// Execute raw SQL written with `?` markers
    pub fn exec(&self, sql: &str, args: &[Value]) -> Result<ExecResult> {
        self.exec_stmt(&mut self.statement(raw_fragment(sql, args)))
    }

    /// Query raw SQL written with `?` markers
    pub fn query_raw(&self, sql: &str, args: &[Value]) -> Result<Rows> {
        self.query_stmt(&mut self.statement(raw_fragment(sql, args)))
    }

    // ----- queries -----

    /// Query over a model's own table
    pub fn query(&self) -> Query {
        Query::new(self.clone(), self.scope())
    }

    /// Query bound to an explicit table
    pub fn table(&self, table: impl Into<String>) -> Query {
        let mut scope = self.scope();
        scope.table = Some(table.into());
        Query::new(self.clone(), scope)
    }

    /// Row with the given key, `NotFound` when absent
    pub fn find<M: Model>(&self, key: &Key) -> Result<M> {
        let mut scope = self.scope();
        scope.filters.push(Filter::new(KEY_FIELD, Operator::Equal, key));
        scope.limit = 1;
        Builder::new(self.clone(), scope)
            .first::<M>(true)?
            .ok_or(Error::NotFound)
    }

    /// First row of the model's table, if any
    pub fn first<M: Model>(&self) -> Result<Option<M>> {
        let mut scope = self.scope();
        scope.limit = 1;
        Builder::new(self.clone(), scope).first(false)
    }

    /// Every live row of the model's table
    pub fn get<M: Model>(&self) -> Result<Vec<M>> {
        self.builder().get()
    }

    pub fn paginate<M: Model>(&self, page: &mut Pagination) -> Result<Vec<M>> {
        self.builder().paginate(page)
    }

    // ----- mutations -----

    /// Insert models, assigning keys to those without one
    pub fn create<M: Model>(&self, models: &mut [M]) -> Result<()> {
        self.builder().put(models, None)
    }

    /// Insert models as children of `parent`, each under a fresh key
    pub fn create_under<M: Model>(&self, parent: &Key, models: &mut [M]) -> Result<()> {
        self.builder().put(models, Some(parent))
    }

    /// Insert, updating every non-omitted column on key conflict
    pub fn upsert<M: Model>(&self, models: &mut [M]) -> Result<()> {
        self.builder().upsert(models, None)
    }

    pub fn upsert_under<M: Model>(&self, parent: &Key, models: &mut [M]) -> Result<()> {
        self.builder().upsert(models, Some(parent))
    }

    /// Write all columns of an existing row
    pub fn save<M: Model>(&self, model: &mut M) -> Result<()> {
        self.builder().save(model)
    }

    /// Soft delete when the model supports it, otherwise hard delete
    pub fn delete<M: Model>(&self, models: &[M]) -> Result<u64> {
        self.builder().delete(models, true)
    }

    /// Hard delete regardless of soft-delete support
    pub fn destroy<M: Model>(&self, models: &[M]) -> Result<u64> {
        self.builder().delete(models, false)
    }

    /// Empty the given tables in order, stopping at the first failure
    pub fn truncate(&self, tables: &[&str]) -> Result<()> {
        self.builder().truncate(tables)
    }

    /// Create or alter each entity's table to match its declared columns
    pub fn migrate(&self, entities: &[Entity]) -> Result<()> {
        self.builder().migrate(entities)
    }

    // ----- transactions -----

    /// Run `f` inside a transaction.
    ///
    /// Commits when `f` returns `Ok`. An `Err` from `f`, a failed commit or a
    /// panic unwinding through `f` rolls the transaction back.
    pub fn run_in_transaction<T>(&self, f: impl FnOnce(&Db) -> Result<T>) -> Result<T> {
        let tx = self.conn.begin()?;
        let mut guard = RollbackGuard::new(tx.clone());

        let mut scoped = self.clone();
        scoped.conn = tx.connection();
        debug!(db = %self.id, "transaction started");

        let value = f(&scoped)?;
        tx.commit().map_err(|err| err.context("commit"))?;
        guard.disarm();
        debug!(db = %self.id, "transaction committed");
        Ok(value)
    }

    // ----- introspection -----

    fn scalar(&self, fragment: Fragment) -> Result<Option<Value>> {
        let rows = self.query_stmt(&mut self.statement(fragment))?;
        Ok(rows.scalar().cloned())
    }

    /// Name of the database the connection is using
    pub fn database_name(&self) -> Result<String> {
        let name = self.scalar(self.dialect.current_database_query())?;
        Ok(name.map(|v| v.to_string()).unwrap_or_default())
    }

    /// Version string reported by the server
    pub fn server_version(&self) -> Result<String> {
        let version = self.scalar(self.dialect.version_query())?;
        Ok(version.map(|v| v.to_string()).unwrap_or_default())
    }

    /// Fail with `UnsupportedVersion` when the server is older than the
    /// dialect's floor
    pub fn check_version(&self) -> Result<()> {
        let found = self.server_version()?;
        let minimum = self.dialect.min_version();
        if version_at_least(&found, minimum) {
            return Ok(());
        }
        Err(Error::UnsupportedVersion {
            driver: self.dialect.name(),
            minimum,
            found,
        })
    }

    pub fn has_table(&self, table: &str) -> Result<bool> {
        let database = self.database_name()?;
        let count = self.scalar(self.dialect.table_exists_query(&database, table))?;
        Ok(count.and_then(|v| v.as_u64()).unwrap_or(0) > 0)
    }

    /// Existing columns and indexes of a table
    pub fn table_info(&self, table: &str) -> Result<TableInfo> {
        let database = self.database_name()?;
        let names = |rows: Rows| {
            rows.first_column()
                .into_iter()
                .filter(|v| !v.is_null())
                .map(|v| v.to_string())
                .collect()
        };
        let columns = self.query_stmt(&mut self.statement(self.dialect.columns_query(&database, table)))?;
        let indexes = self.query_stmt(&mut self.statement(self.dialect.indexes_query(&database, table)))?;
        Ok(TableInfo {
            columns: names(columns),
            indexes: names(indexes),
        })
    }

    pub(crate) fn announce(&self) {
        info!(
            db = %self.id,
            driver = %self.driver,
            database = %self.name,
            "database handle opened"
        );
    }
}

impl fmt::Debug for Db {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Db")
            .field("id", &self.id)
            .field("driver", &self.driver)
            .field("name", &self.name)
            .field("omits", &self.omits)
            .finish_non_exhaustive()
    }
}

fn raw_fragment(sql: &str, args: &[Value]) -> Fragment {
    let mut out = Fragment::new();
    let mut args = args.iter();
    let mut pieces = sql.split('?').peekable();
    while let Some(piece) = pieces.next() {
        out.push_str(piece);
        if pieces.peek().is_some() {
            out.push_bind(args.next().cloned().unwrap_or_default());
        }
    }
    out
}

/// Rolls the transaction back on drop unless disarmed after commit
struct RollbackGuard {
    tx: Arc<dyn TxConnection>,
    armed: bool,
}

impl RollbackGuard {
    fn new(tx: Arc<dyn TxConnection>) -> Self {
        Self { tx, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for RollbackGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        warn!(panicking = std::thread::panicking(), "rolling back transaction");
        if let Err(err) = self.tx.rollback() {
            warn!(error = %err, "rollback failed");
        }
    }
}
