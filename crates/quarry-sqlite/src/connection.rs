//! SQLite connection wrapper implementing the quarry [`Connection`] trait
//!
//! Uses a simple Arc<Mutex<Connection>> pattern. Each transaction opens its
//! own connection to the same database, so statements issued through other
//! clones of the pool never join it. In-memory databases are opened as named
//! shared-cache databases for that reason.

use crate::config::SqliteConfig;
use crate::error::{SqliteError, SqliteResult};
use parking_lot::Mutex;
use quarry_core::connection::{Connection as QuarryConnection, TxConnection};
use quarry_core::{ExecResult, Rows, Value, TIME_FORMAT};
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params_from_iter, Connection};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

static MEMORY_DATABASES: AtomicU64 = AtomicU64::new(0);

/// Thread-safe SQLite connection wrapper
#[derive(Clone)]
pub struct SqlitePool {
    conn: Arc<Mutex<Connection>>,
    config: SqliteConfig,
    /// What every connection of this pool opens
    target: Arc<PathBuf>,
}

impl SqlitePool {
    /// Open the database and apply the configured pragmas
    pub fn new(config: SqliteConfig) -> SqliteResult<Self> {
        info!(path = ?config.path, "Creating SQLite connection");

        let target = if config.is_memory() {
            PathBuf::from(format!(
                "file:quarry-memory-{}-{}?mode=memory&cache=shared",
                std::process::id(),
                MEMORY_DATABASES.fetch_add(1, Ordering::Relaxed)
            ))
        } else {
            if let Some(parent) = config.path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent).map_err(|e| {
                    SqliteError::Connection(format!("Failed to create directory: {}", e))
                })?;
            }
            config.path.clone()
        };

        let conn = Self::open_connection(&config, &target)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            config,
            target: Arc::new(target),
        })
    }

    fn open_connection(config: &SqliteConfig, target: &Path) -> SqliteResult<Connection> {
        let conn = Connection::open(target)?;
        Self::configure_pragmas(config, &conn)?;
        Ok(conn)
    }

    /// Open from a connection string as produced by the SQLite dialect
    pub fn connect(dsn: &str) -> SqliteResult<Self> {
        Self::new(SqliteConfig::new(dsn))
    }

    /// Create an in-memory pool for testing
    pub fn memory() -> SqliteResult<Self> {
        Self::new(SqliteConfig::memory())
    }

    pub fn config(&self) -> &SqliteConfig {
        &self.config
    }

    /// Execute a closure with the connection
    pub fn with_connection<F, T>(&self, f: F) -> SqliteResult<T>
    where
        F: FnOnce(&Connection) -> SqliteResult<T>,
    {
        let conn = self.conn.lock();
        f(&conn)
    }

    fn configure_pragmas(config: &SqliteConfig, conn: &Connection) -> SqliteResult<()> {
        debug!("Configuring SQLite pragmas");

        if config.wal_mode && !config.is_memory() {
            conn.execute_batch("PRAGMA journal_mode = WAL;")?;
            conn.execute_batch("PRAGMA synchronous = NORMAL;")?;
        }

        if config.foreign_keys {
            conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        }

        conn.execute_batch(&format!(
            "PRAGMA busy_timeout = {};",
            config.busy_timeout_ms
        ))?;
        conn.execute_batch(&format!("PRAGMA cache_size = {};", config.cache_size))?;
        Ok(())
    }

    fn run_execute(&self, sql: &str, args: &[Value]) -> SqliteResult<ExecResult> {
        let params = args.iter().map(to_sql).collect::<SqliteResult<Vec<_>>>()?;
        self.with_connection(|conn| {
            let rows = conn.execute(sql, params_from_iter(params))?;
            Ok(ExecResult {
                rows_affected: rows as u64,
                last_insert_id: Some(conn.last_insert_rowid()),
            })
        })
    }

    fn run_query(&self, sql: &str, args: &[Value]) -> SqliteResult<Rows> {
        let params = args.iter().map(to_sql).collect::<SqliteResult<Vec<_>>>()?;
        self.with_connection(|conn| {
            let mut stmt = conn.prepare(sql)?;
            let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
            let width = columns.len();

            let mut rows = stmt.query(params_from_iter(params))?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                let mut values = Vec::with_capacity(width);
                for i in 0..width {
                    values.push(from_sql(row.get_ref(i)?));
                }
                out.push(values);
            }
            Ok(Rows::new(columns, out))
        })
    }
}

/// Bind form of a quarry value
fn to_sql(value: &Value) -> SqliteResult<SqlValue> {
    Ok(match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Int(n) => SqlValue::Integer(*n),
        Value::UInt(n) => match i64::try_from(*n) {
            Ok(n) => SqlValue::Integer(n),
            Err(_) => SqlValue::Text(n.to_string()),
        },
        Value::Float(f) if f.is_finite() => SqlValue::Real(*f),
        Value::Float(f) => {
            return Err(SqliteError::Conversion(format!("non-finite float {}", f)));
        }
        Value::String(s) => SqlValue::Text(s.clone()),
        Value::Bytes(b) => SqlValue::Blob(b.clone()),
        Value::Time(t) => SqlValue::Text(t.format(TIME_FORMAT).to_string()),
        Value::Key(k) => SqlValue::Text(k.encode()),
        Value::Json(j) => SqlValue::Text(j.to_string()),
        Value::List(_) => SqlValue::Text(value.to_json().to_string()),
    })
}

fn from_sql(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(n) => Value::Int(n),
        ValueRef::Real(f) => Value::Float(f),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::Bytes(b.to_vec()),
    }
}

impl QuarryConnection for SqlitePool {
    fn execute(&self, sql: &str, args: &[Value]) -> quarry_core::Result<ExecResult> {
        Ok(self.run_execute(sql, args)?)
    }

    fn query(&self, sql: &str, args: &[Value]) -> quarry_core::Result<Rows> {
        Ok(self.run_query(sql, args)?)
    }

    fn begin(&self) -> quarry_core::Result<Arc<dyn TxConnection>> {
        let conn = Self::open_connection(&self.config, &self.target)?;
        conn.execute_batch("BEGIN;").map_err(SqliteError::from)?;
        debug!("SQLite transaction started");
        Ok(Arc::new(SqliteTx {
            pool: Self {
                conn: Arc::new(Mutex::new(conn)),
                config: self.config.clone(),
                target: self.target.clone(),
            },
        }))
    }
}

/// Open transaction on a dedicated connection of a [`SqlitePool`]
struct SqliteTx {
    pool: SqlitePool,
}

impl TxConnection for SqliteTx {
    fn connection(&self) -> Arc<dyn QuarryConnection> {
        Arc::new(self.pool.clone())
    }

    fn commit(&self) -> quarry_core::Result<()> {
        Ok(self
            .pool
            .with_connection(|conn| Ok(conn.execute_batch("COMMIT;")?))?)
    }

    fn rollback(&self) -> quarry_core::Result<()> {
        Ok(self
            .pool
            .with_connection(|conn| Ok(conn.execute_batch("ROLLBACK;")?))?)
    }
}
