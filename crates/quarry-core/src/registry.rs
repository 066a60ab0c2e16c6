//! Driver and handle registry
//!
//! Maps driver names to dialects and `(driver, database)` pairs to opened
//! handles. The registry is an ordinary value owned by the caller; share it
//! behind an `Arc` when several components need it.

use crate::config::Config;
use crate::connection::Connection;
use crate::db::Db;
use crate::dialect::{Dialect, MySql, Postgres, Sqlite};
use crate::error::{Error, Result};
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Registered dialects and opened handles
#[derive(Default)]
pub struct Registry {
    dialects: DashMap<String, Arc<dyn Dialect>>,
    handles: DashMap<(String, String), Db>,
}

fn normalize_driver(driver: &str) -> String {
    driver.trim().to_lowercase()
}

impl Registry {
    /// Registry without any dialect
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the MySQL, Postgres and SQLite dialects
    pub fn with_builtin() -> Self {
        let registry = Self::new();
        registry.register(Arc::new(MySql));
        registry.register(Arc::new(Postgres));
        registry.register(Arc::new(Sqlite));
        registry
    }

    /// Register a dialect under its own name, replacing any previous one
    pub fn register(&self, dialect: Arc<dyn Dialect>) {
        debug!(driver = dialect.name(), "registering dialect");
        self.dialects.insert(normalize_driver(dialect.name()), dialect);
    }

    pub fn dialect(&self, driver: &str) -> Result<Arc<dyn Dialect>> {
        let driver = normalize_driver(driver);
        self.dialects
            .get(&driver)
            .map(|d| d.value().clone())
            .ok_or(Error::UnsupportedDriver(driver))
    }

    /// Open a handle.
    ///
    /// `connect` receives the dialect's connection string and returns the
    /// driver connection. The handle is pinged and version-checked before it
    /// is stored; opening the same pair again replaces the stored handle.
    pub fn open<F>(&self, driver: &str, mut config: Config, connect: F) -> Result<Db>
    where
        F: FnOnce(&str) -> Result<Arc<dyn Connection>>,
    {
        let driver = normalize_driver(driver);
        let dialect = self.dialect(&driver)?;
        config.normalize();

        let conn = connect(&dialect.connection_string(&config))?;
        conn.ping().map_err(|err| Error::Unreachable {
            driver: driver.clone(),
            message: err.to_string(),
        })?;

        let db = Db::new(driver.clone(), config.database.clone(), conn, dialect)
            .with_charset(config.charset());
        db.check_version()?;

        self.handles
            .insert((driver, config.database.clone()), db.clone());
        db.announce();
        Ok(db)
    }

    /// Previously opened handle
    pub fn get(&self, driver: &str, database: &str) -> Option<Db> {
        self.handles
            .get(&(normalize_driver(driver), database.trim().to_string()))
            .map(|db| db.value().clone())
    }

    /// Forget a handle; the connection closes when its last clone drops
    pub fn close(&self, driver: &str, database: &str) -> Option<Db> {
        let removed = self
            .handles
            .remove(&(normalize_driver(driver), database.trim().to_string()))
            .map(|(_, db)| db);
        if removed.is_some() {
            info!(driver, database, "database handle closed");
        }
        removed
    }

    /// Number of open handles
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}
