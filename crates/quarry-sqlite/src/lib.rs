//! SQLite driver for quarry
//!
//! Provides [`SqlitePool`], a [`quarry_core::Connection`] backed by
//! `rusqlite`, and [`open`] to register it with a [`Registry`].
//!
//! ## Usage
//!
//! ```rust,ignore
//! use quarry_core::Registry;
//! use quarry_sqlite::SqliteConfig;
//!
//! let registry = Registry::with_builtin();
//! let db = quarry_sqlite::open(&registry, SqliteConfig::new("./app.db"))?;
//! db.migrate(&[Entity::of::<User>()])?;
//! ```

pub mod config;
pub mod connection;
pub mod error;

pub use config::SqliteConfig;
pub use connection::SqlitePool;
pub use error::{SqliteError, SqliteResult};

use quarry_core::{Config, Connection, Db, Registry};
use std::sync::Arc;

/// Open a SQLite database through `registry`
///
/// The handle is stored under the `sqlite` driver and the database path.
pub fn open(registry: &Registry, config: SqliteConfig) -> quarry_core::Result<Db> {
    let database = config.database();
    registry.open("sqlite", Config::new(database), move |_dsn| {
        let pool = SqlitePool::new(config)?;
        Ok(Arc::new(pool) as Arc<dyn Connection>)
    })
}
