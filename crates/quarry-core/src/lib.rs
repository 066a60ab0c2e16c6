//! Key/ancestor document model compiled to dialect-correct SQL
//!
//! Rows are addressed by hierarchical [`Key`]s stored in a `$Key` column.
//! Queries are described by a [`Scope`], compiled by the builder into a
//! [`Fragment`] for the active [`Dialect`] and executed through a
//! [`Connection`] supplied by a driver crate.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use quarry_core::{Config, Registry};
//!
//! let registry = Registry::with_builtin();
//! let db = registry.open("sqlite", Config::new("app.db"), connect)?;
//!
//! db.migrate(&[Entity::of::<User>()])?;
//! db.create(&mut users)?;
//!
//! let adults: Vec<User> = db
//!     .query()
//!     .where_op("Age", ">=", 18)
//!     .order_by("-Age")
//!     .get()?;
//! ```

pub mod builder;
pub mod config;
pub mod connection;
pub mod cursor;
pub mod db;
pub mod dialect;
pub mod error;
pub mod filter;
pub mod key;
pub mod model;
pub mod query;
pub mod record;
pub mod registry;
pub mod scope;
pub mod statement;
pub mod value;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use builder::Builder;
pub use config::Config;
pub use connection::{Connection, TxConnection};
pub use cursor::{Cursor, Pagination, DEFAULT_PAGE_SIZE};
pub use db::{Db, LogHandler};
pub use dialect::{Dialect, MySql, Postgres, Sqlite, TableInfo};
pub use error::{Error, Result};
pub use filter::{Filter, Operator};
pub use key::{Id, Key};
pub use model::{
    CharSet, Column, ColumnType, Entity, Model, Property, KEY_FIELD, PARENT_COLUMN, PK_COLUMN,
    SOFT_DELETE_COLUMN,
};
pub use query::Query;
pub use record::{FromValue, Record, ResultSet, Rows};
pub use registry::Registry;
pub use scope::{Ancestor, Direction, LockMode, Order, Scope};
pub use statement::{ExecResult, Fragment, Statement};
pub use value::{Value, TIME_FORMAT};
