//! Backend-specific SQL syntax and capabilities
//!
//! Every dialect is a pure strategy object: it renders text and reports
//! capabilities but never talks to a connection. Introspection is exposed as
//! queries that [`crate::Db`] executes.

mod mysql;
mod postgres;
mod sqlite;

pub use mysql::MySql;
pub use postgres::Postgres;
pub use sqlite::Sqlite;

use crate::config::Config;
use crate::error::Result;
use crate::filter::Filter;
use crate::model::{CharSet, Column, ColumnType};
use crate::scope::LockMode;
use crate::statement::Fragment;
use crate::value::{Value, TIME_FORMAT};
use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;

static VERSION_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d+)\.(\d+)(?:\.(\d+))?").expect("valid regex"));

/// Existing shape of a table, as reported by the introspection queries
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TableInfo {
    pub columns: Vec<String>,
    pub indexes: Vec<String>,
}

impl TableInfo {
    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c == name)
    }

    pub fn has_index(&self, name: &str) -> bool {
        self.indexes.iter().any(|i| i == name)
    }
}

/// Capability set of one database engine
pub trait Dialect: Send + Sync + fmt::Debug {
    /// Driver name used in the registry
    fn name(&self) -> &'static str;

    /// Oldest supported server version
    fn min_version(&self) -> &'static str;

    fn connection_string(&self, config: &Config) -> String;

    /// Quote an identifier, doubling embedded quote characters
    fn quote(&self, ident: &str) -> String {
        quote_with(ident, '"')
    }

    fn table(&self, name: &str) -> String {
        self.quote(name)
    }

    /// Placeholder for the `index`-th argument (1-based)
    fn bind(&self, _index: usize) -> String {
        "?".to_string()
    }

    fn string_literal(&self, s: &str) -> String {
        format!("'{}'", s.replace('\'', "''"))
    }

    fn bool_literal(&self, b: bool) -> String {
        let literal = if b { "TRUE" } else { "FALSE" };
        literal.to_string()
    }

    fn bytes_literal(&self, b: &[u8]) -> String {
        format!("X'{}'", hex::encode(b))
    }

    /// SQL literal for human-readable rendering and DDL defaults
    fn literal(&self, value: &Value) -> String {
        match value {
            Value::Null => "NULL".to_string(),
            Value::Bool(b) => self.bool_literal(*b),
            Value::Int(n) => n.to_string(),
            Value::UInt(n) => n.to_string(),
            Value::Float(f) => f.to_string(),
            Value::String(s) => self.string_literal(s),
            Value::Bytes(b) => self.bytes_literal(b),
            Value::Time(t) => self.string_literal(&t.format(TIME_FORMAT).to_string()),
            Value::Key(k) => self.string_literal(&k.encode()),
            Value::Json(j) => self.string_literal(&j.to_string()),
            Value::List(_) => self.string_literal(&value.to_json().to_string()),
        }
    }

    /// Null-safe equality operator
    fn null_safe_equal(&self) -> &'static str;

    /// True when NULL sorts before every value in ascending order
    fn nulls_sort_low(&self) -> bool {
        true
    }

    /// ` ESCAPE ...` suffix declaring [`crate::key::LIKE_ESCAPE`] on a `LIKE` predicate
    fn like_escape(&self) -> &'static str {
        " ESCAPE '\\'"
    }

    /// Row-lock suffix for SELECT statements, with its leading space
    fn lock_clause(&self, mode: LockMode) -> &'static str;

    /// `LIMIT`/`OFFSET` suffix; empty when both are zero
    fn limit_offset(&self, limit: u64, offset: u64) -> String {
        let mut out = String::new();
        if limit > 0 {
            out.push_str(&format!(" LIMIT {}", limit));
        }
        if offset > 0 {
            out.push_str(&format!(" OFFSET {}", offset));
        }
        out
    }

    /// Conflict-resolution clause appended to a multi-row insert.
    ///
    /// `columns` never contains the primary key.
    fn on_conflict_update(&self, table: &str, columns: &[&str]) -> String;

    /// Expression for a JSON-scoped filter
    fn filter_json(&self, filter: &Filter) -> Result<Fragment>;

    /// True when `UPDATE ... LIMIT n` is valid
    fn supports_update_limit(&self) -> bool {
        false
    }

    /// Keyword for replace-style copies, when the engine has one
    fn replace_into(&self) -> Option<&'static str> {
        None
    }

    fn truncate(&self, table: &str) -> String {
        format!("TRUNCATE TABLE {};", self.table(table))
    }

    fn drop_table_if_exists(&self, table: &str) -> String {
        format!("DROP TABLE IF EXISTS {};", self.table(table))
    }

    /// SQL type of a column, without nullability
    fn data_type(&self, column: &Column) -> String;

    /// Whether the engine accepts a DEFAULT for this column type
    fn supports_default(&self, _ty: ColumnType) -> bool {
        true
    }

    /// Full column definition: type, nullability and default
    fn column_definition(&self, column: &Column) -> String {
        let mut out = self.data_type(column);
        if column.nullable {
            out.push_str(" NULL");
            return out;
        }
        out.push_str(" NOT NULL");
        let default = column.effective_default();
        if !default.is_null() && self.supports_default(column.ty) && !column.is_primary_key() {
            out.push_str(" DEFAULT ");
            out.push_str(&self.literal(&default));
        }
        out
    }

    /// Statements creating the table and its declared indexes
    fn create_table(&self, table: &str, columns: &[Column], charset: &CharSet) -> Vec<Fragment>;

    /// Statements altering an existing table to match the declared columns
    fn alter_table(
        &self,
        table: &str,
        columns: &[Column],
        existing: &TableInfo,
        charset: &CharSet,
    ) -> Vec<Fragment>;

    fn create_index(&self, table: &str, name: &str, columns: &[&str], unique: bool) -> String {
        let cols = columns
            .iter()
            .map(|c| self.quote(c))
            .collect::<Vec<_>>()
            .join(",");
        format!(
            "CREATE {}INDEX {} ON {} ({});",
            if unique { "UNIQUE " } else { "" },
            self.quote(name),
            self.table(table),
            cols
        )
    }

    fn drop_index(&self, _table: &str, name: &str) -> String {
        format!("DROP INDEX IF EXISTS {};", self.quote(name))
    }

    fn version_query(&self) -> Fragment;

    fn current_database_query(&self) -> Fragment;

    /// Returns a count of matching tables
    fn table_exists_query(&self, database: &str, table: &str) -> Fragment;

    /// Returns one column name per row
    fn columns_query(&self, database: &str, table: &str) -> Fragment;

    /// Returns one secondary index name per row
    fn indexes_query(&self, database: &str, table: &str) -> Fragment;
}

pub(crate) fn quote_with(ident: &str, quote: char) -> String {
    let mut out = String::with_capacity(ident.len() + 2);
    out.push(quote);
    for c in ident.chars() {
        if c == quote {
            out.push(quote);
        }
        out.push(c);
    }
    out.push(quote);
    out
}

/// Name of the index maintained for `columns` on `table`
pub fn index_name(table: &str, columns: &[&str], unique: bool) -> String {
    format!(
        "{}_{}_{}",
        table,
        columns.join("_"),
        if unique { "unique" } else { "idx" }
    )
}

/// Index changes needed to match the declared columns.
///
/// Only single-column indexes following [`index_name`] are dropped; indexes
/// created some other way are left alone.
pub(crate) struct IndexPlan<'a> {
    pub create: Vec<(String, &'a Column)>,
    pub drop: Vec<String>,
}

pub(crate) fn plan_indexes<'a>(
    table: &str,
    columns: &'a [Column],
    existing: &TableInfo,
) -> IndexPlan<'a> {
    let mut create = Vec::new();
    let mut wanted = Vec::new();
    for column in columns.iter().filter(|c| c.indexed && !c.is_primary_key()) {
        let name = index_name(table, &[&column.name], column.unique);
        if !existing.has_index(&name) {
            create.push((name.clone(), column));
        }
        wanted.push(name);
    }

    let managed: Vec<String> = existing
        .columns
        .iter()
        .chain(columns.iter().map(|c| &c.name))
        .flat_map(|c| {
            let c = c.as_str();
            [
                index_name(table, &[c], false),
                index_name(table, &[c], true),
            ]
        })
        .collect();

    let drop = existing
        .indexes
        .iter()
        .filter(|idx| managed.contains(idx) && !wanted.contains(idx))
        .cloned()
        .collect();

    IndexPlan { create, drop }
}

/// Existing columns that are no longer declared
pub(crate) fn dropped_columns<'a>(columns: &[Column], existing: &'a TableInfo) -> Vec<&'a str> {
    existing
        .columns
        .iter()
        .filter(|name| !columns.iter().any(|c| &c.name == *name))
        .map(String::as_str)
        .collect()
}

/// Numeric `(major, minor, patch)` of a version string
pub fn parse_version(raw: &str) -> Option<(u64, u64, u64)> {
    let caps = VERSION_PATTERN.captures(raw)?;
    let part = |i: usize| {
        caps.get(i)
            .and_then(|m| m.as_str().parse::<u64>().ok())
            .unwrap_or(0)
    };
    Some((part(1), part(2), part(3)))
}

/// True when `found` is at least `minimum`; unparseable versions fail
pub fn version_at_least(found: &str, minimum: &str) -> bool {
    match (parse_version(found), parse_version(minimum)) {
        (Some(found), Some(minimum)) => found >= minimum,
        _ => false,
    }
}

/// JSON text of a filter value bound as a document
pub(crate) fn json_arg(value: &Value) -> Value {
    match value {
        Value::Json(j) => Value::String(j.to_string()),
        other => Value::String(other.to_json().to_string()),
    }
}
