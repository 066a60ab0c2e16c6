//! Backend-agnostic query descriptor

use crate::filter::Filter;
use crate::key::Key;

/// Sort direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    #[default]
    Ascending,
    Descending,
}

impl Direction {
    pub fn sql(self) -> &'static str {
        match self {
            Direction::Ascending => "ASC",
            Direction::Descending => "DESC",
        }
    }
}

/// One `ORDER BY` term
#[derive(Debug, Clone, PartialEq)]
pub struct Order {
    pub field: String,
    pub direction: Direction,
}

impl Order {
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: Direction::Ascending,
        }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: Direction::Descending,
        }
    }

    /// Parse `"Name"` (ascending) or `"-Name"` (descending)
    pub fn parse(text: &str) -> Self {
        match text.trim().strip_prefix('-') {
            Some(field) => Self::desc(field.trim()),
            None => Self::asc(text.trim().trim_start_matches('+')),
        }
    }
}

/// Row lock requested on a SELECT
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockMode {
    #[default]
    None,
    /// Shared lock
    Read,
    /// Exclusive lock
    Write,
}

/// Ancestor constraint
#[derive(Debug, Clone, PartialEq)]
pub enum Ancestor {
    /// Row must live below this key
    One(Key),
    /// Row must live below any of these keys
    AnyOf(Vec<Key>),
}

impl Ancestor {
    pub fn keys(&self) -> &[Key] {
        match self {
            Ancestor::One(key) => std::slice::from_ref(key),
            Ancestor::AnyOf(keys) => keys,
        }
    }
}

/// Query descriptor compiled by the builder
///
/// Filters and ancestor constraints are AND-joined; the keys of an
/// [`Ancestor::AnyOf`] group are OR-joined among themselves.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Scope {
    pub table: Option<String>,
    pub distinct_on: Vec<String>,
    pub projection: Vec<String>,
    /// Columns never written by upsert/save
    pub omits: Vec<String>,
    pub filters: Vec<Filter>,
    pub ancestors: Vec<Ancestor>,
    pub orders: Vec<Order>,
    pub limit: u64,
    pub offset: u64,
    pub lock_mode: LockMode,
    /// Disables the implicit live-rows-only filter
    pub unscoped: bool,
}

impl Scope {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: Some(table.into()),
            ..Default::default()
        }
    }

    pub fn is_omitted(&self, column: &str) -> bool {
        self.omits.iter().any(|c| c == column)
    }

    pub fn is_projected(&self, column: &str) -> bool {
        self.projection.iter().any(|c| c == column)
    }
}
