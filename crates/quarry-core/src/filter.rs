//! Filter predicates and operators

use crate::error::{Error, Result};
use crate::value::Value;
use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;
use std::str::FromStr;

/// Separates the column from the document path in JSON-scoped fields
pub const JSON_PATH_SEPARATOR: char = ':';

static PLAIN_SEGMENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("valid regex"));

/// Comparison operator of a filter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operator {
    Equal,
    /// Null-safe equality
    EqualTo,
    NotEqual,
    GreaterThan,
    GreaterEqual,
    LessThan,
    LessEqual,
    Like,
    NotLike,
    /// Matches when any of the listed patterns matches
    AnyLike,
    In,
    NotIn,
    JsonEqual,
    JsonNotEqual,
    JsonIn,
    JsonNotIn,
    /// Document array contains any of the listed values
    JsonContainsAny,
    /// Value at path has the given JSON type name
    JsonType,
    JsonIsObject,
    JsonIsArray,
}

impl Operator {
    /// Operators whose expression syntax is supplied by the dialect
    pub fn is_json(self) -> bool {
        matches!(
            self,
            Operator::JsonEqual
                | Operator::JsonNotEqual
                | Operator::JsonIn
                | Operator::JsonNotIn
                | Operator::JsonContainsAny
                | Operator::JsonType
                | Operator::JsonIsObject
                | Operator::JsonIsArray
        )
    }

    /// Operators that take a non-empty value list
    pub fn takes_list(self) -> bool {
        matches!(
            self,
            Operator::AnyLike
                | Operator::In
                | Operator::NotIn
                | Operator::JsonIn
                | Operator::JsonNotIn
                | Operator::JsonContainsAny
        )
    }

    /// SQL spelling of plain binary comparisons
    pub fn sql(self) -> Option<&'static str> {
        Some(match self {
            Operator::Equal => "=",
            Operator::NotEqual => "<>",
            Operator::GreaterThan => ">",
            Operator::GreaterEqual => ">=",
            Operator::LessThan => "<",
            Operator::LessEqual => "<=",
            Operator::Like => "LIKE",
            Operator::NotLike => "NOT LIKE",
            Operator::In => "IN",
            Operator::NotIn => "NOT IN",
            _ => return None,
        })
    }
}

impl FromStr for Operator {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.split_whitespace().collect::<Vec<_>>().join(" ");
        Ok(match normalized.to_lowercase().as_str() {
            "=" | "==" => Operator::Equal,
            "<=>" => Operator::EqualTo,
            "!=" | "<>" => Operator::NotEqual,
            ">" => Operator::GreaterThan,
            ">=" => Operator::GreaterEqual,
            "<" => Operator::LessThan,
            "<=" => Operator::LessEqual,
            "like" => Operator::Like,
            "not like" => Operator::NotLike,
            "any like" => Operator::AnyLike,
            "in" => Operator::In,
            "not in" => Operator::NotIn,
            _ => return Err(Error::InvalidOperator(s.to_string())),
        })
    }
}

/// Single predicate over a field
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub field: String,
    pub op: Operator,
    pub value: Value,
}

impl Filter {
    pub fn new(field: impl Into<String>, op: Operator, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            op,
            value: value.into(),
        }
    }

    pub fn is_json(&self) -> bool {
        self.op.is_json()
    }

    /// Column and document path of a JSON-scoped field (`meta:tags.0`)
    pub fn json_target(&self) -> (&str, Option<&str>) {
        match self.field.split_once(JSON_PATH_SEPARATOR) {
            Some((column, path)) if !path.is_empty() => (column, Some(path)),
            Some((column, _)) => (column, None),
            None => (&self.field, None),
        }
    }

    /// Path segments of a JSON-scoped field
    pub fn json_segments(&self) -> Vec<&str> {
        self.json_target()
            .1
            .map(|path| path.split('.').collect())
            .unwrap_or_default()
    }

    /// Values of a list operator, failing on an empty list
    pub fn values(&self) -> Result<Vec<Value>> {
        if self.value.is_null() {
            return Err(Error::EmptyValueList { op: self.op });
        }
        let values = self.value.clone().into_list();
        if values.is_empty() {
            return Err(Error::EmptyValueList { op: self.op });
        }
        Ok(values)
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {:?} {}", self.field, self.op, self.value)
    }
}

/// `$`-rooted JSON path for MySQL and SQLite path arguments
pub fn json_path(segments: &[&str]) -> String {
    let mut path = String::from("$");
    for segment in segments {
        if !segment.is_empty() && segment.bytes().all(|b| b.is_ascii_digit()) {
            path.push('[');
            path.push_str(segment);
            path.push(']');
        } else if PLAIN_SEGMENT.is_match(segment) {
            path.push('.');
            path.push_str(segment);
        } else {
            path.push_str(".\"");
            path.push_str(&segment.replace('\\', "\\\\").replace('"', "\\\""));
            path.push('"');
        }
    }
    path
}
