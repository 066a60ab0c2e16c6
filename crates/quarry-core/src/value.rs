//! Dynamically typed values used for arguments, properties and row cells.

use crate::error::{Error, Result};
use crate::key::Key;
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde_json::Value as Json;
use std::fmt;

/// Textual timestamp form used for storage and filter values
pub const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Value of a column, argument or property
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
    Time(DateTime<Utc>),
    Key(Key),
    Json(Json),
    List(Vec<Value>),
}

/// Zero value of a timestamp (`0001-01-01 00:00:00`)
pub fn zero_time() -> DateTime<Utc> {
    NaiveDate::from_ymd_opt(1, 1, 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| Utc.from_utc_datetime(&dt))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// True for the type's zero value (empty string, 0, false, null, ...)
    pub fn is_zero(&self) -> bool {
        match self {
            Value::Null => true,
            Value::Bool(b) => !b,
            Value::Int(n) => *n == 0,
            Value::UInt(n) => *n == 0,
            Value::Float(f) => *f == 0.0,
            Value::String(s) => s.is_empty(),
            Value::Bytes(b) => b.is_empty(),
            Value::Time(t) => *t == zero_time(),
            Value::Key(k) => k.is_incomplete(),
            Value::Json(j) => j.is_null(),
            Value::List(l) => l.is_empty(),
        }
    }

    /// Name of the variant, used in error messages
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::UInt(_) => "uint",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::Bytes(_) => "bytes",
            Value::Time(_) => "time",
            Value::Key(_) => "key",
            Value::Json(_) => "json",
            Value::List(_) => "list",
        }
    }

    /// Elements of a list value; a scalar is treated as a one-element list
    pub fn into_list(self) -> Vec<Value> {
        match self {
            Value::List(items) => items,
            Value::Json(Json::Array(items)) => items.into_iter().map(Value::Json).collect(),
            other => vec![other],
        }
    }

    /// Form handed to drivers: keys become strings, documents and lists
    /// become JSON text.
    pub fn to_arg(&self) -> Value {
        match self {
            Value::Key(k) => Value::String(k.encode()),
            Value::Json(j) => Value::String(j.to_string()),
            Value::List(_) => Value::String(self.to_json().to_string()),
            other => other.clone(),
        }
    }

    /// Form used when a fetched cell re-enters filter construction
    pub fn to_filter_value(&self) -> Value {
        match self {
            Value::Bytes(b) => Value::String(String::from_utf8_lossy(b).into_owned()),
            Value::Time(t) => Value::String(t.format(TIME_FORMAT).to_string()),
            other => other.clone(),
        }
    }

    /// JSON representation
    pub fn to_json(&self) -> Json {
        match self {
            Value::Null => Json::Null,
            Value::Bool(b) => Json::Bool(*b),
            Value::Int(n) => Json::from(*n),
            Value::UInt(n) => Json::from(*n),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(Json::Number)
                .unwrap_or(Json::Null),
            Value::String(s) => Json::String(s.clone()),
            Value::Bytes(b) => Json::String(String::from_utf8_lossy(b).into_owned()),
            Value::Time(t) => Json::String(t.format(TIME_FORMAT).to_string()),
            Value::Key(k) => Json::String(k.encode()),
            Value::Json(j) => j.clone(),
            Value::List(items) => Json::Array(items.iter().map(Value::to_json).collect()),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            Value::UInt(n) => i64::try_from(*n).ok(),
            Value::Bool(b) => Some(i64::from(*b)),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::UInt(n) => Some(*n),
            Value::Int(n) => u64::try_from(*n).ok(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(n) => Some(*n as f64),
            Value::UInt(n) => Some(*n as f64),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            Value::Int(n) => Some(*n != 0),
            Value::UInt(n) => Some(*n != 0),
            Value::String(s) => match s.as_str() {
                "1" | "true" | "TRUE" => Some(true),
                "0" | "false" | "FALSE" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    /// Timestamp, parsing the textual forms engines hand back
    pub fn as_time(&self) -> Option<DateTime<Utc>> {
        match self {
            Value::Time(t) => Some(*t),
            Value::String(s) => parse_time(s),
            _ => None,
        }
    }

    /// Key, decoding the string form if needed
    pub fn as_key(&self) -> Option<Key> {
        match self {
            Value::Key(k) => Some(k.clone()),
            Value::String(s) => Key::decode(s).ok(),
            _ => None,
        }
    }

    /// JSON document, parsing JSON text if needed
    pub fn as_json(&self) -> Result<Json> {
        match self {
            Value::Json(j) => Ok(j.clone()),
            Value::String(s) => {
                serde_json::from_str(s).map_err(|e| Error::Serialization(e.to_string()))
            }
            Value::Null => Ok(Json::Null),
            other => Ok(other.to_json()),
        }
    }
}

fn parse_time(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = NaiveDateTime::parse_from_str(s, TIME_FORMAT) {
        return Some(Utc.from_utc_datetime(&dt));
    }
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("NULL"),
            Value::String(s) => f.write_str(s),
            Value::Time(t) => write!(f, "{}", t.format(TIME_FORMAT)),
            Value::Key(k) => write!(f, "{}", k),
            other => write!(f, "{}", other.to_json()),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

macro_rules! impl_from_int {
    ($variant:ident, $target:ty, $($t:ty),*) => {
        $(
            impl From<$t> for Value {
                fn from(v: $t) -> Self {
                    Value::$variant(<$target>::from(v))
                }
            }
        )*
    };
}

impl_from_int!(Int, i64, i8, i16, i32, i64);
impl_from_int!(UInt, u64, u8, u16, u32, u64);

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::Float(f64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<&String> for Value {
    fn from(v: &String) -> Self {
        Value::String(v.clone())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Value::Time(v)
    }
}

impl From<Key> for Value {
    fn from(v: Key) -> Self {
        Value::Key(v)
    }
}

impl From<&Key> for Value {
    fn from(v: &Key) -> Self {
        Value::Key(v.clone())
    }
}

impl From<Json> for Value {
    fn from(v: Json) -> Self {
        Value::Json(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(v: Vec<T>) -> Self {
        Value::List(v.into_iter().map(Into::into).collect())
    }
}
