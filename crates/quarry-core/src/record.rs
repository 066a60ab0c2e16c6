//! Named column values and decoded result sets

use crate::cursor::Cursor;
use crate::error::{Error, Result};
use crate::key::{Key, KEY_DELIMITER};
use crate::model::{Model, KEY_FIELD, PARENT_COLUMN, PK_COLUMN};
use crate::value::{zero_time, Value};
use chrono::{DateTime, Utc};

/// Ordered column name → value mapping for one row
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record {
    fields: Vec<(String, Value)>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style [`Record::set`]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(name, value);
        self
    }

    /// Insert or replace a column value
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        let name = name.into();
        let value = value.into();
        match self.fields.iter_mut().find(|(n, _)| *n == name) {
            Some((_, slot)) => *slot = value,
            None => self.fields.push((name, value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    /// Typed value of a column; a missing column converts from `Null`
    pub fn get_as<T: FromValue>(&self, name: &str) -> Result<T> {
        let value = self.get(name).unwrap_or(&Value::Null);
        T::from_value(value).map_err(|e| match e {
            Error::Serialization(msg) => Error::Serialization(format!("column {}: {}", name, msg)),
            other => other,
        })
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        let idx = self.fields.iter().position(|(n, _)| n == name)?;
        Some(self.fields.remove(idx).1)
    }

    /// Key of the row, read from `__key__` or `$Key`
    pub fn key(&self) -> Option<Key> {
        self.get(KEY_FIELD)
            .or_else(|| self.get(PK_COLUMN))
            .and_then(Value::as_key)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(n, _)| n.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|(n, v)| (n.as_str(), v))
    }

    /// Build a record from a fetched row.
    ///
    /// Byte buffers become text and the synthesized key (combined with
    /// `$Parent` when that column is present) is exposed as `__key__`.
    pub fn from_row(columns: &[String], values: Vec<Value>) -> Self {
        let mut record = Record {
            fields: Vec::with_capacity(columns.len() + 1),
        };
        for (name, value) in columns.iter().zip(values) {
            let value = match value {
                Value::Bytes(b) => Value::String(String::from_utf8_lossy(&b).into_owned()),
                other => other,
            };
            record.fields.push((name.clone(), value));
        }
        record.patch_key();
        record
    }

    fn patch_key(&mut self) {
        let raw = match self.get(PK_COLUMN) {
            Some(Value::String(s)) if !s.is_empty() => s.clone(),
            Some(Value::Key(k)) => k.encode(),
            _ => return,
        };
        let encoded = match self.get(PARENT_COLUMN).and_then(Value::as_str) {
            Some(parent) if !parent.is_empty() && !raw.starts_with(parent) => {
                format!("{}{}{}", parent, KEY_DELIMITER, raw)
            }
            _ => raw,
        };
        if let Ok(key) = Key::decode(&encoded) {
            self.set(KEY_FIELD, Value::Key(key));
        }
    }
}

/// Conversion out of a dynamically typed [`Value`]
///
/// `Null` converts to the target's zero value for plain scalars; use
/// `Option<T>` to observe nulls.
pub trait FromValue: Sized {
    fn from_value(value: &Value) -> Result<Self>;
}

fn mismatch(value: &Value, target: &str) -> Error {
    Error::Serialization(format!("cannot convert {} to {}", value.type_name(), target))
}

impl FromValue for Value {
    fn from_value(value: &Value) -> Result<Self> {
        Ok(value.clone())
    }
}

impl FromValue for String {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Null => Ok(String::new()),
            Value::String(s) => Ok(s.clone()),
            Value::Bytes(b) => Ok(String::from_utf8_lossy(b).into_owned()),
            other => Ok(other.to_string()),
        }
    }
}

impl FromValue for bool {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Null => Ok(false),
            v => v.as_bool().ok_or_else(|| mismatch(v, "bool")),
        }
    }
}

impl FromValue for i64 {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Null => Ok(0),
            v => v.as_i64().ok_or_else(|| mismatch(v, "i64")),
        }
    }
}

impl FromValue for i32 {
    fn from_value(value: &Value) -> Result<Self> {
        let n = i64::from_value(value)?;
        i32::try_from(n).map_err(|_| mismatch(value, "i32"))
    }
}

impl FromValue for u64 {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Null => Ok(0),
            v => v.as_u64().ok_or_else(|| mismatch(v, "u64")),
        }
    }
}

impl FromValue for u32 {
    fn from_value(value: &Value) -> Result<Self> {
        let n = u64::from_value(value)?;
        u32::try_from(n).map_err(|_| mismatch(value, "u32"))
    }
}

impl FromValue for f64 {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Null => Ok(0.0),
            v => v.as_f64().ok_or_else(|| mismatch(v, "f64")),
        }
    }
}

impl FromValue for DateTime<Utc> {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Null => Ok(zero_time()),
            v => v.as_time().ok_or_else(|| mismatch(v, "time")),
        }
    }
}

impl FromValue for Key {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Key(k) => Ok(k.clone()),
            Value::String(s) => Key::decode(s),
            v => Err(mismatch(v, "key")),
        }
    }
}

impl FromValue for serde_json::Value {
    fn from_value(value: &Value) -> Result<Self> {
        value.as_json()
    }
}

impl FromValue for Vec<u8> {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Null => Ok(Vec::new()),
            Value::Bytes(b) => Ok(b.clone()),
            Value::String(s) => Ok(s.as_bytes().to_vec()),
            v => Err(mismatch(v, "bytes")),
        }
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Null => Ok(None),
            v => T::from_value(v).map(Some),
        }
    }
}

/// Raw rows returned by a connection
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Rows {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl Rows {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<Value>>) -> Self {
        Self { columns, rows }
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// First cell of the first row
    pub fn scalar(&self) -> Option<&Value> {
        self.rows.first().and_then(|r| r.first())
    }

    /// First cell of every row
    pub fn first_column(&self) -> Vec<Value> {
        self.rows
            .iter()
            .filter_map(|r| r.first().cloned())
            .collect()
    }
}

/// Decoded rows of one query with a movable position
#[derive(Debug, Clone, Default)]
pub struct ResultSet {
    table: String,
    columns: Vec<String>,
    records: Vec<Record>,
    position: Option<usize>,
    signature: Option<String>,
}

impl ResultSet {
    pub fn new(table: impl Into<String>, rows: Rows) -> Self {
        let Rows { columns, rows } = rows;
        let records = rows
            .into_iter()
            .map(|values| Record::from_row(&columns, values))
            .collect();
        Self {
            table: table.into(),
            columns,
            records,
            position: None,
            signature: None,
        }
    }

    /// Attach the query signature used to issue cursors
    pub(crate) fn with_signature(mut self, signature: String) -> Self {
        self.signature = Some(signature);
        self
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    /// Move to the first row
    pub fn first(&mut self) -> Option<&Record> {
        if self.records.is_empty() {
            self.position = None;
            return None;
        }
        self.position = Some(0);
        self.records.first()
    }

    /// Advance to the next row
    pub fn next_record(&mut self) -> Option<&Record> {
        let next = self.position.map_or(0, |p| p + 1);
        if next >= self.records.len() {
            self.position = Some(self.records.len());
            return None;
        }
        self.position = Some(next);
        self.records.get(next)
    }

    pub fn current(&self) -> Option<&Record> {
        self.position.and_then(|p| self.records.get(p))
    }

    /// Decode the current row into a model
    pub fn scan<M: Model>(&self) -> Result<M> {
        let record = self.current().ok_or(Error::NotFound)?;
        decode(record)
    }

    /// Decode every row
    pub fn collect<M: Model>(&self) -> Result<Vec<M>> {
        self.records.iter().map(decode).collect()
    }

    /// Cursor pointing at the current row
    pub fn cursor(&self) -> Option<Cursor> {
        let signature = self.signature.as_ref()?;
        let key = self.current()?.key()?;
        Some(Cursor::new(signature.clone(), key))
    }

    pub(crate) fn truncate(&mut self, len: usize) {
        self.records.truncate(len);
        if self.position.is_some_and(|p| p >= len) {
            self.position = len.checked_sub(1);
        }
    }
}

fn decode<M: Model>(record: &Record) -> Result<M> {
    let mut model = M::from_record(record)?;
    model.after_load()?;
    Ok(model)
}
