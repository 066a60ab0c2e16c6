//! Model contract, column declarations and the entity view used by the builder.

use crate::error::{Error, Result};
use crate::key::Key;
use crate::record::Record;
use crate::value::Value;
use serde::{Deserialize, Serialize};

/// Physical primary-key column
pub const PK_COLUMN: &str = "$Key";

/// Logical key field name accepted in filters and orders
pub const KEY_FIELD: &str = "__key__";

/// Soft-delete timestamp column
pub const SOFT_DELETE_COLUMN: &str = "$Deleted";

/// Optional column holding the encoded parent key
pub const PARENT_COLUMN: &str = "$Parent";

/// True for the logical and physical key names
pub fn is_key_field(name: &str) -> bool {
    name == KEY_FIELD || name == PK_COLUMN
}

/// A type persisted as rows of one table
///
/// Implementations describe their columns explicitly and convert to and from
/// a [`Record`]. The key is not part of the record written by
/// [`Model::to_record`]; the builder manages the `$Key` column itself.
///
/// ```ignore
/// impl Model for User {
///     fn kind() -> &'static str { "User" }
///     fn columns() -> Vec<Column> {
///         vec![Column::new("Name", ColumnType::String), Column::soft_delete()]
///     }
///     fn key(&self) -> Option<&Key> { self.key.as_ref() }
///     fn set_key(&mut self, key: Key) -> Result<()> { self.key = Some(key); Ok(()) }
///     fn to_record(&self) -> Result<Record> { Ok(Record::new().with("Name", &self.name)) }
///     fn from_record(r: &Record) -> Result<Self> {
///         Ok(User { key: r.key(), name: r.get_as("Name")?, deleted: r.get_as("$Deleted")? })
///     }
/// }
/// ```
pub trait Model: Sized {
    /// Entity kind, also the default table name
    fn kind() -> &'static str;

    /// Declared columns, excluding `$Key`
    fn columns() -> Vec<Column>;

    fn key(&self) -> Option<&Key> {
        None
    }

    /// Store the key assigned on insert. Types without a key field keep
    /// the default, which rejects the write.
    fn set_key(&mut self, _key: Key) -> Result<()> {
        Err(Error::MissingPrimaryKey {
            kind: Self::kind().to_string(),
        })
    }

    fn to_record(&self) -> Result<Record>;

    fn from_record(record: &Record) -> Result<Self>;

    /// Hook run once per row immediately before its columns are extracted
    fn before_save(&mut self) -> Result<()> {
        Ok(())
    }

    /// Hook run after a row has been decoded
    fn after_load(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Character set and collation (MySQL)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharSet {
    pub encoding: String,
    pub collation: String,
}

impl CharSet {
    pub fn new(encoding: impl Into<String>, collation: impl Into<String>) -> Self {
        Self {
            encoding: encoding.into(),
            collation: collation.into(),
        }
    }

    pub fn utf8() -> Self {
        Self::new("utf8", "utf8_unicode_ci")
    }

    pub fn latin1() -> Self {
        Self::new("latin1", "latin1_bin")
    }

    pub fn is_empty(&self) -> bool {
        self.encoding.is_empty() || self.collation.is_empty()
    }
}

impl Default for CharSet {
    fn default() -> Self {
        Self::new("utf8mb4", "utf8mb4_unicode_ci")
    }
}

/// Declared storage type of a column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColumnType {
    Bool,
    Int,
    UInt,
    Float,
    /// Short indexed string
    String,
    /// Unbounded text
    Text,
    Bytes,
    Time,
    Json,
    /// Encoded entity key
    Key,
}

impl ColumnType {
    /// Zero value written as the default of non-null columns
    pub fn zero_value(self) -> Value {
        match self {
            ColumnType::Bool => Value::Bool(false),
            ColumnType::Int => Value::Int(0),
            ColumnType::UInt => Value::UInt(0),
            ColumnType::Float => Value::Float(0.0),
            ColumnType::String | ColumnType::Text | ColumnType::Key => {
                Value::String(String::new())
            }
            ColumnType::Bytes => Value::Bytes(Vec::new()),
            ColumnType::Time => Value::Time(crate::value::zero_time()),
            ColumnType::Json => Value::Null,
        }
    }
}

/// Declared column
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub name: String,
    pub ty: ColumnType,
    pub nullable: bool,
    pub indexed: bool,
    pub unique: bool,
    pub default: Option<Value>,
    pub charset: Option<CharSet>,
}

impl Column {
    pub fn new(name: impl Into<String>, ty: ColumnType) -> Self {
        Self {
            name: name.into(),
            ty,
            nullable: false,
            indexed: false,
            unique: false,
            default: None,
            charset: None,
        }
    }

    /// The `$Key` primary-key column
    pub fn primary_key() -> Self {
        Self::new(PK_COLUMN, ColumnType::Key)
    }

    /// The `$Deleted` soft-delete column
    pub fn soft_delete() -> Self {
        Self::new(SOFT_DELETE_COLUMN, ColumnType::Time).nullable()
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub fn indexed(mut self) -> Self {
        self.indexed = true;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self.indexed = true;
        self
    }

    pub fn default_value(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn charset(mut self, charset: CharSet) -> Self {
        self.charset = Some(charset);
        self
    }

    pub fn is_primary_key(&self) -> bool {
        self.name == PK_COLUMN
    }

    /// Default rendered in DDL for non-null columns
    pub fn effective_default(&self) -> Value {
        self.default.clone().unwrap_or_else(|| self.ty.zero_value())
    }
}

/// One column's runtime value
#[derive(Debug, Clone, PartialEq)]
pub struct Property {
    pub name: String,
    pub ty: ColumnType,
    pub value: Value,
}

impl Property {
    /// Zero check used by sparse updates
    pub fn is_zero(&self) -> bool {
        self.value.is_zero()
    }

    /// Argument bound for this property
    pub fn arg(&self) -> Value {
        match (&self.value, self.ty) {
            (Value::Bool(b), ColumnType::Int | ColumnType::UInt) => Value::Int(i64::from(*b)),
            (v, _) => v.to_arg(),
        }
    }
}

/// Table-level view over a model type
#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
    name: String,
    kind: &'static str,
    columns: Vec<Column>,
}

impl Entity {
    pub fn of<M: Model>() -> Self {
        let mut columns = vec![Column::primary_key()];
        columns.extend(M::columns().into_iter().filter(|c| !c.is_primary_key()));
        Self {
            name: M::kind().to_string(),
            kind: M::kind(),
            columns,
        }
    }

    /// Use the scope's table in place of the model kind when set
    pub fn with_table(mut self, table: Option<&str>) -> Self {
        if let Some(table) = table.map(str::trim).filter(|t| !t.is_empty()) {
            self.name = table.to_string();
        }
        self
    }

    /// Resolved table name
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }

    /// All columns, `$Key` first
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn has_soft_delete(&self) -> bool {
        self.column(SOFT_DELETE_COLUMN).is_some()
    }

    /// Properties of a record for every declared column except `$Key`.
    ///
    /// Columns the record does not carry resolve to `Null`.
    pub fn properties(&self, record: &Record) -> Vec<Property> {
        self.columns
            .iter()
            .filter(|c| !c.is_primary_key())
            .map(|c| Property {
                name: c.name.clone(),
                ty: c.ty,
                value: record.get(&c.name).cloned().unwrap_or_default(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Note;

    impl Model for Note {
        fn kind() -> &'static str {
            "Note"
        }

        fn columns() -> Vec<Column> {
            vec![
                Column::new("Title", ColumnType::String).indexed(),
                Column::new("Body", ColumnType::Text),
                Column::soft_delete(),
            ]
        }

        fn to_record(&self) -> Result<Record> {
            Ok(Record::new().with("Title", "hello"))
        }

        fn from_record(_: &Record) -> Result<Self> {
            Ok(Note)
        }
    }

    #[test]
    fn test_entity_columns_start_with_key() {
        let entity = Entity::of::<Note>();
        assert_eq!(
            entity.column_names(),
            vec!["$Key", "Title", "Body", "$Deleted"]
        );
        assert!(entity.has_soft_delete());
        assert_eq!(entity.name(), "Note");
    }

    #[test]
    fn test_table_override() {
        let entity = Entity::of::<Note>().with_table(Some("Archive"));
        assert_eq!(entity.name(), "Archive");
        assert_eq!(entity.kind(), "Note");

        let entity = Entity::of::<Note>().with_table(Some("  "));
        assert_eq!(entity.name(), "Note");
    }

    #[test]
    fn test_properties_fill_missing_columns() {
        let entity = Entity::of::<Note>();
        let props = entity.properties(&Note.to_record().unwrap());
        assert_eq!(props.len(), 3);
        assert_eq!(props[0].value, Value::from("hello"));
        assert!(props[1].is_zero());
        assert!(props[2].value.is_null());
    }

    #[test]
    fn test_default_set_key_is_missing_primary_key() {
        let mut note = Note;
        assert_eq!(
            note.set_key(Key::id("Note", 1, None)),
            Err(Error::MissingPrimaryKey {
                kind: "Note".to_string()
            })
        );
    }
}
