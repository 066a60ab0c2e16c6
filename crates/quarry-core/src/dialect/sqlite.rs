use super::{dropped_columns, json_arg, plan_indexes, Dialect, TableInfo};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::filter::{json_path, Filter, Operator};
use crate::model::{CharSet, Column, ColumnType, PK_COLUMN};
use crate::scope::LockMode;
use crate::statement::Fragment;
use crate::value::Value;
use tracing::debug;

/// SQLite 3.35+ (DROP COLUMN and upsert support)
#[derive(Debug, Clone, Copy, Default)]
pub struct Sqlite;

/// Scalar form of a JSON comparison operand
///
/// `json_extract` yields SQL scalars for scalar values, so scalars bind
/// directly and documents go through `json(?)`.
fn push_json_operand(out: &mut Fragment, value: &Value) {
    match value {
        Value::Json(serde_json::Value::Object(_) | serde_json::Value::Array(_))
        | Value::List(_) => {
            out.push_str("json(").push_bind(json_arg(value)).push_str(")");
        }
        Value::Json(j) => {
            out.push_bind(json_scalar(j));
        }
        Value::Bool(b) => {
            out.push_bind(i64::from(*b));
        }
        other => {
            out.push_bind(other.to_arg());
        }
    }
}

fn json_scalar(j: &serde_json::Value) -> Value {
    match j {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Int(i64::from(*b)),
        serde_json::Value::Number(n) => n
            .as_i64()
            .map(Value::Int)
            .or_else(|| n.as_f64().map(Value::Float))
            .unwrap_or(Value::Null),
        serde_json::Value::String(s) => Value::String(s.clone()),
        other => Value::String(other.to_string()),
    }
}

impl Dialect for Sqlite {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn min_version(&self) -> &'static str {
        "3.35"
    }

    fn connection_string(&self, config: &Config) -> String {
        if config.database.is_empty() {
            ":memory:".to_string()
        } else {
            config.database.clone()
        }
    }

    fn bool_literal(&self, b: bool) -> String {
        let literal = if b { "1" } else { "0" };
        literal.to_string()
    }

    fn null_safe_equal(&self) -> &'static str {
        "IS"
    }

    fn lock_clause(&self, _mode: LockMode) -> &'static str {
        ""
    }

    fn limit_offset(&self, limit: u64, offset: u64) -> String {
        match (limit, offset) {
            (0, 0) => String::new(),
            (0, offset) => format!(" LIMIT -1 OFFSET {}", offset),
            (limit, 0) => format!(" LIMIT {}", limit),
            (limit, offset) => format!(" LIMIT {} OFFSET {}", limit, offset),
        }
    }

    fn on_conflict_update(&self, _table: &str, columns: &[&str]) -> String {
        let target = format!("ON CONFLICT ({})", self.quote(PK_COLUMN));
        if columns.is_empty() {
            return format!("{} DO NOTHING", target);
        }
        let sets = columns
            .iter()
            .map(|c| {
                let c = self.quote(c);
                format!("{} = excluded.{}", c, c)
            })
            .collect::<Vec<_>>()
            .join(",");
        format!("{} DO UPDATE SET {}", target, sets)
    }

    fn filter_json(&self, filter: &Filter) -> Result<Fragment> {
        let (column, _) = filter.json_target();
        let column = self.quote(column);
        let path = Value::String(json_path(&filter.json_segments()));
        let mut out = Fragment::raw(format!("json_extract({}, ", column));
        out.push_bind(path.clone()).push_str(")");

        match filter.op {
            Operator::JsonEqual | Operator::JsonNotEqual => {
                let equal = filter.op == Operator::JsonEqual;
                if filter.value.is_null() {
                    out.push_str(if equal { " IS NULL" } else { " IS NOT NULL" });
                } else {
                    out.push_str(if equal { " = " } else { " <> " });
                    push_json_operand(&mut out, &filter.value);
                }
            }
            Operator::JsonIn | Operator::JsonNotIn => {
                let values = filter.values()?;
                out.push_str(if filter.op == Operator::JsonIn {
                    " IN ("
                } else {
                    " NOT IN ("
                });
                for (i, v) in values.iter().enumerate() {
                    if i > 0 {
                        out.push_str(",");
                    }
                    push_json_operand(&mut out, v);
                }
                out.push_str(")");
            }
            Operator::JsonContainsAny => {
                let values = filter.values()?;
                out = Fragment::raw(format!("EXISTS (SELECT 1 FROM json_each({}, ", column));
                out.push_bind(path).push_str(") WHERE value IN (");
                for (i, v) in values.iter().enumerate() {
                    if i > 0 {
                        out.push_str(",");
                    }
                    push_json_operand(&mut out, v);
                }
                out.push_str("))");
            }
            Operator::JsonType | Operator::JsonIsObject | Operator::JsonIsArray => {
                let ty = match filter.op {
                    Operator::JsonIsObject => "object".to_string(),
                    Operator::JsonIsArray => "array".to_string(),
                    _ => filter
                        .value
                        .as_str()
                        .ok_or(Error::UnsupportedType {
                            operation: "JsonType",
                            data_type: filter.value.type_name(),
                        })?
                        .to_lowercase(),
                };
                out = Fragment::raw(format!("json_type({}, ", column));
                out.push_bind(path).push_str(") = ").push_bind(ty);
            }
            _ => {
                return Err(Error::UnsupportedType {
                    operation: "filter_json",
                    data_type: "non-json operator",
                })
            }
        }
        Ok(out)
    }

    fn replace_into(&self) -> Option<&'static str> {
        Some("REPLACE INTO")
    }

    fn truncate(&self, table: &str) -> String {
        format!("DELETE FROM {};", self.table(table))
    }

    fn data_type(&self, column: &Column) -> String {
        match column.ty {
            ColumnType::Bool | ColumnType::Int | ColumnType::UInt => "INTEGER",
            ColumnType::Float => "REAL",
            ColumnType::Bytes => "BLOB",
            ColumnType::String
            | ColumnType::Text
            | ColumnType::Time
            | ColumnType::Json
            | ColumnType::Key => "TEXT",
        }
        .to_string()
    }

    fn column_definition(&self, column: &Column) -> String {
        let mut out = self.data_type(column);
        if column.nullable {
            return out;
        }
        out.push_str(" NOT NULL");
        if column.is_primary_key() {
            return out;
        }
        // ADD COLUMN ... NOT NULL needs a non-null default
        let default = match column.effective_default() {
            Value::Null => Value::String("null".to_string()),
            other => other,
        };
        out.push_str(" DEFAULT ");
        out.push_str(&self.literal(&default));
        out
    }

    fn create_table(&self, table: &str, columns: &[Column], _charset: &CharSet) -> Vec<Fragment> {
        let mut defs: Vec<String> = columns
            .iter()
            .map(|c| format!("{} {}", self.quote(&c.name), self.column_definition(c)))
            .collect();
        defs.push(format!("PRIMARY KEY ({})", self.quote(PK_COLUMN)));

        let mut stmts = vec![Fragment::raw(format!(
            "CREATE TABLE IF NOT EXISTS {} ({});",
            self.table(table),
            defs.join(", ")
        ))];
        for column in columns.iter().filter(|c| c.indexed && !c.is_primary_key()) {
            let name = super::index_name(table, &[&column.name], column.unique);
            stmts.push(Fragment::raw(self.create_index(
                table,
                &name,
                &[&column.name],
                column.unique,
            )));
        }
        stmts
    }

    fn alter_table(
        &self,
        table: &str,
        columns: &[Column],
        existing: &TableInfo,
        _charset: &CharSet,
    ) -> Vec<Fragment> {
        let mut stmts = Vec::new();
        for column in columns {
            if existing.has_column(&column.name) {
                debug!(table, column = %column.name, "sqlite cannot modify columns in place, keeping existing definition");
                continue;
            }
            stmts.push(Fragment::raw(format!(
                "ALTER TABLE {} ADD COLUMN {} {};",
                self.table(table),
                self.quote(&column.name),
                self.column_definition(column)
            )));
        }

        let plan = plan_indexes(table, columns, existing);
        // indexes go before their columns
        for name in &plan.drop {
            stmts.push(Fragment::raw(self.drop_index(table, name)));
        }
        for name in dropped_columns(columns, existing) {
            stmts.push(Fragment::raw(format!(
                "ALTER TABLE {} DROP COLUMN {};",
                self.table(table),
                self.quote(name)
            )));
        }
        for (name, column) in &plan.create {
            stmts.push(Fragment::raw(self.create_index(
                table,
                name,
                &[&column.name],
                column.unique,
            )));
        }
        stmts
    }

    fn create_index(&self, table: &str, name: &str, columns: &[&str], unique: bool) -> String {
        let cols = columns
            .iter()
            .map(|c| self.quote(c))
            .collect::<Vec<_>>()
            .join(",");
        format!(
            "CREATE {}INDEX IF NOT EXISTS {} ON {} ({});",
            if unique { "UNIQUE " } else { "" },
            self.quote(name),
            self.table(table),
            cols
        )
    }

    fn version_query(&self) -> Fragment {
        Fragment::raw("SELECT sqlite_version();")
    }

    fn current_database_query(&self) -> Fragment {
        Fragment::raw("SELECT 'main';")
    }

    fn table_exists_query(&self, _database: &str, table: &str) -> Fragment {
        let mut f = Fragment::raw("SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ");
        f.push_bind(table).push_str(";");
        f
    }

    fn columns_query(&self, _database: &str, table: &str) -> Fragment {
        let mut f = Fragment::raw("SELECT name FROM pragma_table_info(");
        f.push_bind(table).push_str(") ORDER BY cid;");
        f
    }

    fn indexes_query(&self, _database: &str, table: &str) -> Fragment {
        let mut f = Fragment::raw("SELECT name FROM pragma_index_list(");
        f.push_bind(table).push_str(") WHERE origin = 'c';");
        f
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_limit_without_offset_spelling() {
        assert_eq!(Sqlite.limit_offset(0, 3), " LIMIT -1 OFFSET 3");
        assert_eq!(Sqlite.limit_offset(2, 0), " LIMIT 2");
    }

    #[test]
    fn test_column_definitions_always_default() {
        assert_eq!(
            Sqlite.column_definition(&Column::new("Active", ColumnType::Bool)),
            "INTEGER NOT NULL DEFAULT 0"
        );
        assert_eq!(
            Sqlite.column_definition(&Column::new("Meta", ColumnType::Json)),
            "TEXT NOT NULL DEFAULT 'null'"
        );
        assert_eq!(
            Sqlite.column_definition(&Column::new("Born", ColumnType::Time)),
            "TEXT NOT NULL DEFAULT '0001-01-01 00:00:00'"
        );
        assert_eq!(
            Sqlite.column_definition(&Column::soft_delete()),
            "TEXT"
        );
        assert_eq!(
            Sqlite.column_definition(&Column::primary_key()),
            "TEXT NOT NULL"
        );
    }

    #[test]
    fn test_alter_table_skips_existing_columns() {
        let columns = vec![
            Column::primary_key(),
            Column::new("Name", ColumnType::String),
            Column::new("Age", ColumnType::Int).indexed(),
        ];
        let existing = TableInfo {
            columns: vec!["$Key".into(), "Name".into(), "Gone".into()],
            indexes: vec!["User_Gone_idx".into()],
        };
        let sql: Vec<String> = Sqlite
            .alter_table("User", &columns, &existing, &CharSet::default())
            .into_iter()
            .map(|f| f.text().to_string())
            .collect();
        assert_eq!(
            sql,
            vec![
                "ALTER TABLE \"User\" ADD COLUMN \"Age\" INTEGER NOT NULL DEFAULT 0;",
                "DROP INDEX IF EXISTS \"User_Gone_idx\";",
                "ALTER TABLE \"User\" DROP COLUMN \"Gone\";",
                "CREATE INDEX IF NOT EXISTS \"User_Age_idx\" ON \"User\" (\"Age\");",
            ]
        );
    }

    #[test]
    fn test_filter_json_scalar_equal() {
        let f = Filter::new("Meta:active", Operator::JsonEqual, true);
        let frag = Sqlite.filter_json(&f).unwrap();
        assert_eq!(frag.to_string(), "json_extract(\"Meta\", ?) = ?");
        assert_eq!(frag.args(), &[Value::from("$.active"), Value::Int(1)]);
    }

    #[test]
    fn test_filter_json_document_equal() {
        let f = Filter::new("Meta:dims", Operator::JsonEqual, json!([1, 2]));
        let frag = Sqlite.filter_json(&f).unwrap();
        assert_eq!(frag.to_string(), "json_extract(\"Meta\", ?) = json(?)");
        assert_eq!(frag.args()[1], Value::from("[1,2]"));
    }

    #[test]
    fn test_filter_json_contains_any() {
        let f = Filter::new("Tags", Operator::JsonContainsAny, vec!["x", "y"]);
        let frag = Sqlite.filter_json(&f).unwrap();
        assert_eq!(
            frag.to_string(),
            "EXISTS (SELECT 1 FROM json_each(\"Tags\", ?) WHERE value IN (?,?))"
        );
        assert_eq!(
            frag.args(),
            &[Value::from("$"), Value::from("x"), Value::from("y")]
        );
    }

    #[test]
    fn test_filter_json_type() {
        let f = Filter::new("Meta:n", Operator::JsonType, "INTEGER");
        let frag = Sqlite.filter_json(&f).unwrap();
        assert_eq!(frag.to_string(), "json_type(\"Meta\", ?) = ?");
        assert_eq!(frag.args()[1], Value::from("integer"));
    }
}
