use super::{dropped_columns, json_arg, plan_indexes, Dialect, TableInfo};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::filter::{Filter, Operator};
use crate::model::{CharSet, Column, ColumnType, PK_COLUMN};
use crate::scope::LockMode;
use crate::statement::Fragment;
use crate::value::Value;

/// PostgreSQL 9.5+
#[derive(Debug, Clone, Copy, Default)]
pub struct Postgres;

impl Postgres {
    /// `jsonb_extract_path(col, ?, ...)`, or the bare column without a path
    fn json_expr(&self, filter: &Filter) -> Fragment {
        let (column, _) = filter.json_target();
        let segments = filter.json_segments();
        if segments.is_empty() {
            return Fragment::raw(self.quote(column));
        }
        let mut out = Fragment::raw(format!("jsonb_extract_path({}", self.quote(column)));
        for segment in segments {
            out.push_str(", ").push_bind(segment);
        }
        out.push_str(")");
        out
    }
}

fn typeof_equals(expr: Fragment, ty: impl Into<Value>) -> Fragment {
    let mut out = Fragment::raw("jsonb_typeof(");
    out.append(expr).push_str(") = ").push_bind(ty);
    out
}

impl Dialect for Postgres {
    fn name(&self) -> &'static str {
        "postgres"
    }

    fn min_version(&self) -> &'static str {
        "9.5"
    }

    fn connection_string(&self, config: &Config) -> String {
        let credentials = if config.username.is_empty() {
            String::new()
        } else if config.password.is_empty() {
            format!("{}@", urlencoding::encode(&config.username))
        } else {
            format!(
                "{}:{}@",
                urlencoding::encode(&config.username),
                urlencoding::encode(&config.password)
            )
        };
        if config.unix_socket.is_empty() {
            format!(
                "postgres://{}{}:{}/{}?sslmode=disable",
                credentials,
                config.host_or("localhost"),
                config.port.unwrap_or(5432),
                urlencoding::encode(&config.database)
            )
        } else {
            format!(
                "postgres://{}/{}?host={}&sslmode=disable",
                credentials.trim_end_matches('@'),
                urlencoding::encode(&config.database),
                urlencoding::encode(&config.unix_socket)
            )
        }
    }

    fn bind(&self, index: usize) -> String {
        format!("${}", index)
    }

    fn bytes_literal(&self, b: &[u8]) -> String {
        format!("'\\x{}'", hex::encode(b))
    }

    fn null_safe_equal(&self) -> &'static str {
        "IS NOT DISTINCT FROM"
    }

    fn nulls_sort_low(&self) -> bool {
        false
    }

    fn lock_clause(&self, mode: LockMode) -> &'static str {
        match mode {
            LockMode::None => "",
            LockMode::Read => " FOR SHARE",
            LockMode::Write => " FOR UPDATE",
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
                format!("{} = EXCLUDED.{}", c, c)
            })
            .collect::<Vec<_>>()
            .join(",");
        format!("{} DO UPDATE SET {}", target, sets)
    }

    fn filter_json(&self, filter: &Filter) -> Result<Fragment> {
        let mut out = self.json_expr(filter);
        match filter.op {
            Operator::JsonEqual | Operator::JsonNotEqual => {
                let equal = filter.op == Operator::JsonEqual;
                if filter.value.is_null() {
                    out.push_str(if equal { " IS NULL" } else { " IS NOT NULL" });
                } else {
                    out.push_str(if equal { " = " } else { " <> " })
                        .push_bind(json_arg(&filter.value))
                        .push_str("::jsonb");
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
                    out.push_bind(json_arg(v)).push_str("::jsonb");
                }
                out.push_str(")");
            }
            Operator::JsonContainsAny => {
                let values = filter.values()?;
                let parts = values.iter().map(|v| {
                    let mut part = self.json_expr(filter);
                    part.push_str(" @> ")
                        .push_bind(Value::String(
                            serde_json::Value::Array(vec![v.to_json()]).to_string(),
                        ))
                        .push_str("::jsonb");
                    part
                });
                out = Fragment::join(parts, " OR ").parenthesized();
            }
            Operator::JsonType => {
                let ty = filter
                    .value
                    .as_str()
                    .ok_or(Error::UnsupportedType {
                        operation: "JsonType",
                        data_type: filter.value.type_name(),
                    })?
                    .to_lowercase();
                out = typeof_equals(out, ty);
            }
            Operator::JsonIsObject | Operator::JsonIsArray => {
                let ty = if filter.op == Operator::JsonIsObject {
                    "object"
                } else {
                    "array"
                };
                out = typeof_equals(out, ty);
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

    fn data_type(&self, column: &Column) -> String {
        match column.ty {
            ColumnType::Bool => "boolean",
            ColumnType::Int => "bigint",
            // no unsigned integers; numeric keeps the full u64 range
            ColumnType::UInt => "numeric(20,0)",
            ColumnType::Float => "double precision",
            ColumnType::String => "varchar(191)",
            ColumnType::Text => "text",
            ColumnType::Bytes => "bytea",
            ColumnType::Time => "timestamp",
            ColumnType::Json => "jsonb",
            ColumnType::Key => "varchar(512)",
        }
        .to_string()
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
        let mut actions: Vec<String> = Vec::new();
        for column in columns {
            let name = self.quote(&column.name);
            if !existing.has_column(&column.name) {
                actions.push(format!(
                    "ADD COLUMN {} {}",
                    name,
                    self.column_definition(column)
                ));
                continue;
            }
            let ty = self.data_type(column);
            actions.push(format!(
                "ALTER COLUMN {} TYPE {} USING {}::{}",
                name, ty, name, ty
            ));
            if column.nullable {
                actions.push(format!("ALTER COLUMN {} DROP NOT NULL", name));
                continue;
            }
            let default = column.effective_default();
            if !column.is_primary_key() && !default.is_null() {
                actions.push(format!(
                    "ALTER COLUMN {} SET DEFAULT {}",
                    name,
                    self.literal(&default)
                ));
            }
            actions.push(format!("ALTER COLUMN {} SET NOT NULL", name));
        }
        for name in dropped_columns(columns, existing) {
            actions.push(format!("DROP COLUMN {}", self.quote(name)));
        }

        let mut stmts = vec![Fragment::raw(format!(
            "ALTER TABLE {} {};",
            self.table(table),
            actions.join(", ")
        ))];
        let plan = plan_indexes(table, columns, existing);
        for name in &plan.drop {
            stmts.push(Fragment::raw(self.drop_index(table, name)));
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
        Fragment::raw("SHOW server_version;")
    }

    fn current_database_query(&self) -> Fragment {
        Fragment::raw("SELECT current_database();")
    }

    fn table_exists_query(&self, database: &str, table: &str) -> Fragment {
        let mut f = Fragment::raw(
            "SELECT COUNT(*) FROM information_schema.tables WHERE table_catalog = ",
        );
        f.push_bind(database)
            .push_str(" AND table_schema = current_schema() AND table_name = ")
            .push_bind(table)
            .push_str(";");
        f
    }

    fn columns_query(&self, database: &str, table: &str) -> Fragment {
        let mut f = Fragment::raw(
            "SELECT column_name FROM information_schema.columns WHERE table_catalog = ",
        );
        f.push_bind(database)
            .push_str(" AND table_schema = current_schema() AND table_name = ")
            .push_bind(table)
            .push_str(" ORDER BY ordinal_position;");
        f
    }

    fn indexes_query(&self, _database: &str, table: &str) -> Fragment {
        let mut f = Fragment::raw(
            "SELECT indexname FROM pg_indexes WHERE schemaname = current_schema() AND tablename = ",
        );
        f.push_bind(table)
            .push_str(" AND indexname NOT LIKE '%_pkey';");
        f
    }
}
