use super::{dropped_columns, json_arg, plan_indexes, quote_with, Dialect, TableInfo};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::filter::{json_path, Filter, Operator};
use crate::model::{CharSet, Column, ColumnType, PK_COLUMN};
use crate::scope::LockMode;
use crate::statement::Fragment;
use crate::value::Value;

/// MySQL 5.7+ and compatible servers
#[derive(Debug, Clone, Copy, Default)]
pub struct MySql;

/// Largest row count, used for an offset without a limit
const MAX_ROWS: &str = "18446744073709551615";

impl MySql {
    fn json_expr(&self, filter: &Filter) -> (String, Value) {
        let (column, _) = filter.json_target();
        (
            format!("JSON_EXTRACT({}, ", self.quote(column)),
            Value::String(json_path(&filter.json_segments())),
        )
    }

    fn charset_clause(&self, charset: &CharSet) -> String {
        format!(
            "CHARACTER SET {} COLLATE {}",
            self.quote(&charset.encoding),
            self.quote(&charset.collation)
        )
    }
}

impl Dialect for MySql {
    fn name(&self) -> &'static str {
        "mysql"
    }

    fn min_version(&self) -> &'static str {
        "5.7"
    }

    fn connection_string(&self, config: &Config) -> String {
        let address = if config.unix_socket.is_empty() {
            format!(
                "tcp({}:{})",
                config.host_or("localhost"),
                config.port.unwrap_or(3306)
            )
        } else {
            format!("unix({})", config.unix_socket)
        };
        let charset = config.charset();
        format!(
            "{}:{}@{}/{}?parseTime=true&charset={}&collation={}",
            urlencoding::encode(&config.username),
            urlencoding::encode(&config.password),
            address,
            urlencoding::encode(&config.database),
            charset.encoding,
            charset.collation
        )
    }

    fn quote(&self, ident: &str) -> String {
        quote_with(ident, '`')
    }

    fn string_literal(&self, s: &str) -> String {
        format!("'{}'", s.replace('\\', "\\\\").replace('\'', "''"))
    }

    fn bool_literal(&self, b: bool) -> String {
        let literal = if b { "true" } else { "false" };
        literal.to_string()
    }

    fn null_safe_equal(&self) -> &'static str {
        "<=>"
    }

    fn like_escape(&self) -> &'static str {
        " ESCAPE '\\\\'"
    }

    fn lock_clause(&self, mode: LockMode) -> &'static str {
        match mode {
            LockMode::None => "",
            LockMode::Read => " LOCK IN SHARE MODE",
            LockMode::Write => " FOR UPDATE",
        }
    }

    fn limit_offset(&self, limit: u64, offset: u64) -> String {
        match (limit, offset) {
            (0, 0) => String::new(),
            (0, offset) => format!(" LIMIT {} OFFSET {}", MAX_ROWS, offset),
            (limit, 0) => format!(" LIMIT {}", limit),
            (limit, offset) => format!(" LIMIT {} OFFSET {}", limit, offset),
        }
    }

    fn on_conflict_update(&self, _table: &str, columns: &[&str]) -> String {
        if columns.is_empty() {
            let pk = self.quote(PK_COLUMN);
            return format!("ON DUPLICATE KEY UPDATE {}={}", pk, pk);
        }
        let sets = columns
            .iter()
            .map(|c| {
                let c = self.quote(c);
                format!("{}=VALUES({})", c, c)
            })
            .collect::<Vec<_>>()
            .join(",");
        format!("ON DUPLICATE KEY UPDATE {}", sets)
    }

    fn filter_json(&self, filter: &Filter) -> Result<Fragment> {
        let (column, _) = filter.json_target();
        let column = self.quote(column);
        let (extract, path) = self.json_expr(filter);
        let mut out = Fragment::new();

        match filter.op {
            Operator::JsonEqual | Operator::JsonNotEqual => {
                out.push_str(&extract).push_bind(path).push_str(")");
                if filter.value.is_null() {
                    out.push_str(if filter.op == Operator::JsonEqual {
                        " IS NULL"
                    } else {
                        " IS NOT NULL"
                    });
                } else {
                    let op = if filter.op == Operator::JsonEqual { "=" } else { "<>" };
                    out.push_str(&format!(" {} CAST(", op))
                        .push_bind(json_arg(&filter.value))
                        .push_str(" AS JSON)");
                }
            }
            Operator::JsonIn | Operator::JsonNotIn => {
                let values = filter.values()?;
                out.push_str(&extract).push_bind(path).push_str(")");
                out.push_str(if filter.op == Operator::JsonIn {
                    " IN ("
                } else {
                    " NOT IN ("
                });
                for (i, v) in values.iter().enumerate() {
                    if i > 0 {
                        out.push_str(",");
                    }
                    out.push_str("CAST(").push_bind(json_arg(v)).push_str(" AS JSON)");
                }
                out.push_str(")");
            }
            Operator::JsonContainsAny => {
                let values = filter.values()?;
                let parts = values.iter().map(|v| {
                    let mut part = Fragment::raw(format!("JSON_CONTAINS({}, ", column));
                    part.push_bind(json_arg(v))
                        .push_str(", ")
                        .push_bind(path.clone())
                        .push_str(")");
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
                    .to_uppercase();
                out.push_str("JSON_TYPE(")
                    .push_str(&extract)
                    .push_bind(path)
                    .push_str(")) = ")
                    .push_bind(ty);
            }
            Operator::JsonIsObject | Operator::JsonIsArray => {
                let ty = if filter.op == Operator::JsonIsObject {
                    "OBJECT"
                } else {
                    "ARRAY"
                };
                out.push_str("JSON_TYPE(")
                    .push_str(&extract)
                    .push_bind(path)
                    .push_str(")) = ")
                    .push_bind(ty);
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

    fn supports_update_limit(&self) -> bool {
        true
    }

    fn replace_into(&self) -> Option<&'static str> {
        Some("REPLACE INTO")
    }

    fn data_type(&self, column: &Column) -> String {
        let base = match column.ty {
            ColumnType::Bool => "boolean",
            ColumnType::Int => "bigint",
            ColumnType::UInt => "bigint unsigned",
            ColumnType::Float => "double",
            ColumnType::String => "varchar(191)",
            ColumnType::Text => "text",
            ColumnType::Bytes => "blob",
            ColumnType::Time => "datetime",
            ColumnType::Json => "json",
            ColumnType::Key => "varchar(512)",
        };
        let charset = match (column.ty, &column.charset) {
            (ColumnType::Key, None) => Some(CharSet::latin1()),
            (ColumnType::String | ColumnType::Text, Some(cs)) if !cs.is_empty() => {
                Some(cs.clone())
            }
            (ColumnType::Key, Some(cs)) if !cs.is_empty() => Some(cs.clone()),
            _ => None,
        };
        match charset {
            Some(cs) => format!("{} {}", base, self.charset_clause(&cs)),
            None => base.to_string(),
        }
    }

    fn supports_default(&self, ty: ColumnType) -> bool {
        !matches!(ty, ColumnType::Text | ColumnType::Bytes | ColumnType::Json)
    }

    fn create_table(&self, table: &str, columns: &[Column], charset: &CharSet) -> Vec<Fragment> {
        let mut defs: Vec<String> = Vec::with_capacity(columns.len() + 1);
        for column in columns {
            defs.push(format!(
                "{} {}",
                self.quote(&column.name),
                self.column_definition(column)
            ));
        }
        for column in columns.iter().filter(|c| c.indexed && !c.is_primary_key()) {
            let name = super::index_name(table, &[&column.name], column.unique);
            defs.push(format!(
                "{}INDEX {} ({})",
                if column.unique { "UNIQUE " } else { "" },
                self.quote(&name),
                self.quote(&column.name)
            ));
        }
        defs.push(format!("PRIMARY KEY ({})", self.quote(PK_COLUMN)));

        vec![Fragment::raw(format!(
            "CREATE TABLE IF NOT EXISTS {} ({}) ENGINE=InnoDB DEFAULT CHARSET={} COLLATE={};",
            self.table(table),
            defs.join(", "),
            self.quote(&charset.encoding),
            self.quote(&charset.collation)
        ))]
    }

    fn alter_table(
        &self,
        table: &str,
        columns: &[Column],
        existing: &TableInfo,
        charset: &CharSet,
    ) -> Vec<Fragment> {
        let mut actions: Vec<String> = Vec::new();
        let mut position = "FIRST".to_string();
        for column in columns {
            let action = if existing.has_column(&column.name) {
                "MODIFY"
            } else {
                "ADD"
            };
            actions.push(format!(
                "{} {} {} {}",
                action,
                self.quote(&column.name),
                self.column_definition(column),
                position
            ));
            position = format!("AFTER {}", self.quote(&column.name));
        }

        let plan = plan_indexes(table, columns, existing);
        for (name, column) in &plan.create {
            actions.push(format!(
                "ADD {}INDEX {} ({})",
                if column.unique { "UNIQUE " } else { "" },
                self.quote(name),
                self.quote(&column.name)
            ));
        }
        for name in dropped_columns(columns, existing) {
            actions.push(format!("DROP COLUMN {}", self.quote(name)));
        }
        for name in &plan.drop {
            actions.push(format!("DROP INDEX {}", self.quote(name)));
        }
        actions.push(self.charset_clause(charset));

        vec![Fragment::raw(format!(
            "ALTER TABLE {} {};",
            self.table(table),
            actions.join(", ")
        ))]
    }

    fn drop_index(&self, table: &str, name: &str) -> String {
        format!("DROP INDEX {} ON {};", self.quote(name), self.table(table))
    }

    fn version_query(&self) -> Fragment {
        Fragment::raw("SELECT VERSION();")
    }

    fn current_database_query(&self) -> Fragment {
        Fragment::raw("SELECT DATABASE();")
    }

    fn table_exists_query(&self, database: &str, table: &str) -> Fragment {
        let mut f = Fragment::raw(
            "SELECT COUNT(*) FROM information_schema.tables WHERE table_schema = ",
        );
        f.push_bind(database)
            .push_str(" AND table_name = ")
            .push_bind(table)
            .push_str(";");
        f
    }

    fn columns_query(&self, database: &str, table: &str) -> Fragment {
        let mut f = Fragment::raw(
            "SELECT column_name FROM information_schema.columns WHERE table_schema = ",
        );
        f.push_bind(database)
            .push_str(" AND table_name = ")
            .push_bind(table)
            .push_str(" ORDER BY ordinal_position;");
        f
    }

    fn indexes_query(&self, database: &str, table: &str) -> Fragment {
        let mut f = Fragment::raw(
            "SELECT DISTINCT index_name FROM information_schema.statistics WHERE table_schema = ",
        );
        f.push_bind(database)
            .push_str(" AND table_name = ")
            .push_bind(table)
            .push_str(" AND index_name <> 'PRIMARY';");
        f
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_quote_and_literals() {
        let d = MySql;
        assert_eq!(d.quote("$Key"), "`$Key`");
        assert_eq!(d.literal(&Value::from("it's \\ ok")), "'it''s \\\\ ok'");
        assert_eq!(d.literal(&Value::Bool(true)), "true");
        assert_eq!(d.literal(&Value::Bytes(vec![0xab, 0x01])), "X'ab01'");
        assert_eq!(d.literal(&Value::Null), "NULL");
    }

    #[test]
    fn test_connection_string() {
        let mut config = Config {
            username: "root".into(),
            password: "secret".into(),
            database: "app".into(),
            ..Default::default()
        };
        config.normalize();
        assert_eq!(
            MySql.connection_string(&config),
            "root:secret@tcp(localhost:3306)/app?parseTime=true&charset=utf8mb4&collation=utf8mb4_unicode_ci"
        );

        config.unix_socket = "/var/run/mysqld.sock".into();
        assert!(MySql
            .connection_string(&config)
            .starts_with("root:secret@unix(/var/run/mysqld.sock)/app?"));
    }

    #[test]
    fn test_connection_string_escapes_credentials() {
        let mut config = Config {
            username: "app user".into(),
            password: "p@ss/word".into(),
            database: "main db".into(),
            ..Default::default()
        };
        config.normalize();
        assert!(MySql
            .connection_string(&config)
            .starts_with("app%20user:p%40ss%2Fword@tcp(localhost:3306)/main%20db?"));
    }

    #[test]
    fn test_like_escape_doubles_backslash() {
        assert_eq!(MySql.like_escape(), " ESCAPE '\\\\'");
        assert_eq!(crate::dialect::Sqlite.like_escape(), " ESCAPE '\\'");
    }

    #[test]
    fn test_limit_offset() {
        assert_eq!(MySql.limit_offset(0, 0), "");
        assert_eq!(MySql.limit_offset(10, 0), " LIMIT 10");
        assert_eq!(MySql.limit_offset(10, 5), " LIMIT 10 OFFSET 5");
        assert_eq!(
            MySql.limit_offset(0, 5),
            " LIMIT 18446744073709551615 OFFSET 5"
        );
    }

    #[test]
    fn test_on_conflict_update() {
        assert_eq!(
            MySql.on_conflict_update("User", &["Name", "Age"]),
            "ON DUPLICATE KEY UPDATE `Name`=VALUES(`Name`),`Age`=VALUES(`Age`)"
        );
        assert_eq!(
            MySql.on_conflict_update("User", &[]),
            "ON DUPLICATE KEY UPDATE `$Key`=`$Key`"
        );
    }

    #[test]
    fn test_column_definitions() {
        let d = MySql;
        assert_eq!(
            d.column_definition(&Column::new("Name", ColumnType::String)),
            "varchar(191) NOT NULL DEFAULT ''"
        );
        assert_eq!(
            d.column_definition(&Column::new("Body", ColumnType::Text)),
            "text NOT NULL"
        );
        assert_eq!(
            d.column_definition(&Column::soft_delete()),
            "datetime NULL"
        );
        assert_eq!(
            d.column_definition(&Column::primary_key()),
            "varchar(512) CHARACTER SET `latin1` COLLATE `latin1_bin` NOT NULL"
        );
    }

    #[test]
    fn test_create_table() {
        let columns = vec![
            Column::primary_key(),
            Column::new("Age", ColumnType::Int).indexed(),
        ];
        let stmts = MySql.create_table("User", &columns, &CharSet::default());
        assert_eq!(stmts.len(), 1);
        assert_eq!(
            stmts[0].text(),
            "CREATE TABLE IF NOT EXISTS `User` (\
             `$Key` varchar(512) CHARACTER SET `latin1` COLLATE `latin1_bin` NOT NULL, \
             `Age` bigint NOT NULL DEFAULT 0, \
             INDEX `User_Age_idx` (`Age`), \
             PRIMARY KEY (`$Key`)) \
             ENGINE=InnoDB DEFAULT CHARSET=`utf8mb4` COLLATE=`utf8mb4_unicode_ci`;"
        );
    }

    #[test]
    fn test_alter_table() {
        let columns = vec![
            Column::primary_key(),
            Column::new("Age", ColumnType::Int),
            Column::new("Email", ColumnType::String).unique(),
        ];
        let existing = TableInfo {
            columns: vec!["$Key".into(), "Age".into(), "Legacy".into()],
            indexes: vec!["User_Age_idx".into()],
        };
        let stmts = MySql.alter_table("User", &columns, &existing, &CharSet::default());
        let sql = stmts[0].text();

        assert!(sql.starts_with("ALTER TABLE `User` MODIFY `$Key` "));
        assert!(sql.contains("MODIFY `Age` bigint NOT NULL DEFAULT 0 AFTER `$Key`"));
        assert!(sql.contains("ADD `Email` varchar(191) NOT NULL DEFAULT '' AFTER `Age`"));
        assert!(sql.contains("ADD UNIQUE INDEX `User_Email_unique` (`Email`)"));
        assert!(sql.contains("DROP COLUMN `Legacy`"));
        assert!(sql.contains("DROP INDEX `User_Age_idx`"));
        assert!(sql.ends_with("CHARACTER SET `utf8mb4` COLLATE `utf8mb4_unicode_ci`;"));
    }

    #[test]
    fn test_filter_json_equal() {
        let f = Filter::new("Meta:address.city", Operator::JsonEqual, "Oslo");
        let frag = MySql.filter_json(&f).unwrap();
        assert_eq!(
            frag.to_string(),
            "JSON_EXTRACT(`Meta`, ?) = CAST(? AS JSON)"
        );
        assert_eq!(
            frag.args(),
            &[Value::from("$.address.city"), Value::from("\"Oslo\"")]
        );
    }

    #[test]
    fn test_filter_json_contains_any() {
        let f = Filter::new("Tags:", Operator::JsonContainsAny, vec!["a", "b"]);
        let frag = MySql.filter_json(&f).unwrap();
        assert_eq!(
            frag.to_string(),
            "(JSON_CONTAINS(`Tags`, ?, ?) OR JSON_CONTAINS(`Tags`, ?, ?))"
        );
        assert_eq!(frag.args()[0], Value::from("\"a\""));
        assert_eq!(frag.args()[1], Value::from("$"));
    }

    #[test]
    fn test_filter_json_type() {
        let f = Filter::new("Meta:items", Operator::JsonIsArray, Value::Null);
        let frag = MySql.filter_json(&f).unwrap();
        assert_eq!(frag.to_string(), "JSON_TYPE(JSON_EXTRACT(`Meta`, ?)) = ?");
        assert_eq!(frag.args()[1], Value::from("ARRAY"));

        let f = Filter::new("Meta", Operator::JsonType, json!({"bad": 1}));
        assert!(matches!(
            MySql.filter_json(&f),
            Err(Error::UnsupportedType { .. })
        ));
    }

    #[test]
    fn test_filter_json_empty_list() {
        let f = Filter::new("Meta:ids", Operator::JsonIn, Vec::<i64>::new());
        assert_eq!(
            MySql.filter_json(&f),
            Err(Error::EmptyValueList {
                op: Operator::JsonIn
            })
        );
    }
}
