//! Scope and model compilation into dialect SQL
//!
//! Every compile step is pure: it reads a snapshot of the [`Scope`] and the
//! entity metadata and returns [`Fragment`]s. Only the `run`-style methods at
//! the bottom of the impl touch the connection, through [`Db`].

use crate::cursor::{sign, Cursor, Pagination};
use crate::db::Db;
use crate::dialect::{index_name, Dialect};
use crate::error::{Error, Result};
use crate::filter::{Filter, Operator};
use crate::key::Key;
use crate::model::{is_key_field, Entity, Model, PK_COLUMN, SOFT_DELETE_COLUMN};
use crate::record::{Record, ResultSet};
use crate::scope::{Ancestor, Direction, Order, Scope};
use crate::statement::{ExecResult, Fragment, Statement};
use crate::value::Value;
use chrono::{SubsecRound, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

static PLAIN_IDENTIFIER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[\$A-Za-z0-9_]+(\.[A-Za-z0-9_]+)*$").expect("valid regex")
});

/// Compiles one scope snapshot against one database handle
pub struct Builder {
    db: Db,
    scope: Scope,
}

impl Builder {
    pub fn new(db: Db, scope: Scope) -> Self {
        Self { db, scope }
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    fn dialect(&self) -> &Arc<dyn Dialect> {
        self.db.dialect()
    }

    fn entity<M: Model>(&self) -> Entity {
        Entity::of::<M>().with_table(self.scope.table.as_deref())
    }

    fn table_name(&self) -> Result<String> {
        self.scope
            .table
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .ok_or(Error::MissingTable)
    }

    /// Quote plain and dotted identifiers; anything else passes through
    /// unescaped, so callers must not feed it untrusted text
    fn quote_if_necessary(&self, name: &str) -> String {
        if !PLAIN_IDENTIFIER.is_match(name) {
            return name.to_string();
        }
        name.split('.')
            .map(|part| self.dialect().quote(part))
            .collect::<Vec<_>>()
            .join(".")
    }

    /// Physical column name for a filter or order field
    fn column(&self, field: &str) -> String {
        if is_key_field(field) {
            self.dialect().quote(PK_COLUMN)
        } else {
            self.dialect().quote(field)
        }
    }

    /// `SELECT` with projection, or `DISTINCT` list when present
    pub fn select_clause(&self, scope: &Scope) -> String {
        let list = |fields: &[String]| {
            fields
                .iter()
                .map(|f| self.quote_if_necessary(f))
                .collect::<Vec<_>>()
                .join(",")
        };
        if !scope.distinct_on.is_empty() {
            format!("SELECT DISTINCT {}", list(&scope.distinct_on))
        } else if !scope.projection.is_empty() {
            format!("SELECT {}", list(&scope.projection))
        } else {
            "SELECT *".to_string()
        }
    }

    fn filter_clause(&self, filter: &Filter) -> Result<Fragment> {
        if filter.is_json() {
            return self.dialect().filter_json(filter);
        }

        let name = self.column(&filter.field);
        let value = if is_key_field(&filter.field) {
            key_arg(&filter.value)?
        } else {
            filter.value.clone()
        };

        let mut out = Fragment::raw(&name);
        match filter.op {
            Operator::Equal if value.is_null() => {
                out.push_str(" IS NULL");
            }
            Operator::NotEqual if value.is_null() => {
                out.push_str(" IS NOT NULL");
            }
            Operator::EqualTo => {
                out.push_str(&format!(" {} ", self.dialect().null_safe_equal()))
                    .push_bind(value.to_arg());
            }
            Operator::AnyLike => {
                let values = Filter::new(filter.field.clone(), filter.op, value).values()?;
                let parts = values.into_iter().map(|v| {
                    let mut part = Fragment::raw(format!("{} LIKE ", name));
                    part.push_bind(v.to_arg());
                    part
                });
                out = Fragment::join(parts, " OR ").parenthesized();
            }
            Operator::In | Operator::NotIn => {
                let values = Filter::new(filter.field.clone(), filter.op, value).values()?;
                out.push_str(if filter.op == Operator::In {
                    " IN "
                } else {
                    " NOT IN "
                })
                .push_bind_list(values.iter().map(Value::to_arg));
            }
            op => {
                let sql = op
                    .sql()
                    .ok_or_else(|| Error::InvalidOperator(format!("{:?}", op)))?;
                out.push_str(&format!(" {} ", sql)).push_bind(value.to_arg());
            }
        }
        Ok(out)
    }

    fn ancestor_clause(&self, ancestor: &Ancestor) -> Result<Fragment> {
        let pk = self.dialect().quote(PK_COLUMN);
        let keys = ancestor.keys();
        if keys.is_empty() {
            return Err(Error::EmptyValueList { op: Operator::Like });
        }
        let parts = keys.iter().map(|key| {
            let mut part = Fragment::raw(format!("{} LIKE ", pk));
            part.push_bind(key.ancestor_pattern())
                .push_str(self.dialect().like_escape());
            part
        });
        Ok(match ancestor {
            Ancestor::One(_) => Fragment::join(parts, " OR "),
            Ancestor::AnyOf(_) => Fragment::join(parts, " OR ").parenthesized(),
        })
    }

    /// ` WHERE ...` or an empty fragment
    pub fn where_clause(&self, scope: &Scope, extra: Option<Fragment>) -> Result<Fragment> {
        let mut clauses = Vec::with_capacity(scope.filters.len() + scope.ancestors.len() + 1);
        for filter in &scope.filters {
            clauses.push(self.filter_clause(filter)?);
        }
        for ancestor in &scope.ancestors {
            clauses.push(self.ancestor_clause(ancestor)?);
        }
        clauses.extend(extra);

        if clauses.is_empty() {
            return Ok(Fragment::new());
        }
        let mut out = Fragment::raw(" WHERE ");
        out.append(Fragment::join(clauses, " AND "));
        Ok(out)
    }

    /// ` ORDER BY ...` or empty
    pub fn order_clause(&self, scope: &Scope) -> String {
        if scope.orders.is_empty() {
            return String::new();
        }
        let terms = scope
            .orders
            .iter()
            .map(|o| format!("{} {}", self.column(&o.field), o.direction.sql()))
            .collect::<Vec<_>>()
            .join(",");
        format!(" ORDER BY {}", terms)
    }

    pub fn limit_clause(&self, scope: &Scope) -> String {
        self.dialect().limit_offset(scope.limit, scope.offset)
    }

    /// WHERE, ORDER BY and LIMIT/OFFSET of a scope
    fn tail(&self, scope: &Scope, extra: Option<Fragment>) -> Result<Fragment> {
        let mut out = self.where_clause(scope, extra)?;
        out.push_str(&self.order_clause(scope));
        out.push_str(&self.limit_clause(scope));
        Ok(out)
    }

    /// Scope with the live-rows-only filter applied when it is due
    pub fn scoped(&self, entity: &Entity) -> Scope {
        let mut scope = self.scope.clone();
        if !scope.unscoped && entity.has_soft_delete() {
            scope
                .filters
                .push(Filter::new(SOFT_DELETE_COLUMN, Operator::Equal, Value::Null));
        }
        scope
    }

    fn select_with(&self, entity: &Entity, scope: &Scope, extra: Option<Fragment>) -> Result<Fragment> {
        let mut out = Fragment::raw(self.select_clause(scope));
        out.push_str(" FROM ");
        out.push_str(&self.dialect().table(entity.name()));
        out.append(self.tail(scope, extra)?);
        out.push_str(self.dialect().lock_clause(scope.lock_mode));
        out.push_str(";");
        Ok(out)
    }

    /// Full SELECT for an entity
    pub fn select_stmt(&self, entity: &Entity) -> Result<Fragment> {
        self.select_with(entity, &self.scoped(entity), None)
    }

    fn statement(&self, fragment: Fragment) -> Statement {
        Statement::new(fragment, self.dialect().clone())
    }

    fn insert_body<M: Model>(
        &self,
        entity: &Entity,
        models: &mut [M],
        parent: Option<&Key>,
    ) -> Result<Fragment> {
        let columns = entity
            .column_names()
            .iter()
            .map(|c| self.dialect().quote(c))
            .collect::<Vec<_>>()
            .join(",");

        let mut out = Fragment::raw(format!(
            "INSERT INTO {} ({}) VALUES ",
            self.dialect().table(entity.name()),
            columns
        ));

        for (i, model) in models.iter_mut().enumerate() {
            let key = match parent {
                Some(parent) => Key::allocate(entity.kind(), Some(parent.clone())),
                None => Key::for_insert(entity.kind(), model.key()),
            };
            model.set_key(key.clone())?;
            model.before_save()?;

            let record = model.to_record()?;
            let mut row = vec![Value::String(key.encode())];
            row.extend(entity.properties(&record).iter().map(|p| p.arg()));

            if i > 0 {
                out.push_str(",");
            }
            out.push_bind_list(row);
        }
        Ok(out)
    }

    /// Multi-row INSERT; `None` when there is nothing to insert
    pub fn insert_stmt<M: Model>(
        &self,
        entity: &Entity,
        models: &mut [M],
        parent: Option<&Key>,
    ) -> Result<Option<Fragment>> {
        if models.is_empty() {
            return Ok(None);
        }
        let mut out = self.insert_body(entity, models, parent)?;
        out.push_str(";");
        Ok(Some(out))
    }

    /// INSERT with the dialect's conflict clause. `$Key` and omitted
    /// columns are never updated on conflict.
    pub fn upsert_stmt<M: Model>(
        &self,
        entity: &Entity,
        models: &mut [M],
        parent: Option<&Key>,
    ) -> Result<Option<Fragment>> {
        if models.is_empty() {
            return Ok(None);
        }
        let mut out = self.insert_body(entity, models, parent)?;
        let columns: Vec<&str> = entity
            .column_names()
            .into_iter()
            .filter(|c| *c != PK_COLUMN && !self.scope.is_omitted(c))
            .collect();
        out.push_str(" ");
        out.push_str(&self.dialect().on_conflict_update(entity.name(), &columns));
        out.push_str(";");
        Ok(Some(out))
    }

    /// UPDATE of one already-identified row; the soft-delete marker is left
    /// untouched
    pub fn save_stmt<M: Model>(&self, entity: &Entity, model: &mut M) -> Result<Option<Fragment>> {
        model.before_save()?;
        let key = match model.key() {
            Some(key) if !key.is_incomplete() => key.clone(),
            other => {
                return Err(Error::InvalidKey {
                    key: other.map_or_else(|| "nil".to_string(), Key::encode),
                })
            }
        };

        let record = model.to_record()?;
        let sets: Vec<Fragment> = entity
            .properties(&record)
            .into_iter()
            .filter(|p| p.name != SOFT_DELETE_COLUMN && !self.scope.is_omitted(&p.name))
            .map(|p| {
                let mut set = Fragment::raw(format!("{} = ", self.dialect().quote(&p.name)));
                set.push_bind(p.arg());
                set
            })
            .collect();
        if sets.is_empty() {
            return Ok(None);
        }

        let mut out = Fragment::raw(format!("UPDATE {} SET ", self.dialect().table(entity.name())));
        out.append(Fragment::join(sets, ","));
        out.push_str(&format!(" WHERE {} = ", self.dialect().quote(PK_COLUMN)));
        out.push_bind(key.encode());
        out.push_str(";");
        Ok(Some(out))
    }

    /// Predicate part of UPDATE and DELETE by query, emulating a row limit
    /// through a key subquery when the engine has no `UPDATE ... LIMIT`
    fn mutation_tail(&self, table: &str) -> Result<Fragment> {
        let scope = &self.scope;
        let limited = scope.limit > 0 || scope.offset > 0;
        if limited && !self.dialect().supports_update_limit() {
            let pk = self.dialect().quote(PK_COLUMN);
            let mut out = Fragment::raw(format!(
                " WHERE {} IN (SELECT {} FROM {}",
                pk,
                pk,
                self.dialect().table(table)
            ));
            out.append(self.tail(scope, None)?);
            out.push_str(")");
            return Ok(out);
        }

        let mut out = self.where_clause(scope, None)?;
        if self.dialect().supports_update_limit() {
            out.push_str(&self.order_clause(scope));
            out.push_str(&self.dialect().limit_offset(scope.limit, 0));
        }
        Ok(out)
    }

    fn update_with(&self, table: &str, sets: Vec<Fragment>) -> Result<Fragment> {
        let mut out = Fragment::raw(format!("UPDATE {} SET ", self.dialect().table(table)));
        out.append(Fragment::join(sets, ","));
        out.append(self.mutation_tail(table)?);
        out.push_str(";");
        Ok(out)
    }

    /// Bulk UPDATE from a field → value map
    pub fn update_map_stmt(&self, values: &BTreeMap<String, Value>) -> Result<Option<Fragment>> {
        let table = self.table_name()?;
        if values.is_empty() {
            return Ok(None);
        }
        let mut sets = Vec::with_capacity(values.len());
        for (field, value) in values {
            if is_key_field(field) {
                return Err(Error::KeyUpdateNotAllowed);
            }
            let mut set = Fragment::raw(format!("{} = ", self.dialect().quote(field)));
            set.push_bind(value.to_arg());
            sets.push(set);
        }
        self.update_with(&table, sets).map(Some)
    }

    /// Bulk UPDATE from a model's fields.
    ///
    /// A field takes part when it is projected or its value is non-zero. A
    /// zero value that is not projected is skipped, so setting a column back
    /// to its zero value requires selecting it explicitly.
    pub fn update_model_stmt<M: Model>(&self, model: &M) -> Result<Option<Fragment>> {
        let entity = self.entity::<M>();
        let record = model.to_record()?;
        let sets: Vec<Fragment> = entity
            .properties(&record)
            .into_iter()
            .filter(|p| !is_key_field(&p.name))
            .filter(|p| self.scope.is_projected(&p.name) || !p.is_zero())
            .map(|p| {
                let mut set = Fragment::raw(format!("{} = ", self.dialect().quote(&p.name)));
                set.push_bind(p.arg());
                set
            })
            .collect();
        if sets.is_empty() {
            return Ok(None);
        }
        self.update_with(entity.name(), sets).map(Some)
    }

    fn key_list<M: Model>(&self, entity: &Entity, models: &[M]) -> Result<Vec<Value>> {
        models
            .iter()
            .map(|m| match m.key() {
                Some(key) if !key.is_incomplete() => Ok(Value::String(key.encode())),
                _ => Err(Error::IncompleteKey {
                    kind: entity.kind().to_string(),
                }),
            })
            .collect()
    }

    /// Soft (when supported and requested) or hard delete of the given rows
    pub fn delete_stmt<M: Model>(
        &self,
        entity: &Entity,
        models: &[M],
        soft: bool,
    ) -> Result<Option<Fragment>> {
        if models.is_empty() {
            return Ok(None);
        }
        let keys = self.key_list(entity, models)?;
        let table = self.dialect().table(entity.name());
        let pk = self.dialect().quote(PK_COLUMN);

        let mut out = if soft && entity.has_soft_delete() {
            let mut f = Fragment::raw(format!(
                "UPDATE {} SET {} = ",
                table,
                self.dialect().quote(SOFT_DELETE_COLUMN)
            ));
            f.push_bind(Utc::now().trunc_subsecs(0));
            f
        } else {
            Fragment::raw(format!("DELETE FROM {}", table))
        };
        out.push_str(&format!(" WHERE {} IN ", pk));
        out.push_bind_list(keys);
        out.push_str(";");
        Ok(Some(out))
    }

    /// DELETE of every row matching the scope
    pub fn delete_by_query_stmt(&self) -> Result<Fragment> {
        let table = self.table_name()?;
        let mut out = Fragment::raw(format!("DELETE FROM {}", self.dialect().table(&table)));
        out.append(self.mutation_tail(&table)?);
        out.push_str(";");
        Ok(out)
    }

    /// Copy rows matching the scope into `destination`
    pub fn replace_into_stmt(&self, destination: &str) -> Result<Fragment> {
        let keyword = self.dialect().replace_into().ok_or(Error::Unsupported {
            feature: "replace into",
            dialect: self.dialect().name(),
        })?;
        let source = self.table_name()?;
        let mut out = Fragment::raw(format!(
            "{} {} {} FROM {}",
            keyword,
            self.dialect().table(destination),
            self.select_clause(&self.scope),
            self.dialect().table(&source)
        ));
        out.append(self.where_clause(&self.scope, None)?);
        out.push_str(";");
        Ok(out)
    }

    /// SELECT over the scope's table, without entity metadata
    pub fn scan_stmt(&self) -> Result<Fragment> {
        let table = self.table_name()?;
        let mut out = Fragment::raw(self.select_clause(&self.scope));
        out.push_str(" FROM ");
        out.push_str(&self.dialect().table(&table));
        out.append(self.tail(&self.scope, None)?);
        out.push_str(";");
        Ok(out)
    }

    pub fn count_stmt(&self, entity: &Entity) -> Result<Fragment> {
        let scope = self.scoped(entity);
        let mut out = Fragment::raw(format!(
            "SELECT COUNT(*) FROM {}",
            self.dialect().table(entity.name())
        ));
        out.append(self.where_clause(&scope, None)?);
        out.push_str(";");
        Ok(out)
    }

    /// Validated table names for truncation
    pub fn truncate_stmts(&self, tables: &[&str]) -> Result<Vec<Fragment>> {
        tables
            .iter()
            .map(|t| {
                let t = t.trim();
                if t.is_empty() {
                    return Err(Error::MissingTable);
                }
                Ok(Fragment::raw(self.dialect().truncate(t)))
            })
            .collect()
    }

    /// Scope prepared for one page: key tiebreaker and one extra row
    fn page_scope(&self, entity: &Entity, page: &Pagination) -> Scope {
        let mut scope = self.scoped(entity);
        if !scope.orders.iter().any(|o| is_key_field(&o.field)) {
            scope.orders.push(Order::asc(PK_COLUMN));
        }
        scope.limit = page.page_size() + 1;
        scope.offset = 0;
        scope
    }

    /// Keyset predicate selecting rows strictly after `values` in the
    /// scope's order.
    ///
    /// NULL order values are placed where the engine sorts them, so rows
    /// with NULLs are neither skipped nor repeated.
    pub fn keyset_clause(&self, orders: &[Order], values: &[Value]) -> Fragment {
        let nulls_low = self.dialect().nulls_sort_low();
        let branches: Vec<Fragment> = (0..orders.len())
            .filter_map(|i| {
                let mut terms = Vec::with_capacity(i + 1);
                for (order, value) in orders[..i].iter().zip(values) {
                    let column = self.column(&order.field);
                    terms.push(if value.is_null() {
                        Fragment::raw(format!("{} IS NULL", column))
                    } else {
                        let mut eq = Fragment::raw(format!("{} = ", column));
                        eq.push_bind(value.clone());
                        eq
                    });
                }
                let column = self.column(&orders[i].field);
                let (op, nulls_first) = match orders[i].direction {
                    Direction::Ascending => (">", nulls_low),
                    Direction::Descending => ("<", !nulls_low),
                };
                let nullable = !is_key_field(&orders[i].field);
                let value = values.get(i).cloned().unwrap_or_default();
                if value.is_null() {
                    // nothing sorts after NULL when NULLs come last
                    if !nulls_first {
                        return None;
                    }
                    terms.push(Fragment::raw(format!("{} IS NOT NULL", column)));
                } else {
                    let mut cmp = Fragment::raw(format!("{} {} ", column, op));
                    cmp.push_bind(value);
                    if nullable && !nulls_first {
                        cmp.push_str(&format!(" OR {} IS NULL", column));
                        if i > 0 {
                            cmp = cmp.parenthesized();
                        }
                    }
                    terms.push(cmp);
                }
                Some(Fragment::join(terms, " AND ").parenthesized())
            })
            .collect();
        if branches.is_empty() {
            return Fragment::raw("1 = 0");
        }
        Fragment::join(branches, " OR ").parenthesized()
    }

    /// Values of the ordered fields at the cursor row
    fn cursor_values(&self, entity: &Entity, orders: &[Order], key: &Key) -> Result<Vec<Value>> {
        let fields = orders
            .iter()
            .map(|o| self.column(&o.field))
            .collect::<Vec<_>>()
            .join(",");
        let mut lookup = Fragment::raw(format!(
            "SELECT {} FROM {} WHERE {} = ",
            fields,
            self.dialect().table(entity.name()),
            self.dialect().quote(PK_COLUMN)
        ));
        lookup.push_bind(key.encode());
        lookup.push_str(&self.dialect().limit_offset(1, 0));
        lookup.push_str(";");

        let rows = self.db.query_stmt(&mut self.statement(lookup))?;
        let row = rows.rows.into_iter().next().ok_or(Error::InvalidCursor)?;
        Ok(row.iter().map(Value::to_filter_value).collect())
    }

    // ----- execution -----

    fn exec(&self, fragment: Fragment) -> Result<ExecResult> {
        self.db.exec_stmt(&mut self.statement(fragment))
    }

    fn run(&self, table: &str, fragment: Fragment) -> Result<ResultSet> {
        let rows = self.db.query_stmt(&mut self.statement(fragment))?;
        Ok(ResultSet::new(table, rows))
    }

    pub fn put<M: Model>(&self, models: &mut [M], parent: Option<&Key>) -> Result<()> {
        let entity = self.entity::<M>();
        if let Some(stmt) = self.insert_stmt(&entity, models, parent)? {
            self.exec(stmt)?;
        }
        Ok(())
    }

    pub fn upsert<M: Model>(&self, models: &mut [M], parent: Option<&Key>) -> Result<()> {
        let entity = self.entity::<M>();
        if let Some(stmt) = self.upsert_stmt(&entity, models, parent)? {
            self.exec(stmt)?;
        }
        Ok(())
    }

    pub fn save<M: Model>(&self, model: &mut M) -> Result<()> {
        let entity = self.entity::<M>();
        if let Some(stmt) = self.save_stmt(&entity, model)? {
            self.exec(stmt)?;
        }
        Ok(())
    }

    pub fn update_map(&self, values: &BTreeMap<String, Value>) -> Result<u64> {
        match self.update_map_stmt(values)? {
            Some(stmt) => Ok(self.exec(stmt)?.rows_affected),
            None => Ok(0),
        }
    }

    pub fn update_model<M: Model>(&self, model: &M) -> Result<u64> {
        match self.update_model_stmt(model)? {
            Some(stmt) => Ok(self.exec(stmt)?.rows_affected),
            None => Ok(0),
        }
    }

    pub fn delete<M: Model>(&self, models: &[M], soft: bool) -> Result<u64> {
        let entity = self.entity::<M>();
        match self.delete_stmt(&entity, models, soft)? {
            Some(stmt) => Ok(self.exec(stmt)?.rows_affected),
            None => Ok(0),
        }
    }

    pub fn delete_by_query(&self) -> Result<u64> {
        let stmt = self.delete_by_query_stmt()?;
        Ok(self.exec(stmt)?.rows_affected)
    }

    pub fn replace_into(&self, destination: &str) -> Result<u64> {
        let stmt = self.replace_into_stmt(destination)?;
        Ok(self.exec(stmt)?.rows_affected)
    }

    /// Truncate tables in order, stopping at the first failure
    pub fn truncate(&self, tables: &[&str]) -> Result<()> {
        for stmt in self.truncate_stmts(tables)? {
            self.exec(stmt)?;
        }
        Ok(())
    }

    /// Decoded rows matching the scope
    pub fn fetch<M: Model>(&self) -> Result<ResultSet> {
        let entity = self.entity::<M>();
        let stmt = self.select_stmt(&entity)?;
        self.run(entity.name(), stmt)
    }

    pub fn get<M: Model>(&self) -> Result<Vec<M>> {
        self.fetch::<M>()?.collect()
    }

    /// First matching row; `NotFound` when `must_exist` and nothing matched
    pub fn first<M: Model>(&self, must_exist: bool) -> Result<Option<M>> {
        let mut set = self.fetch::<M>()?;
        if set.first().is_none() {
            return if must_exist { Err(Error::NotFound) } else { Ok(None) };
        }
        set.scan().map(Some)
    }

    /// One raw row of the scope's table
    pub fn scan(&self) -> Result<Record> {
        let table = self.table_name()?;
        let stmt = self.scan_stmt()?;
        let mut set = self.run(&table, stmt)?;
        set.first().cloned().ok_or(Error::NotFound)
    }

    pub fn count<M: Model>(&self) -> Result<u64> {
        let entity = self.entity::<M>();
        let stmt = self.count_stmt(&entity)?;
        let rows = self.db.query_stmt(&mut self.statement(stmt))?;
        Ok(rows.scalar().and_then(Value::as_u64).unwrap_or(0))
    }

    /// One page of results in key-stable order
    pub fn paginate<M: Model>(&self, page: &mut Pagination) -> Result<Vec<M>> {
        let entity = self.entity::<M>();
        let scope = self.page_scope(&entity, page);
        let base = self.select_with(&entity, &scope, None)?;
        let signature = sign(&self.statement(base.clone()).to_string());

        let stmt = match page.cursor.as_deref() {
            None => base,
            Some(token) => {
                let cursor = Cursor::decode(token)?;
                if cursor.signature != signature {
                    return Err(Error::InvalidCursor);
                }
                let values = self.cursor_values(&entity, &scope.orders, &cursor.key)?;
                let after = self.keyset_clause(&scope.orders, &values);
                self.select_with(&entity, &scope, Some(after))?
            }
        };

        let mut set = self.run(entity.name(), stmt)?.with_signature(signature.clone());
        let size = page.page_size() as usize;
        let next = if set.len() > size {
            set.truncate(size);
            set.records()
                .last()
                .and_then(Record::key)
                .map(|key| Cursor::new(signature, key))
        } else {
            None
        };
        debug!(table = entity.name(), rows = set.len(), has_next = next.is_some(), "paginated");
        page.set_page(set.len(), next);
        set.collect()
    }

    /// Create each entity's table, or alter it to match when present
    pub fn migrate(&self, entities: &[Entity]) -> Result<()> {
        for entity in entities {
            let statements = if self.db.has_table(entity.name())? {
                let existing = self.db.table_info(entity.name())?;
                info!(table = entity.name(), "altering table");
                self.dialect().alter_table(
                    entity.name(),
                    entity.columns(),
                    &existing,
                    self.db.charset(),
                )
            } else {
                info!(table = entity.name(), "creating table");
                self.dialect()
                    .create_table(entity.name(), entity.columns(), self.db.charset())
            };
            for stmt in statements {
                self.exec(stmt)?;
            }
        }
        Ok(())
    }

    /// Create an index over `columns` unless it already exists
    pub fn add_index(&self, columns: &[&str], unique: bool) -> Result<()> {
        let table = self.table_name()?;
        let name = index_name(&table, columns, unique);
        if self.db.table_info(&table)?.has_index(&name) {
            debug!(table = %table, index = %name, "index exists");
            return Ok(());
        }
        let sql = self.dialect().create_index(&table, &name, columns, unique);
        self.exec(Fragment::raw(sql)).map(|_| ())
    }

    pub fn drop_table_if_exists(&self) -> Result<()> {
        let table = self.table_name()?;
        let sql = self.dialect().drop_table_if_exists(&table);
        self.exec(Fragment::raw(sql)).map(|_| ())
    }
}

/// Filter value for the key column, converted through the key codec
fn key_arg(value: &Value) -> Result<Value> {
    match value {
        Value::Null => Ok(Value::Null),
        Value::Key(key) => Ok(Value::String(key.encode())),
        Value::String(s) => Ok(Value::String(s.clone())),
        Value::Bytes(b) => Ok(Value::String(String::from_utf8_lossy(b).into_owned())),
        Value::List(items) => items.iter().map(key_arg).collect::<Result<Vec<_>>>().map(Value::List),
        other => Err(Error::UnsupportedType {
            operation: "key filter",
            data_type: other.type_name(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::{MySql, Postgres, Sqlite};
    use crate::model::{Column, ColumnType};
    use crate::scope::LockMode;
    use crate::test_utils::MockConnection;

    #[derive(Debug, Clone, Default, PartialEq)]
    struct User {
        key: Option<Key>,
        name: String,
        age: i64,
    }

    impl Model for User {
        fn kind() -> &'static str {
            "User"
        }

        fn columns() -> Vec<Column> {
            vec![
                Column::new("Name", ColumnType::String),
                Column::new("Age", ColumnType::Int),
            ]
        }

        fn key(&self) -> Option<&Key> {
            self.key.as_ref()
        }

        fn set_key(&mut self, key: Key) -> Result<()> {
            self.key = Some(key);
            Ok(())
        }

        fn to_record(&self) -> Result<Record> {
            Ok(Record::new().with("Name", &self.name).with("Age", self.age))
        }

        fn from_record(record: &Record) -> Result<Self> {
            Ok(Self {
                key: record.key(),
                name: record.get_as("Name")?,
                age: record.get_as("Age")?,
            })
        }
    }

    #[derive(Debug, Clone, Default)]
    struct Post {
        key: Option<Key>,
        title: String,
    }

    impl Model for Post {
        fn kind() -> &'static str {
            "Post"
        }

        fn columns() -> Vec<Column> {
            vec![Column::new("Title", ColumnType::String), Column::soft_delete()]
        }

        fn key(&self) -> Option<&Key> {
            self.key.as_ref()
        }

        fn set_key(&mut self, key: Key) -> Result<()> {
            self.key = Some(key);
            Ok(())
        }

        fn to_record(&self) -> Result<Record> {
            Ok(Record::new().with("Title", &self.title))
        }

        fn from_record(record: &Record) -> Result<Self> {
            Ok(Self {
                key: record.key(),
                title: record.get_as("Title")?,
            })
        }
    }

    fn builder(dialect: Arc<dyn Dialect>, scope: Scope) -> Builder {
        let db = Db::new(dialect.name(), "test", Arc::new(MockConnection::new()), dialect);
        Builder::new(db, scope)
    }

    fn sqlite(scope: Scope) -> Builder {
        builder(Arc::new(Sqlite), scope)
    }

    #[test]
    fn test_select_example() {
        let scope = Scope {
            table: Some("User".into()),
            filters: vec![Filter::new("Age", Operator::GreaterThan, 18)],
            orders: vec![Order::asc("Name")],
            limit: 10,
            ..Default::default()
        };
        let b = sqlite(scope);
        let stmt = b.select_stmt(&b.entity::<User>()).unwrap();
        assert_eq!(
            stmt.to_string(),
            "SELECT * FROM \"User\" WHERE \"Age\" > ? ORDER BY \"Name\" ASC LIMIT 10;"
        );
        assert_eq!(stmt.args(), &[Value::Int(18)]);
    }

    #[test]
    fn test_soft_delete_filter_presence() {
        let b = sqlite(Scope::default());
        let posts = b.select_stmt(&b.entity::<Post>()).unwrap();
        assert_eq!(
            posts.to_string(),
            "SELECT * FROM \"Post\" WHERE \"$Deleted\" IS NULL;"
        );
        let users = b.select_stmt(&b.entity::<User>()).unwrap();
        assert_eq!(users.to_string(), "SELECT * FROM \"User\";");

        let b = sqlite(Scope {
            unscoped: true,
            ..Default::default()
        });
        let posts = b.select_stmt(&b.entity::<Post>()).unwrap();
        assert_eq!(posts.to_string(), "SELECT * FROM \"Post\";");
    }

    #[test]
    fn test_in_renders_placeholder_list() {
        let b = sqlite(Scope {
            filters: vec![Filter::new("Age", Operator::In, vec![1, 2, 3])],
            ..Default::default()
        });
        let stmt = b.select_stmt(&b.entity::<User>()).unwrap();
        assert_eq!(
            stmt.to_string(),
            "SELECT * FROM \"User\" WHERE \"Age\" IN (?,?,?);"
        );
        assert_eq!(stmt.args(), &[Value::Int(1), Value::Int(2), Value::Int(3)]);
    }

    #[test]
    fn test_empty_lists_fail_before_any_statement() {
        for op in [Operator::In, Operator::NotIn, Operator::AnyLike] {
            let b = sqlite(Scope {
                filters: vec![Filter::new("Name", op, Vec::<String>::new())],
                ..Default::default()
            });
            assert_eq!(
                b.select_stmt(&b.entity::<User>()),
                Err(Error::EmptyValueList { op })
            );
        }
    }

    #[test]
    fn test_null_comparisons() {
        let b = sqlite(Scope {
            filters: vec![
                Filter::new("Name", Operator::Equal, Value::Null),
                Filter::new("Age", Operator::NotEqual, Value::Null),
                Filter::new("Age", Operator::EqualTo, Value::Null),
            ],
            ..Default::default()
        });
        let stmt = b.select_stmt(&b.entity::<User>()).unwrap();
        assert_eq!(
            stmt.to_string(),
            "SELECT * FROM \"User\" WHERE \"Name\" IS NULL AND \"Age\" IS NOT NULL AND \"Age\" IS ?;"
        );
        assert_eq!(stmt.args(), &[Value::Null]);
    }

    #[test]
    fn test_any_like_and_ancestors() {
        let root = Key::id("Org", 1, None);
        let other = Key::name("Org", "acme", None);
        let b = sqlite(Scope {
            filters: vec![Filter::new("Name", Operator::AnyLike, vec!["a%", "b%"])],
            ancestors: vec![
                Ancestor::One(root.clone()),
                Ancestor::AnyOf(vec![root, other]),
            ],
            ..Default::default()
        });
        let stmt = b.select_stmt(&b.entity::<User>()).unwrap();
        assert_eq!(
            stmt.to_string(),
            "SELECT * FROM \"User\" WHERE (\"Name\" LIKE ? OR \"Name\" LIKE ?) \
             AND \"$Key\" LIKE ? ESCAPE '\\' \
             AND (\"$Key\" LIKE ? ESCAPE '\\' OR \"$Key\" LIKE ? ESCAPE '\\');"
        );
        assert_eq!(stmt.args()[2], Value::from("Org,1/%"));
        assert_eq!(stmt.args()[4], Value::from("Org,'acme'/%"));
    }

    #[test]
    fn test_key_field_folds_to_pk_column() {
        let key = Key::id("User", 5, None);
        let b = sqlite(Scope {
            filters: vec![Filter::new("__key__", Operator::Equal, &key)],
            orders: vec![Order::desc("__key__")],
            ..Default::default()
        });
        let stmt = b.select_stmt(&b.entity::<User>()).unwrap();
        assert_eq!(
            stmt.to_string(),
            "SELECT * FROM \"User\" WHERE \"$Key\" = ? ORDER BY \"$Key\" DESC;"
        );
        assert_eq!(stmt.args(), &[Value::from("User,5")]);

        let b = sqlite(Scope {
            filters: vec![Filter::new("__key__", Operator::Equal, 5)],
            ..Default::default()
        });
        assert!(matches!(
            b.select_stmt(&b.entity::<User>()),
            Err(Error::UnsupportedType { .. })
        ));
    }

    #[test]
    fn test_projection_and_distinct() {
        let b = sqlite(Scope {
            projection: vec!["Name".into(), "COUNT(*)".into(), "t.Age".into()],
            ..Default::default()
        });
        assert_eq!(
            b.select_clause(b.scope()),
            "SELECT \"Name\",COUNT(*),\"t\".\"Age\""
        );

        let b = sqlite(Scope {
            projection: vec!["Name".into()],
            distinct_on: vec!["Age".into()],
            ..Default::default()
        });
        assert_eq!(b.select_clause(b.scope()), "SELECT DISTINCT \"Age\"");
    }

    #[test]
    fn test_lock_clause_follows_limit() {
        let b = builder(
            Arc::new(MySql),
            Scope {
                limit: 1,
                lock_mode: LockMode::Write,
                ..Default::default()
            },
        );
        let stmt = b.select_stmt(&b.entity::<User>()).unwrap();
        assert_eq!(stmt.to_string(), "SELECT * FROM `User` LIMIT 1 FOR UPDATE;");
    }

    #[test]
    fn test_insert_assigns_keys_and_runs_hooks() {
        let b = sqlite(Scope::default());
        let mut users = vec![
            User {
                name: "ann".into(),
                age: 30,
                ..Default::default()
            },
            User {
                key: Some(Key::name("User", "bob", None)),
                name: "bob".into(),
                ..Default::default()
            },
        ];
        let stmt = b
            .insert_stmt(&b.entity::<User>(), &mut users, None)
            .unwrap()
            .unwrap();
        assert_eq!(
            stmt.to_string(),
            "INSERT INTO \"User\" (\"$Key\",\"Name\",\"Age\") VALUES (?,?,?),(?,?,?);"
        );
        assert!(users[0].key.as_ref().is_some_and(|k| !k.is_incomplete()));
        assert_eq!(stmt.args()[3], Value::from("User,'bob'"));
        assert_eq!(stmt.args()[4], Value::from("bob"));
    }

    #[test]
    fn test_insert_under_parent() {
        let parent = Key::id("Org", 7, None);
        let b = sqlite(Scope::default());
        let mut users = vec![User::default()];
        b.insert_stmt(&b.entity::<User>(), &mut users, Some(&parent))
            .unwrap();
        let key = users[0].key.clone().unwrap();
        assert_eq!(key.parent(), Some(&parent));
        assert_eq!(key.kind(), "User");
    }

    #[test]
    fn test_insert_nothing() {
        let b = sqlite(Scope::default());
        let mut users: Vec<User> = vec![];
        assert_eq!(
            b.insert_stmt(&b.entity::<User>(), &mut users, None).unwrap(),
            None
        );
    }

    #[test]
    fn test_upsert_never_updates_key() {
        let b = builder(Arc::new(MySql), Scope::default());
        let mut users = vec![User::default()];
        let stmt = b
            .upsert_stmt(&b.entity::<User>(), &mut users, None)
            .unwrap()
            .unwrap();
        let sql = stmt.to_string();
        assert!(sql.ends_with(
            " ON DUPLICATE KEY UPDATE `Name`=VALUES(`Name`),`Age`=VALUES(`Age`);"
        ));

        let b = builder(
            Arc::new(Postgres),
            Scope {
                omits: vec!["Name".into(), "Age".into()],
                ..Default::default()
            },
        );
        let stmt = b
            .upsert_stmt(&b.entity::<User>(), &mut users, None)
            .unwrap()
            .unwrap();
        assert!(stmt.to_string().ends_with(" ON CONFLICT (\"$Key\") DO NOTHING;"));
    }

    #[test]
    fn test_save_requires_complete_key() {
        let b = sqlite(Scope::default());
        let entity = b.entity::<User>();

        let mut user = User::default();
        assert_eq!(
            b.save_stmt(&entity, &mut user),
            Err(Error::InvalidKey { key: "nil".into() })
        );

        user.key = Some(Key::incomplete("User", None));
        assert!(matches!(
            b.save_stmt(&entity, &mut user),
            Err(Error::InvalidKey { .. })
        ));

        user.key = Some(Key::id("User", 3, None));
        user.name = "cat".into();
        let stmt = b.save_stmt(&entity, &mut user).unwrap().unwrap();
        assert_eq!(
            stmt.to_string(),
            "UPDATE \"User\" SET \"Name\" = ?,\"Age\" = ? WHERE \"$Key\" = ?;"
        );
        assert_eq!(stmt.args()[2], Value::from("User,3"));
    }

    #[test]
    fn test_update_map_rejects_key() {
        let b = sqlite(Scope::new("User"));
        let mut values = BTreeMap::new();
        values.insert("__key__".to_string(), Value::from("User,1"));
        assert_eq!(b.update_map_stmt(&values), Err(Error::KeyUpdateNotAllowed));

        let values = BTreeMap::new();
        assert_eq!(b.update_map_stmt(&values).unwrap(), None);
    }

    #[test]
    fn test_sparse_update_rule() {
        let user = User {
            name: "ann".into(),
            age: 0,
            ..Default::default()
        };

        let b = sqlite(Scope::new("User"));
        let stmt = b.update_model_stmt(&user).unwrap().unwrap();
        assert_eq!(stmt.to_string(), "UPDATE \"User\" SET \"Name\" = ?;");

        let b = sqlite(Scope {
            table: Some("User".into()),
            projection: vec!["Age".into()],
            ..Default::default()
        });
        let stmt = b.update_model_stmt(&user).unwrap().unwrap();
        assert_eq!(
            stmt.to_string(),
            "UPDATE \"User\" SET \"Name\" = ?,\"Age\" = ?;"
        );
        assert_eq!(stmt.args()[1], Value::Int(0));
    }

    #[test]
    fn test_update_limit_fallback() {
        let scope = Scope {
            table: Some("User".into()),
            filters: vec![Filter::new("Age", Operator::LessThan, 10)],
            orders: vec![Order::asc("Age")],
            limit: 5,
            ..Default::default()
        };
        let mut values = BTreeMap::new();
        values.insert("Age".to_string(), Value::Int(10));

        let stmt = builder(Arc::new(MySql), scope.clone())
            .update_map_stmt(&values)
            .unwrap()
            .unwrap();
        assert_eq!(
            stmt.to_string(),
            "UPDATE `User` SET `Age` = ? WHERE `Age` < ? ORDER BY `Age` ASC LIMIT 5;"
        );

        let stmt = sqlite(scope).update_map_stmt(&values).unwrap().unwrap();
        assert_eq!(
            stmt.to_string(),
            "UPDATE \"User\" SET \"Age\" = ? WHERE \"$Key\" IN (SELECT \"$Key\" FROM \"User\" \
             WHERE \"Age\" < ? ORDER BY \"Age\" ASC LIMIT 5);"
        );
        assert_eq!(stmt.args(), &[Value::Int(10), Value::Int(10)]);
    }

    #[test]
    fn test_soft_delete_two_keys() {
        let b = sqlite(Scope::default());
        let posts = vec![
            Post {
                key: Some(Key::id("Post", 1, None)),
                ..Default::default()
            },
            Post {
                key: Some(Key::id("Post", 2, None)),
                ..Default::default()
            },
        ];
        let stmt = b
            .delete_stmt(&b.entity::<Post>(), &posts, true)
            .unwrap()
            .unwrap();
        assert_eq!(
            stmt.to_string(),
            "UPDATE \"Post\" SET \"$Deleted\" = ? WHERE \"$Key\" IN (?,?);"
        );
        assert!(matches!(stmt.args()[0], Value::Time(_)));
        assert_eq!(stmt.args()[1..], [Value::from("Post,1"), Value::from("Post,2")]);

        let stmt = b
            .delete_stmt(&b.entity::<Post>(), &posts, false)
            .unwrap()
            .unwrap();
        assert_eq!(
            stmt.to_string(),
            "DELETE FROM \"Post\" WHERE \"$Key\" IN (?,?);"
        );
    }

    #[test]
    fn test_delete_without_soft_delete_column_is_hard() {
        let b = sqlite(Scope::default());
        let users = vec![User {
            key: Some(Key::id("User", 1, None)),
            ..Default::default()
        }];
        let stmt = b
            .delete_stmt(&b.entity::<User>(), &users, true)
            .unwrap()
            .unwrap();
        assert!(stmt.to_string().starts_with("DELETE FROM \"User\""));
    }

    #[test]
    fn test_delete_incomplete_key() {
        let b = sqlite(Scope::default());
        let posts = vec![Post {
            key: Some(Key::incomplete("Post", None)),
            ..Default::default()
        }];
        assert_eq!(
            b.delete_stmt(&b.entity::<Post>(), &posts, true),
            Err(Error::IncompleteKey {
                kind: "Post".into()
            })
        );
    }

    #[test]
    fn test_delete_by_query_requires_table() {
        assert_eq!(
            sqlite(Scope::default()).delete_by_query_stmt(),
            Err(Error::MissingTable)
        );
        let stmt = sqlite(Scope {
            table: Some("User".into()),
            filters: vec![Filter::new("Age", Operator::GreaterEqual, 99)],
            ..Default::default()
        })
        .delete_by_query_stmt()
        .unwrap();
        assert_eq!(stmt.to_string(), "DELETE FROM \"User\" WHERE \"Age\" >= ?;");
    }

    #[test]
    fn test_replace_into_unsupported_on_postgres() {
        let b = builder(Arc::new(Postgres), Scope::new("User"));
        assert_eq!(
            b.replace_into_stmt("Archive"),
            Err(Error::Unsupported {
                feature: "replace into",
                dialect: "postgres"
            })
        );

        let b = builder(Arc::new(MySql), Scope::new("User"));
        assert_eq!(
            b.replace_into_stmt("Archive").unwrap().to_string(),
            "REPLACE INTO `Archive` SELECT * FROM `User`;"
        );
    }

    #[test]
    fn test_truncate_validates_all_names_first() {
        let b = builder(Arc::new(MySql), Scope::default());
        assert_eq!(b.truncate_stmts(&["A", " "]), Err(Error::MissingTable));
        let stmts = b.truncate_stmts(&["A", "B"]).unwrap();
        assert_eq!(stmts[1].text(), "TRUNCATE TABLE `B`;");
    }

    #[test]
    fn test_keyset_clause() {
        let b = sqlite(Scope::default());
        let orders = vec![Order::desc("Age"), Order::asc("$Key")];
        let clause = b.keyset_clause(&orders, &[Value::Int(30), Value::from("User,9")]);
        assert_eq!(
            clause.to_string(),
            "((\"Age\" < ? OR \"Age\" IS NULL) OR (\"Age\" = ? AND \"$Key\" > ?))"
        );
        assert_eq!(
            clause.args(),
            &[Value::Int(30), Value::Int(30), Value::from("User,9")]
        );
    }

    #[test]
    fn test_keyset_clause_null_cursor_value() {
        let orders = vec![Order::asc("Age"), Order::asc("$Key")];
        let values = [Value::Null, Value::from("User,9")];

        let clause = sqlite(Scope::default()).keyset_clause(&orders, &values);
        assert_eq!(
            clause.to_string(),
            "((\"Age\" IS NOT NULL) OR (\"Age\" IS NULL AND \"$Key\" > ?))"
        );
        assert_eq!(clause.args(), &[Value::from("User,9")]);

        let clause = builder(Arc::new(Postgres), Scope::default()).keyset_clause(&orders, &values);
        assert_eq!(
            clause.to_string(),
            "((\"Age\" IS NULL AND \"$Key\" > ?))"
        );
    }

    #[test]
    fn test_keyset_clause_nulls_last() {
        let b = builder(Arc::new(Postgres), Scope::default());
        let orders = vec![Order::asc("Age"), Order::asc("$Key")];
        let clause = b.keyset_clause(&orders, &[Value::Int(30), Value::from("User,9")]);
        assert_eq!(
            clause.to_string(),
            "((\"Age\" > ? OR \"Age\" IS NULL) OR (\"Age\" = ? AND \"$Key\" > ?))"
        );
        assert_eq!(
            b.keyset_clause(&[Order::asc("Age")], &[Value::Null]).to_string(),
            "1 = 0"
        );
    }

    #[test]
    fn test_page_scope_adds_key_tiebreak() {
        let b = sqlite(Scope {
            orders: vec![Order::asc("Name")],
            ..Default::default()
        });
        let scope = b.page_scope(&b.entity::<User>(), &Pagination::new(20));
        assert_eq!(scope.orders.len(), 2);
        assert_eq!(scope.orders[1].field, PK_COLUMN);
        assert_eq!(scope.limit, 21);
    }
}
