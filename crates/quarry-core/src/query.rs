//! Fluent query construction over a [`Db`]
//!
//! Every setter consumes and returns the query, so chains read left to
//! right. Errors raised while building (an unparsable operator string) are
//! held back and reported by the terminal call.

use crate::builder::Builder;
use crate::cursor::Pagination;
use crate::db::Db;
use crate::error::{Error, Result};
use crate::filter::{Filter, Operator};
use crate::key::Key;
use crate::model::Model;
use crate::record::{Record, ResultSet};
use crate::scope::{Ancestor, LockMode, Order, Scope};
use crate::value::Value;
use std::collections::BTreeMap;

/// Query under construction
#[derive(Debug, Clone)]
pub struct Query {
    db: Db,
    scope: Scope,
    error: Option<Error>,
}

impl Query {
    pub fn new(db: Db, scope: Scope) -> Self {
        Self {
            db,
            scope,
            error: None,
        }
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    /// Restrict the SELECT list, or name the fields an update must write.
    ///
    /// Plain and dotted identifiers are quoted. Any other entry, such as
    /// `COUNT(*)`, is written into the SQL verbatim and must be trusted input.
    pub fn select<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scope.projection.extend(fields.into_iter().map(Into::into));
        self
    }

    /// `SELECT DISTINCT` over `fields`; entries are quoted like [`Query::select`]
    pub fn distinct_on<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scope.distinct_on.extend(fields.into_iter().map(Into::into));
        self
    }

    pub fn omit<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scope.omits.extend(fields.into_iter().map(Into::into));
        self
    }

    /// Include soft-deleted rows
    pub fn unscoped(mut self) -> Self {
        self.scope.unscoped = true;
        self
    }

    /// Only rows below `key`
    pub fn ancestor(mut self, key: Key) -> Self {
        self.scope.ancestors.push(Ancestor::One(key));
        self
    }

    /// Only rows below any of `keys`
    pub fn any_of_ancestor(mut self, keys: impl IntoIterator<Item = Key>) -> Self {
        self.scope
            .ancestors
            .push(Ancestor::AnyOf(keys.into_iter().collect()));
        self
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.scope.filters.push(filter);
        self
    }

    fn push(self, field: &str, op: Operator, value: impl Into<Value>) -> Self {
        self.filter(Filter::new(field, op, value))
    }

    /// Filter with an operator given as text (`">="`, `"not in"`, ...)
    pub fn where_op(mut self, field: &str, op: &str, value: impl Into<Value>) -> Self {
        match op.parse::<Operator>() {
            Ok(op) => self.push(field, op, value),
            Err(err) => {
                self.error.get_or_insert(err);
                self
            }
        }
    }

    pub fn where_eq(self, field: &str, value: impl Into<Value>) -> Self {
        self.push(field, Operator::Equal, value)
    }

    pub fn where_ne(self, field: &str, value: impl Into<Value>) -> Self {
        self.push(field, Operator::NotEqual, value)
    }

    pub fn where_in(self, field: &str, values: impl Into<Value>) -> Self {
        self.push(field, Operator::In, values)
    }

    pub fn where_not_in(self, field: &str, values: impl Into<Value>) -> Self {
        self.push(field, Operator::NotIn, values)
    }

    pub fn where_like(self, field: &str, pattern: impl Into<String>) -> Self {
        self.push(field, Operator::Like, pattern.into())
    }

    /// Match when any of the patterns matches
    pub fn where_any_like(self, field: &str, patterns: impl Into<Value>) -> Self {
        self.push(field, Operator::AnyLike, patterns)
    }

    /// Document path equality; `field` is `column:path.to.value`
    pub fn where_json_eq(self, field: &str, value: impl Into<Value>) -> Self {
        self.push(field, Operator::JsonEqual, value)
    }

    pub fn where_json_ne(self, field: &str, value: impl Into<Value>) -> Self {
        self.push(field, Operator::JsonNotEqual, value)
    }

    pub fn where_json_in(self, field: &str, values: impl Into<Value>) -> Self {
        self.push(field, Operator::JsonIn, values)
    }

    pub fn where_json_not_in(self, field: &str, values: impl Into<Value>) -> Self {
        self.push(field, Operator::JsonNotIn, values)
    }

    /// Array at the path contains any of `values`
    pub fn where_json_contains_any(self, field: &str, values: impl Into<Value>) -> Self {
        self.push(field, Operator::JsonContainsAny, values)
    }

    pub fn where_json_type(self, field: &str, type_name: &str) -> Self {
        self.push(field, Operator::JsonType, type_name)
    }

    pub fn where_json_object(self, field: &str) -> Self {
        self.push(field, Operator::JsonIsObject, Value::Null)
    }

    pub fn where_json_array(self, field: &str) -> Self {
        self.push(field, Operator::JsonIsArray, Value::Null)
    }

    /// Sort by `"Field"` ascending or `"-Field"` descending
    pub fn order_by(mut self, text: &str) -> Self {
        self.scope.orders.push(Order::parse(text));
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.scope.limit = limit;
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.scope.offset = offset;
        self
    }

    pub fn lock_for_share(mut self) -> Self {
        self.scope.lock_mode = LockMode::Read;
        self
    }

    pub fn lock_for_update(mut self) -> Self {
        self.scope.lock_mode = LockMode::Write;
        self
    }

    fn builder(&self) -> Result<Builder> {
        match &self.error {
            Some(err) => Err(err.clone()),
            None => Ok(Builder::new(self.db.clone(), self.scope.clone())),
        }
    }

    // ----- terminal calls -----

    /// Raw result set for the model's table
    pub fn find<M: Model>(&self) -> Result<ResultSet> {
        self.builder()?.fetch::<M>()
    }

    /// Every matching row decoded into models
    pub fn get<M: Model>(&self) -> Result<Vec<M>> {
        self.builder()?.get()
    }

    /// First matching row, `NotFound` when nothing matched
    pub fn first<M: Model>(&self) -> Result<M> {
        let mut query = self.clone();
        query.scope.limit = 1;
        query.builder()?.first(true)?.ok_or(Error::NotFound)
    }

    pub fn paginate<M: Model>(&self, page: &mut Pagination) -> Result<Vec<M>> {
        self.builder()?.paginate(page)
    }

    pub fn count<M: Model>(&self) -> Result<u64> {
        self.builder()?.count::<M>()
    }

    /// One raw row of the bound table, `NotFound` when empty
    pub fn scan(&self) -> Result<Record> {
        self.builder()?.scan()
    }

    /// Set fields on every matching row; returns the affected row count
    pub fn update(&self, values: BTreeMap<String, Value>) -> Result<u64> {
        self.builder()?.update_map(&values)
    }

    /// Write a model's non-zero and selected fields to every matching row
    pub fn update_model<M: Model>(&self, model: &M) -> Result<u64> {
        self.builder()?.update_model(model)
    }

    /// Delete every matching row of the bound table
    pub fn delete(&self) -> Result<u64> {
        self.builder()?.delete_by_query()
    }

    /// Copy matching rows into `destination`
    pub fn replace_into(&self, destination: &str) -> Result<u64> {
        self.builder()?.replace_into(destination)
    }

    pub fn add_index(&self, columns: &[&str], unique: bool) -> Result<()> {
        self.builder()?.add_index(columns, unique)
    }

    pub fn drop_table_if_exists(&self) -> Result<()> {
        self.builder()?.drop_table_if_exists()
    }
}
