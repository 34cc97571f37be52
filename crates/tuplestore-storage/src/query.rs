//! Statement construction.
//!
//! Builders return a [`Statement`]: SQL text holding only fixed fragments and
//! placeholders, plus the parameters to bind in order. Caller-supplied values
//! never appear in the SQL text.

use chrono::{DateTime, Utc};

use crate::cursor::InsertionOrderId;
use crate::error::StorageResult;
use crate::traits::{PaginationOptions, TupleFilter, TupleKey, TupleOperation, UserType};

const TUPLE_COLUMNS: &str = "store, object_type, object_id, relation, _user, ulid, inserted_at";
const CHANGE_COLUMNS: &str = "object_type, object_id, relation, _user, operation, ulid, inserted_at";

/// Placeholder syntax of the target backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    /// Numbered placeholders: `$1`, `$2`, ...
    Postgres,
    /// Positional placeholders: `?`
    MySql,
}

/// A value bound to a placeholder.
#[derive(Debug, Clone, PartialEq)]
pub enum Param {
    Text(String),
    SmallInt(i16),
    Int(i64),
    Timestamp(DateTime<Utc>),
}

/// SQL text plus its bound parameters, in placeholder order.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    sql: String,
    params: Vec<Param>,
}

impl Statement {
    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn params(&self) -> &[Param] {
        &self.params
    }
}

/// Accumulates SQL fragments and bound parameters.
struct StatementBuilder {
    dialect: Dialect,
    sql: String,
    params: Vec<Param>,
}

impl StatementBuilder {
    fn new(dialect: Dialect, init: &str) -> Self {
        Self {
            dialect,
            sql: init.to_string(),
            params: Vec::new(),
        }
    }

    fn push(&mut self, fragment: &str) -> &mut Self {
        self.sql.push_str(fragment);
        self
    }

    fn push_bind(&mut self, param: Param) -> &mut Self {
        self.params.push(param);
        match self.dialect {
            Dialect::Postgres => {
                self.sql.push('$');
                self.sql.push_str(&self.params.len().to_string());
            }
            Dialect::MySql => self.sql.push('?'),
        }
        self
    }

    /// Appends ` AND {column} = <bind>`.
    fn and_eq(&mut self, column: &str, value: &str) -> &mut Self {
        self.push(" AND ")
            .push(column)
            .push(" = ")
            .push_bind(Param::Text(value.to_string()))
    }

    /// Appends ` VALUES (<bind>, ...)`.
    fn values(&mut self, params: Vec<Param>) -> &mut Self {
        self.push(" VALUES (");
        for (i, param) in params.into_iter().enumerate() {
            if i > 0 {
                self.push(", ");
            }
            self.push_bind(param);
        }
        self.push(")")
    }

    fn build(self) -> Statement {
        Statement {
            sql: self.sql,
            params: self.params,
        }
    }
}

fn apply_tuple_filters(builder: &mut StatementBuilder, filter: &TupleFilter) {
    if let Some(object_type) = filter.object_type() {
        builder.and_eq("object_type", object_type);
    }
    if let Some(object_id) = filter.object_id() {
        builder.and_eq("object_id", object_id);
    }
    if let Some(relation) = filter.relation() {
        builder.and_eq("relation", relation);
    }
    if let Some(user) = filter.user() {
        builder.and_eq("_user", user);
    }
}

fn apply_cursor(
    builder: &mut StatementBuilder,
    column: &str,
    pagination: &PaginationOptions,
) -> StorageResult<()> {
    if let Some(token) = &pagination.from {
        let position = token.position()?;
        builder
            .push(" AND ")
            .push(column)
            .push(" > ")
            .push_bind(Param::Text(position.as_str().to_string()));
    }
    Ok(())
}

/// Row count as a LIMIT parameter; sizes beyond `i64::MAX` clamp to it.
fn limit_param(rows: usize) -> Param {
    Param::Int(i64::try_from(rows).unwrap_or(i64::MAX))
}

/// Pages of `page_size` fetch one extra row to detect the last page.
fn apply_probe_limit(builder: &mut StatementBuilder, page_size: usize) {
    if page_size > 0 {
        builder
            .push(" LIMIT ")
            .push_bind(limit_param(page_size.saturating_add(1)));
    }
}

/// Tuples matching `filter`, ordered by insertion, after the cursor if any.
pub fn build_read_query(
    dialect: Dialect,
    store_id: &str,
    filter: &TupleFilter,
    pagination: &PaginationOptions,
) -> StorageResult<Statement> {
    let mut builder = StatementBuilder::new(
        dialect,
        &format!("SELECT {TUPLE_COLUMNS} FROM tuple WHERE store = "),
    );
    builder.push_bind(Param::Text(store_id.to_string()));
    apply_tuple_filters(&mut builder, filter);
    apply_cursor(&mut builder, "ulid", pagination)?;
    builder.push(" ORDER BY ulid");
    apply_probe_limit(&mut builder, pagination.page_size);
    Ok(builder.build())
}

/// Every tuple matching `filter` whose user is a userset reference.
pub fn build_read_userset_tuples_query(
    dialect: Dialect,
    store_id: &str,
    filter: &TupleFilter,
) -> Statement {
    let mut builder = StatementBuilder::new(
        dialect,
        &format!("SELECT {TUPLE_COLUMNS} FROM tuple WHERE store = "),
    );
    builder.push_bind(Param::Text(store_id.to_string()));
    builder.and_eq("user_type", UserType::Userset.as_str());
    apply_tuple_filters(&mut builder, filter);
    builder.push(" ORDER BY ulid");
    builder.build()
}

/// Change-log entries inserted before `horizon`.
///
/// There is no probe row here: change-log reads always hand back a cursor.
pub fn build_read_changes_query(
    dialect: Dialect,
    store_id: &str,
    object_type: Option<&str>,
    pagination: &PaginationOptions,
    horizon: DateTime<Utc>,
) -> StorageResult<Statement> {
    let mut builder = StatementBuilder::new(
        dialect,
        &format!("SELECT {CHANGE_COLUMNS} FROM changelog WHERE store = "),
    );
    builder.push_bind(Param::Text(store_id.to_string()));
    if let Some(object_type) = object_type.filter(|t| !t.is_empty()) {
        builder.and_eq("object_type", object_type);
    }
    builder
        .push(" AND inserted_at < ")
        .push_bind(Param::Timestamp(horizon));
    apply_cursor(&mut builder, "ulid", pagination)?;
    builder.push(" ORDER BY inserted_at, ulid");
    if pagination.page_size > 0 {
        builder
            .push(" LIMIT ")
            .push_bind(limit_param(pagination.page_size));
    }
    Ok(builder.build())
}

/// Model ids of a store in insertion order.
pub fn build_read_authorization_models_query(
    dialect: Dialect,
    store_id: &str,
    pagination: &PaginationOptions,
) -> StorageResult<Statement> {
    let mut builder = StatementBuilder::new(
        dialect,
        "SELECT authorization_model_id, inserted_at FROM authorization_model WHERE store = ",
    );
    builder.push_bind(Param::Text(store_id.to_string()));
    apply_cursor(&mut builder, "authorization_model_id", pagination)?;
    builder.push(" ORDER BY authorization_model_id");
    apply_probe_limit(&mut builder, pagination.page_size);
    Ok(builder.build())
}

/// The most recently inserted model id of a store.
pub fn build_latest_authorization_model_query(dialect: Dialect, store_id: &str) -> Statement {
    let mut builder = StatementBuilder::new(
        dialect,
        "SELECT authorization_model_id FROM authorization_model WHERE store = ",
    );
    builder.push_bind(Param::Text(store_id.to_string()));
    builder.push(" ORDER BY authorization_model_id DESC LIMIT 1");
    builder.build()
}

/// Removes the row stored under `key`.
pub fn build_delete_tuple_statement(
    dialect: Dialect,
    store_id: &str,
    key: &TupleKey,
) -> Statement {
    let (object_type, object_id) = key.split_object();
    let mut builder = StatementBuilder::new(dialect, "DELETE FROM tuple WHERE store = ");
    builder.push_bind(Param::Text(store_id.to_string()));
    builder
        .and_eq("object_type", object_type)
        .and_eq("object_id", object_id)
        .and_eq("relation", &key.relation)
        .and_eq("_user", &key.user);
    builder.build()
}

pub fn build_insert_tuple_statement(
    dialect: Dialect,
    store_id: &str,
    key: &TupleKey,
    ulid: &InsertionOrderId,
    inserted_at: DateTime<Utc>,
) -> Statement {
    let (object_type, object_id) = key.split_object();
    let mut builder = StatementBuilder::new(
        dialect,
        "INSERT INTO tuple (store, object_type, object_id, relation, _user, user_type, ulid, \
         inserted_at)",
    );
    builder.values(vec![
        Param::Text(store_id.to_string()),
        Param::Text(object_type.to_string()),
        Param::Text(object_id.to_string()),
        Param::Text(key.relation.clone()),
        Param::Text(key.user.clone()),
        Param::Text(key.user_type().as_str().to_string()),
        Param::Text(ulid.as_str().to_string()),
        Param::Timestamp(inserted_at),
    ]);
    builder.build()
}

pub fn build_insert_change_statement(
    dialect: Dialect,
    store_id: &str,
    key: &TupleKey,
    operation: TupleOperation,
    ulid: &InsertionOrderId,
    inserted_at: DateTime<Utc>,
) -> Statement {
    let (object_type, object_id) = key.split_object();
    let mut builder = StatementBuilder::new(
        dialect,
        "INSERT INTO changelog (store, object_type, object_id, relation, _user, operation, ulid, \
         inserted_at)",
    );
    builder.values(vec![
        Param::Text(store_id.to_string()),
        Param::Text(object_type.to_string()),
        Param::Text(object_id.to_string()),
        Param::Text(key.relation.clone()),
        Param::Text(key.user.clone()),
        Param::SmallInt(operation.as_i16()),
        Param::Text(ulid.as_str().to_string()),
        Param::Timestamp(inserted_at),
    ]);
    builder.build()
}

/// Stores a model's type definitions as JSON text.
pub fn build_insert_authorization_model_statement(
    dialect: Dialect,
    store_id: &str,
    model_id: &InsertionOrderId,
    type_definitions: &str,
    inserted_at: DateTime<Utc>,
) -> Statement {
    let mut builder = StatementBuilder::new(
        dialect,
        "INSERT INTO authorization_model (store, authorization_model_id, type_definitions, \
         inserted_at)",
    );
    builder.values(vec![
        Param::Text(store_id.to_string()),
        Param::Text(model_id.as_str().to_string()),
        Param::Text(type_definitions.to_string()),
        Param::Timestamp(inserted_at),
    ]);
    builder.build()
}

pub fn build_read_authorization_model_query(
    dialect: Dialect,
    store_id: &str,
    model_id: &str,
) -> Statement {
    let mut builder = StatementBuilder::new(
        dialect,
        "SELECT type_definitions FROM authorization_model WHERE store = ",
    );
    builder.push_bind(Param::Text(store_id.to_string()));
    builder.and_eq("authorization_model_id", model_id);
    builder.build()
}
