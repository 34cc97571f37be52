//! DataStore trait definition and the types it exchanges.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cursor::{ContinuationToken, InsertionOrderId};
use crate::error::{HealthStatus, StorageError, StorageResult};

/// Page size applied to change-log reads that ask for "no limit".
pub const DEFAULT_CHANGES_PAGE_SIZE: usize = 50;

/// A relationship fact: `object#relation@user`.
///
/// `object` is `type:id`. `user` is either a concrete identifier (`user:anne`)
/// or a userset reference (`group:eng#member`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TupleKey {
    pub object: String,
    pub relation: String,
    pub user: String,
}

impl TupleKey {
    pub fn new(
        object: impl Into<String>,
        relation: impl Into<String>,
        user: impl Into<String>,
    ) -> Self {
        Self {
            object: object.into(),
            relation: relation.into(),
            user: user.into(),
        }
    }

    /// Splits `object` into `(type, id)`. An object without `:` has an empty type.
    pub fn split_object(&self) -> (&str, &str) {
        split_object(&self.object)
    }

    pub fn user_type(&self) -> UserType {
        UserType::of(&self.user)
    }
}

impl fmt::Display for TupleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}@{}", self.object, self.relation, self.user)
    }
}

/// Splits `type:id` on the first `:`.
pub fn split_object(object: &str) -> (&str, &str) {
    match object.split_once(':') {
        Some((object_type, object_id)) => (object_type, object_id),
        None => ("", object),
    }
}

/// Builds `type:id`.
pub fn build_object(object_type: &str, object_id: &str) -> String {
    format!("{object_type}:{object_id}")
}

/// Whether a tuple's user is a concrete identifier or a userset reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UserType {
    User,
    Userset,
}

impl UserType {
    pub fn of(user: &str) -> Self {
        if user.contains('#') {
            UserType::Userset
        } else {
            UserType::User
        }
    }

    /// Value persisted in the `user_type` column.
    pub fn as_str(&self) -> &'static str {
        match self {
            UserType::User => "user",
            UserType::Userset => "userset",
        }
    }
}

/// A persisted tuple as returned to callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tuple {
    pub key: TupleKey,
    pub timestamp: DateTime<Utc>,
}

/// Filter for reading tuples. `None` and empty strings are unconstrained.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TupleFilter {
    pub object_type: Option<String>,
    pub object_id: Option<String>,
    pub relation: Option<String>,
    pub user: Option<String>,
}

impl TupleFilter {
    pub fn object_type(&self) -> Option<&str> {
        non_empty(&self.object_type)
    }

    pub fn object_id(&self) -> Option<&str> {
        non_empty(&self.object_id)
    }

    pub fn relation(&self) -> Option<&str> {
        non_empty(&self.relation)
    }

    pub fn user(&self) -> Option<&str> {
        non_empty(&self.user)
    }

    /// Returns true if `record` satisfies every constrained field.
    pub(crate) fn matches(&self, record: &TupleRecord) -> bool {
        self.object_type().map_or(true, |v| record.object_type == v)
            && self.object_id().map_or(true, |v| record.object_id == v)
            && self.relation().map_or(true, |v| record.relation == v)
            && self.user().map_or(true, |v| record.user == v)
    }
}

impl From<&TupleKey> for TupleFilter {
    fn from(key: &TupleKey) -> Self {
        let (object_type, object_id) = key.split_object();
        let owned = |s: &str| (!s.is_empty()).then(|| s.to_string());
        Self {
            object_type: owned(object_type),
            object_id: owned(object_id),
            relation: owned(&key.relation),
            user: owned(&key.user),
        }
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

/// A row of the tuple table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TupleRecord {
    pub store: String,
    pub object_type: String,
    pub object_id: String,
    pub relation: String,
    pub user: String,
    pub ulid: InsertionOrderId,
    pub inserted_at: DateTime<Utc>,
}

impl TupleRecord {
    pub fn as_tuple(&self) -> Tuple {
        Tuple {
            key: TupleKey::new(
                build_object(&self.object_type, &self.object_id),
                &self.relation,
                &self.user,
            ),
            timestamp: self.inserted_at,
        }
    }
}

/// Kind of mutation recorded in the change log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TupleOperation {
    Write,
    Delete,
}

impl TupleOperation {
    /// Value persisted in the `operation` column.
    pub fn as_i16(&self) -> i16 {
        match self {
            TupleOperation::Write => 0,
            TupleOperation::Delete => 1,
        }
    }

    pub fn from_i16(value: i16) -> Option<Self> {
        match value {
            0 => Some(TupleOperation::Write),
            1 => Some(TupleOperation::Delete),
            _ => None,
        }
    }
}

/// One entry of the change log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TupleChange {
    pub tuple_key: TupleKey,
    pub operation: TupleOperation,
    pub timestamp: DateTime<Utc>,
}

/// A row of the change log table.
#[derive(Debug, Clone)]
pub(crate) struct ChangeRecord {
    pub object_type: String,
    pub object_id: String,
    pub relation: String,
    pub user: String,
    pub operation: TupleOperation,
    pub ulid: InsertionOrderId,
    pub inserted_at: DateTime<Utc>,
}

impl ChangeRecord {
    pub fn as_change(&self) -> TupleChange {
        TupleChange {
            tuple_key: TupleKey::new(
                build_object(&self.object_type, &self.object_id),
                &self.relation,
                &self.user,
            ),
            operation: self.operation,
            timestamp: self.inserted_at,
        }
    }
}

/// A type and its relations. Relation rewrites are stored opaquely.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeDefinition {
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default)]
    pub relations: BTreeMap<String, serde_json::Value>,
}

impl TypeDefinition {
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            relations: BTreeMap::new(),
        }
    }
}

/// An immutable, versioned set of type definitions.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthorizationModel {
    pub id: String,
    pub type_definitions: Vec<TypeDefinition>,
}

/// Model id plus the time it was written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationModelSummary {
    pub id: String,
    pub inserted_at: DateTime<Utc>,
}

/// A row of the model summary query.
#[derive(Debug, Clone)]
pub(crate) struct ModelRecord {
    pub id: InsertionOrderId,
    pub inserted_at: DateTime<Utc>,
}

impl ModelRecord {
    pub fn as_summary(&self) -> AuthorizationModelSummary {
        AuthorizationModelSummary {
            id: self.id.as_str().to_string(),
            inserted_at: self.inserted_at,
        }
    }
}

/// Pagination request. `page_size == 0` means no limit, except for change-log
/// reads where it falls back to [`DEFAULT_CHANGES_PAGE_SIZE`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PaginationOptions {
    pub page_size: usize,
    pub from: Option<ContinuationToken>,
}

impl PaginationOptions {
    pub fn new(page_size: usize, from: Option<ContinuationToken>) -> Self {
        Self { page_size, from }
    }

    /// Unbounded read from the start.
    pub fn unbounded() -> Self {
        Self::default()
    }
}

/// One page of results.
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// `None` when the page is the last one.
    pub continuation_token: Option<ContinuationToken>,
}

/// One page of the change log. The token is always present because new
/// changes may become visible at any time.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangesPage {
    pub changes: Vec<TupleChange>,
    pub continuation_token: ContinuationToken,
}

impl ChangesPage {
    /// Assembles a page from rows already ordered by position.
    ///
    /// An empty page hands back the incoming token, or the origin if the
    /// caller started from the beginning, so polling can resume in place.
    pub(crate) fn from_records(
        records: Vec<ChangeRecord>,
        from: Option<&ContinuationToken>,
    ) -> Self {
        let continuation_token = match records.last() {
            Some(last) => ContinuationToken::from_position(&last.ulid),
            None => from.cloned().unwrap_or_else(ContinuationToken::origin),
        };
        Self {
            changes: records.iter().map(ChangeRecord::as_change).collect(),
            continuation_token,
        }
    }
}

/// Page size actually applied to a change-log read.
pub(crate) fn changes_page_size(requested: usize) -> usize {
    if requested == 0 {
        DEFAULT_CHANGES_PAGE_SIZE
    } else {
        requested
    }
}

/// Newest `inserted_at` (exclusive) visible to a change-log read.
pub(crate) fn changes_horizon(offset: Duration) -> StorageResult<DateTime<Utc>> {
    let offset = chrono::Duration::from_std(offset)
        .map_err(|e| StorageError::wrap("invalid change-log horizon", e))?;
    Ok(Utc::now() - offset)
}

/// Abstract storage interface for relationship tuples and authorization models.
///
/// Implementations must be thread-safe (Send + Sync) and translate every
/// backend failure into [`crate::StorageError`].
#[async_trait]
pub trait DataStore: Send + Sync + 'static {
    // Tuple operations

    /// Applies `deletes` then `writes` atomically.
    ///
    /// Fails with `InvalidWriteInput` if a written tuple already exists or a
    /// deleted tuple does not; nothing is persisted in that case.
    async fn write_tuples(
        &self,
        store_id: &str,
        writes: Vec<TupleKey>,
        deletes: Vec<TupleKey>,
    ) -> StorageResult<()>;

    /// Reads tuples matching the filter, ordered by insertion.
    async fn read_tuples(
        &self,
        store_id: &str,
        filter: &TupleFilter,
        pagination: &PaginationOptions,
    ) -> StorageResult<Page<Tuple>>;

    /// Reads every matching tuple whose user is a userset reference.
    async fn read_userset_tuples(
        &self,
        store_id: &str,
        filter: &TupleFilter,
    ) -> StorageResult<Vec<Tuple>>;

    /// Reads change-log entries older than `horizon_offset`.
    async fn read_changes(
        &self,
        store_id: &str,
        object_type: Option<&str>,
        pagination: &PaginationOptions,
        horizon_offset: Duration,
    ) -> StorageResult<ChangesPage>;

    // Authorization model operations

    /// Persists a new model version and returns its id.
    async fn write_authorization_model(
        &self,
        store_id: &str,
        type_definitions: Vec<TypeDefinition>,
    ) -> StorageResult<String>;

    /// Fails with `NotFound` if the store has no model with this id.
    async fn read_authorization_model(
        &self,
        store_id: &str,
        model_id: &str,
    ) -> StorageResult<AuthorizationModel>;

    /// Id of the most recently written model. Fails with `NotFound` if none.
    async fn find_latest_authorization_model_id(&self, store_id: &str) -> StorageResult<String>;

    /// Lists model ids in insertion order.
    async fn read_authorization_models(
        &self,
        store_id: &str,
        pagination: &PaginationOptions,
    ) -> StorageResult<Page<AuthorizationModelSummary>>;

    // Convenience methods

    /// Writes a single tuple.
    async fn write_tuple(&self, store_id: &str, tuple_key: TupleKey) -> StorageResult<()> {
        self.write_tuples(store_id, vec![tuple_key], vec![]).await
    }

    /// Deletes a single tuple.
    async fn delete_tuple(&self, store_id: &str, tuple_key: TupleKey) -> StorageResult<()> {
        self.write_tuples(store_id, vec![], vec![tuple_key]).await
    }

    /// Checks backend connectivity.
    async fn health_check(&self) -> StorageResult<HealthStatus>;
}
