//! In-memory storage implementation.
//!
//! Each store keeps its tuples ordered by insertion id alongside a key index,
//! so writes detect duplicates in O(log N) and reads walk rows in the same
//! order the SQL backends return them. A store's whole write batch is applied
//! under its DashMap shard lock, which gives the same all-or-nothing
//! visibility as a database transaction.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::stream;
use tracing::instrument;

use crate::cursor::{IdGenerator, InsertionOrderId};
use crate::error::{HealthStatus, StorageError, StorageResult};
use crate::iterator::TupleIterator;
use crate::traits::{
    changes_horizon, changes_page_size, AuthorizationModel, AuthorizationModelSummary,
    ChangeRecord, ChangesPage, DataStore, ModelRecord, Page, PaginationOptions, Tuple,
    TupleFilter, TupleKey, TupleOperation, TupleRecord, TypeDefinition, UserType,
};

#[derive(Debug, Default)]
struct StoreState {
    tuples: BTreeMap<InsertionOrderId, TupleRecord>,
    index: HashMap<TupleKey, InsertionOrderId>,
    changelog: Vec<ChangeRecord>,
    models: BTreeMap<InsertionOrderId, StoredModel>,
}

#[derive(Debug, Clone)]
struct StoredModel {
    inserted_at: DateTime<Utc>,
    type_definitions: Vec<TypeDefinition>,
}

/// In-memory implementation of DataStore.
///
/// Intended for tests and single-process deployments; nothing survives a
/// restart.
#[derive(Debug, Default)]
pub struct MemoryDataStore {
    stores: DashMap<String, StoreState>,
    ids: IdGenerator,
}

impl MemoryDataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a new in-memory data store wrapped in Arc.
    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Snapshot of the store's tuples after `after`, in insertion order.
    fn tuple_rows(
        &self,
        store_id: &str,
        after: Option<&InsertionOrderId>,
        mut keep: impl FnMut(&TupleRecord) -> bool,
        limit: usize,
    ) -> Vec<StorageResult<TupleRecord>> {
        let Some(state) = self.stores.get(store_id) else {
            return Vec::new();
        };
        state
            .tuples
            .values()
            .filter(|record| after.map_or(true, |position| &record.ulid > position))
            .filter(|record| keep(record))
            .take(limit)
            .cloned()
            .map(Ok)
            .collect()
    }
}

/// Rows to fetch for a page: one extra to probe for more, or all of them.
fn probe_limit(page_size: usize) -> usize {
    if page_size == 0 {
        usize::MAX
    } else {
        page_size.saturating_add(1)
    }
}

/// Rejects writes of existing tuples and deletes of missing ones, treating
/// the batch as if deletes had already been applied.
fn validate_batch(
    state: &StoreState,
    writes: &[TupleKey],
    deletes: &[TupleKey],
) -> StorageResult<()> {
    let exists = |key: &TupleKey| state.index.contains_key(key);

    let mut deleted = HashSet::with_capacity(deletes.len());
    for key in deletes {
        if !exists(key) || !deleted.insert(key) {
            return Err(StorageError::InvalidWriteInput {
                tuple_key: key.clone(),
                operation: TupleOperation::Delete,
            });
        }
    }

    let mut written = HashSet::with_capacity(writes.len());
    for key in writes {
        let present = exists(key) && !deleted.contains(key);
        if present || !written.insert(key) {
            return Err(StorageError::InvalidWriteInput {
                tuple_key: key.clone(),
                operation: TupleOperation::Write,
            });
        }
    }
    Ok(())
}

fn change_record(
    key: &TupleKey,
    operation: TupleOperation,
    ulid: InsertionOrderId,
    inserted_at: DateTime<Utc>,
) -> ChangeRecord {
    let (object_type, object_id) = key.split_object();
    ChangeRecord {
        object_type: object_type.to_string(),
        object_id: object_id.to_string(),
        relation: key.relation.clone(),
        user: key.user.clone(),
        operation,
        ulid,
        inserted_at,
    }
}

#[async_trait]
impl DataStore for MemoryDataStore {
    #[instrument(skip(self, writes, deletes), fields(writes = writes.len(), deletes = deletes.len()))]
    async fn write_tuples(
        &self,
        store_id: &str,
        writes: Vec<TupleKey>,
        deletes: Vec<TupleKey>,
    ) -> StorageResult<()> {
        // Holding the entry for the whole batch serializes writers per store.
        let mut state = self.stores.entry(store_id.to_string()).or_default();
        validate_batch(&state, &writes, &deletes)?;

        let mut minted = Vec::with_capacity(writes.len() + deletes.len());
        for _ in 0..writes.len() + deletes.len() {
            minted.push(self.ids.next_id()?);
        }
        let (delete_ids, write_ids) = minted.split_at(deletes.len());

        for (key, (ulid, inserted_at)) in deletes.iter().zip(delete_ids) {
            if let Some(position) = state.index.remove(key) {
                state.tuples.remove(&position);
            }
            let change = change_record(key, TupleOperation::Delete, ulid.clone(), *inserted_at);
            state.changelog.push(change);
        }

        for (key, (ulid, inserted_at)) in writes.iter().zip(write_ids) {
            let (object_type, object_id) = key.split_object();
            let record = TupleRecord {
                store: store_id.to_string(),
                object_type: object_type.to_string(),
                object_id: object_id.to_string(),
                relation: key.relation.clone(),
                user: key.user.clone(),
                ulid: ulid.clone(),
                inserted_at: *inserted_at,
            };
            state.index.insert(key.clone(), ulid.clone());
            state.tuples.insert(ulid.clone(), record);
            let change = change_record(key, TupleOperation::Write, ulid.clone(), *inserted_at);
            state.changelog.push(change);
        }

        Ok(())
    }

    #[instrument(skip(self))]
    async fn read_tuples(
        &self,
        store_id: &str,
        filter: &TupleFilter,
        pagination: &PaginationOptions,
    ) -> StorageResult<Page<Tuple>> {
        let after = pagination.from.as_ref().map(|t| t.position()).transpose()?;
        let rows = self.tuple_rows(
            store_id,
            after.as_ref(),
            |record| filter.matches(record),
            probe_limit(pagination.page_size),
        );

        let (records, continuation_token) = TupleIterator::new(stream::iter(rows))
            .materialize_page(pagination.page_size)
            .await?;
        Ok(Page {
            items: records.iter().map(TupleRecord::as_tuple).collect(),
            continuation_token,
        })
    }

    #[instrument(skip(self))]
    async fn read_userset_tuples(
        &self,
        store_id: &str,
        filter: &TupleFilter,
    ) -> StorageResult<Vec<Tuple>> {
        let rows = self.tuple_rows(
            store_id,
            None,
            |record| UserType::of(&record.user) == UserType::Userset && filter.matches(record),
            usize::MAX,
        );

        let records = TupleIterator::new(stream::iter(rows)).collect_all().await?;
        Ok(records.iter().map(TupleRecord::as_tuple).collect())
    }

    #[instrument(skip(self))]
    async fn read_changes(
        &self,
        store_id: &str,
        object_type: Option<&str>,
        pagination: &PaginationOptions,
        horizon_offset: Duration,
    ) -> StorageResult<ChangesPage> {
        let after = pagination.from.as_ref().map(|t| t.position()).transpose()?;
        let horizon = changes_horizon(horizon_offset)?;
        let object_type = object_type.filter(|t| !t.is_empty());

        let rows: Vec<StorageResult<ChangeRecord>> = self
            .stores
            .get(store_id)
            .map(|state| {
                state
                    .changelog
                    .iter()
                    .filter(|change| change.inserted_at < horizon)
                    .filter(|change| object_type.map_or(true, |t| change.object_type == t))
                    .filter(|change| after.as_ref().map_or(true, |p| &change.ulid > p))
                    .take(changes_page_size(pagination.page_size))
                    .cloned()
                    .map(Ok)
                    .collect()
            })
            .unwrap_or_default();

        let records = TupleIterator::new(stream::iter(rows)).collect_all().await?;
        Ok(ChangesPage::from_records(records, pagination.from.as_ref()))
    }

    #[instrument(skip(self, type_definitions))]
    async fn write_authorization_model(
        &self,
        store_id: &str,
        type_definitions: Vec<TypeDefinition>,
    ) -> StorageResult<String> {
        let (id, inserted_at) = self.ids.next_id()?;
        self.stores.entry(store_id.to_string()).or_default().models.insert(
            id.clone(),
            StoredModel {
                inserted_at,
                type_definitions,
            },
        );
        Ok(id.to_string())
    }

    #[instrument(skip(self))]
    async fn read_authorization_model(
        &self,
        store_id: &str,
        model_id: &str,
    ) -> StorageResult<AuthorizationModel> {
        let state = self.stores.get(store_id).ok_or(StorageError::NotFound)?;
        let model = state
            .models
            .get(&InsertionOrderId::from_stored(model_id))
            .ok_or(StorageError::NotFound)?;
        Ok(AuthorizationModel {
            id: model_id.to_string(),
            type_definitions: model.type_definitions.clone(),
        })
    }

    #[instrument(skip(self))]
    async fn find_latest_authorization_model_id(&self, store_id: &str) -> StorageResult<String> {
        self.stores
            .get(store_id)
            .and_then(|state| state.models.keys().next_back().map(|id| id.to_string()))
            .ok_or(StorageError::NotFound)
    }

    #[instrument(skip(self))]
    async fn read_authorization_models(
        &self,
        store_id: &str,
        pagination: &PaginationOptions,
    ) -> StorageResult<Page<AuthorizationModelSummary>> {
        let after = pagination.from.as_ref().map(|t| t.position()).transpose()?;
        let rows: Vec<StorageResult<ModelRecord>> = self
            .stores
            .get(store_id)
            .map(|state| {
                state
                    .models
                    .iter()
                    .filter(|(id, _)| after.as_ref().map_or(true, |p| *id > p))
                    .take(probe_limit(pagination.page_size))
                    .map(|(id, model)| {
                        Ok(ModelRecord {
                            id: id.clone(),
                            inserted_at: model.inserted_at,
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        let (records, continuation_token) = TupleIterator::new(stream::iter(rows))
            .materialize_page(pagination.page_size)
            .await?;
        Ok(Page {
            items: records.iter().map(ModelRecord::as_summary).collect(),
            continuation_token,
        })
    }

    async fn health_check(&self) -> StorageResult<HealthStatus> {
        Ok(HealthStatus {
            healthy: true,
            latency: Duration::ZERO,
            pool_stats: None,
            message: Some("in-memory storage".to_string()),
        })
    }
}
