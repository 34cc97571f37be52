//! Request-facing entry point over a `DataStore`.

use std::sync::Arc;

use tracing::instrument;
use tuplestore_storage::{
    AuthorizationModel, AuthorizationModelSummary, ChangesPage, DataStore, HealthStatus, Page,
    PaginationOptions, StorageResult, Tuple, TupleFilter, TupleKey, TypeDefinition,
};

use crate::config::ChangelogSettings;
use crate::resolver::{AuthorizationModelResolver, ResolveResult};

/// Bundles the datastore with model resolution and change-log settings.
///
/// Change-log reads use the configured horizon; callers never pass one.
#[derive(Clone)]
pub struct TupleService {
    datastore: Arc<dyn DataStore>,
    resolver: AuthorizationModelResolver,
    changelog: ChangelogSettings,
}

impl TupleService {
    pub fn new(datastore: Arc<dyn DataStore>, changelog: ChangelogSettings) -> Self {
        Self {
            resolver: AuthorizationModelResolver::new(datastore.clone()),
            datastore,
            changelog,
        }
    }

    pub fn datastore(&self) -> &Arc<dyn DataStore> {
        &self.datastore
    }

    pub fn changelog_settings(&self) -> &ChangelogSettings {
        &self.changelog
    }

    /// See [`AuthorizationModelResolver::resolve`].
    pub async fn resolve_model_id(&self, store_id: &str, model_id: &str) -> ResolveResult<String> {
        self.resolver.resolve(store_id, model_id).await
    }

    pub async fn write(
        &self,
        store_id: &str,
        writes: Vec<TupleKey>,
        deletes: Vec<TupleKey>,
    ) -> StorageResult<()> {
        self.datastore.write_tuples(store_id, writes, deletes).await
    }

    pub async fn read(
        &self,
        store_id: &str,
        filter: &TupleFilter,
        pagination: &PaginationOptions,
    ) -> StorageResult<Page<Tuple>> {
        self.datastore.read_tuples(store_id, filter, pagination).await
    }

    pub async fn read_userset_tuples(
        &self,
        store_id: &str,
        filter: &TupleFilter,
    ) -> StorageResult<Vec<Tuple>> {
        self.datastore.read_userset_tuples(store_id, filter).await
    }

    /// Reads the change log behind the configured horizon.
    ///
    /// A zero page size takes the configured default.
    #[instrument(skip(self, pagination), fields(page_size = pagination.page_size))]
    pub async fn read_changes(
        &self,
        store_id: &str,
        object_type: Option<&str>,
        pagination: &PaginationOptions,
    ) -> StorageResult<ChangesPage> {
        let page_size = match pagination.page_size {
            0 => self.changelog.page_size,
            n => n,
        };
        let pagination = PaginationOptions::new(page_size, pagination.from.clone());
        self.datastore
            .read_changes(
                store_id,
                object_type,
                &pagination,
                self.changelog.horizon_offset(),
            )
            .await
    }

    pub async fn write_authorization_model(
        &self,
        store_id: &str,
        type_definitions: Vec<TypeDefinition>,
    ) -> StorageResult<String> {
        self.datastore
            .write_authorization_model(store_id, type_definitions)
            .await
    }

    pub async fn read_authorization_model(
        &self,
        store_id: &str,
        model_id: &str,
    ) -> StorageResult<AuthorizationModel> {
        self.datastore
            .read_authorization_model(store_id, model_id)
            .await
    }

    pub async fn read_authorization_models(
        &self,
        store_id: &str,
        pagination: &PaginationOptions,
    ) -> StorageResult<Page<AuthorizationModelSummary>> {
        self.datastore
            .read_authorization_models(store_id, pagination)
            .await
    }

    pub async fn health_check(&self) -> StorageResult<HealthStatus> {
        self.datastore.health_check().await
    }
}

impl std::fmt::Debug for TupleService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TupleService")
            .field("changelog", &self.changelog)
            .finish_non_exhaustive()
    }
}
