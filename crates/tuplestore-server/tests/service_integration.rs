//! End-to-end wiring: configuration, datastore construction, resolution.

use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serial_test::serial;
use tempfile::NamedTempFile;
use tuplestore_server::{
    build_datastore, AuthorizationModelResolver, ResolveError, ServerConfig, TupleService,
};
use tuplestore_storage::{
    AuthorizationModel, AuthorizationModelSummary, ChangesPage, DataStore, HealthStatus, Page,
    PaginationOptions, StorageError, StorageResult, Tuple, TupleFilter, TupleKey, TypeDefinition,
};

/// Datastore that counts model lookups and answers them with a fixed result.
struct CountingModelStore {
    lookups: AtomicUsize,
    fail_with_internal: bool,
}

impl CountingModelStore {
    fn new(fail_with_internal: bool) -> Self {
        Self {
            lookups: AtomicUsize::new(0),
            fail_with_internal,
        }
    }

    fn lookup<T>(&self, found: T) -> StorageResult<T> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        if self.fail_with_internal {
            Err(StorageError::internal("connection reset"))
        } else {
            Ok(found)
        }
    }
}

#[async_trait]
impl DataStore for CountingModelStore {
    async fn write_tuples(
        &self,
        _store_id: &str,
        _writes: Vec<TupleKey>,
        _deletes: Vec<TupleKey>,
    ) -> StorageResult<()> {
        Ok(())
    }

    async fn read_tuples(
        &self,
        _store_id: &str,
        _filter: &TupleFilter,
        _pagination: &PaginationOptions,
    ) -> StorageResult<Page<Tuple>> {
        Ok(Page {
            items: vec![],
            continuation_token: None,
        })
    }

    async fn read_userset_tuples(
        &self,
        _store_id: &str,
        _filter: &TupleFilter,
    ) -> StorageResult<Vec<Tuple>> {
        Ok(vec![])
    }

    async fn read_changes(
        &self,
        _store_id: &str,
        _object_type: Option<&str>,
        _pagination: &PaginationOptions,
        _horizon_offset: Duration,
    ) -> StorageResult<ChangesPage> {
        Err(StorageError::internal("not used"))
    }

    async fn write_authorization_model(
        &self,
        _store_id: &str,
        _type_definitions: Vec<TypeDefinition>,
    ) -> StorageResult<String> {
        Err(StorageError::internal("not used"))
    }

    async fn read_authorization_model(
        &self,
        _store_id: &str,
        model_id: &str,
    ) -> StorageResult<AuthorizationModel> {
        self.lookup(AuthorizationModel {
            id: model_id.to_string(),
            type_definitions: vec![],
        })
    }

    async fn find_latest_authorization_model_id(&self, _store_id: &str) -> StorageResult<String> {
        self.lookup("01LATEST".to_string())
    }

    async fn read_authorization_models(
        &self,
        _store_id: &str,
        _pagination: &PaginationOptions,
    ) -> StorageResult<Page<AuthorizationModelSummary>> {
        Err(StorageError::internal("not used"))
    }

    async fn health_check(&self) -> StorageResult<HealthStatus> {
        Err(StorageError::internal("not used"))
    }
}

#[tokio::test]
async fn test_resolver_performs_one_lookup_per_call() {
    let store = Arc::new(CountingModelStore::new(false));
    let resolver = AuthorizationModelResolver::new(store.clone());

    assert_eq!(resolver.resolve("s", "").await.unwrap(), "01LATEST");
    assert_eq!(resolver.resolve("s", "01EXPLICIT").await.unwrap(), "01EXPLICIT");
    assert_eq!(resolver.resolve("s", "").await.unwrap(), "01LATEST");

    assert_eq!(store.lookups.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_resolver_passes_storage_failures_through() {
    let resolver = AuthorizationModelResolver::new(Arc::new(CountingModelStore::new(true)));

    for model_id in ["", "01EXPLICIT"] {
        let err = resolver.resolve("s", model_id).await.unwrap_err();
        assert!(
            matches!(err, ResolveError::Storage(StorageError::Internal { .. })),
            "unexpected error for {model_id:?}: {err:?}"
        );
    }
}

#[tokio::test]
async fn test_resolver_is_safe_to_share_across_tasks() {
    let store = Arc::new(CountingModelStore::new(false));
    let resolver = AuthorizationModelResolver::new(store.clone());

    let handles: Vec<_> = (0..16)
        .map(|i| {
            let resolver = resolver.clone();
            tokio::spawn(async move {
                let id = if i % 2 == 0 { String::new() } else { format!("01M{i}") };
                resolver.resolve("s", &id).await
            })
        })
        .collect();

    for handle in handles {
        assert!(handle.await.unwrap().is_ok());
    }
    assert_eq!(store.lookups.load(Ordering::SeqCst), 16);
}

#[tokio::test]
#[serial]
async fn test_service_from_yaml_config() {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
storage:
  backend: memory
changelog:
  horizon_offset_ms: 0
  page_size: 1
"#
    )
    .unwrap();

    let config = ServerConfig::load(file.path()).unwrap();
    let datastore = build_datastore(&config.storage).await.unwrap();
    let service = TupleService::new(datastore, config.changelog.clone());

    let model_id = service
        .write_authorization_model("01STORE", vec![TypeDefinition::new("document")])
        .await
        .unwrap();
    assert_eq!(service.resolve_model_id("01STORE", "").await.unwrap(), model_id);

    service
        .write(
            "01STORE",
            vec![
                TupleKey::new("document:1", "viewer", "user:anne"),
                TupleKey::new("document:2", "viewer", "group:eng#member"),
            ],
            vec![],
        )
        .await
        .unwrap();

    let usersets = service
        .read_userset_tuples("01STORE", &TupleFilter::default())
        .await
        .unwrap();
    assert_eq!(usersets.len(), 1);
    assert_eq!(usersets[0].key.user, "group:eng#member");

    let first = service
        .read_changes("01STORE", None, &PaginationOptions::default())
        .await
        .unwrap();
    assert_eq!(first.changes.len(), 1);
    let second = service
        .read_changes(
            "01STORE",
            None,
            &PaginationOptions::new(0, Some(first.continuation_token.clone())),
        )
        .await
        .unwrap();
    assert_eq!(second.changes.len(), 1);
    assert_ne!(first.continuation_token, second.continuation_token);

    assert!(service.health_check().await.unwrap().healthy);
}
