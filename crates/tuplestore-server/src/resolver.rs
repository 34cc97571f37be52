//! Picks the authorization model a request runs against.

use std::sync::Arc;

use tracing::instrument;
use tuplestore_storage::{DataStore, StorageError};

/// Model resolution failure.
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    /// No model id was given and the store has no models.
    #[error("no authorization model found for store: {store_id}")]
    LatestAuthorizationModelNotFound { store_id: String },

    #[error("authorization model not found: {model_id}")]
    AuthorizationModelNotFound { model_id: String },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

pub type ResolveResult<T> = Result<T, ResolveError>;

/// Resolves a request's model id against the datastore.
///
/// Every call performs exactly one lookup; nothing is cached here.
#[derive(Clone)]
pub struct AuthorizationModelResolver {
    datastore: Arc<dyn DataStore>,
}

impl AuthorizationModelResolver {
    pub fn new(datastore: Arc<dyn DataStore>) -> Self {
        Self { datastore }
    }

    /// Returns the model id to use for `store_id`.
    ///
    /// An empty `model_id` means "latest". A non-empty one must name an
    /// existing model and is returned unchanged.
    #[instrument(skip(self))]
    pub async fn resolve(&self, store_id: &str, model_id: &str) -> ResolveResult<String> {
        if model_id.is_empty() {
            return match self
                .datastore
                .find_latest_authorization_model_id(store_id)
                .await
            {
                Ok(id) => Ok(id),
                Err(StorageError::NotFound) => {
                    Err(ResolveError::LatestAuthorizationModelNotFound {
                        store_id: store_id.to_string(),
                    })
                }
                Err(e) => Err(e.into()),
            };
        }

        match self
            .datastore
            .read_authorization_model(store_id, model_id)
            .await
        {
            Ok(_) => Ok(model_id.to_string()),
            Err(StorageError::NotFound) => Err(ResolveError::AuthorizationModelNotFound {
                model_id: model_id.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }
}

impl std::fmt::Debug for AuthorizationModelResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthorizationModelResolver").finish_non_exhaustive()
    }
}
