//! PostgreSQL storage implementation.

use std::time::Duration;

use sqlx::postgres::{PgPoolOptions, PgQueryResult};
use sqlx::Postgres;
use tracing::{debug, instrument};

use crate::error::{StorageError, StorageResult};
use crate::query::Dialect;
use crate::sql::{
    SqlBackend, SqlDataStore, Timeouts, DEFAULT_HEALTH_CHECK_TIMEOUT_SECS,
    DEFAULT_QUERY_TIMEOUT_SECS,
};

/// PostgreSQL configuration options.
#[derive(Clone)]
pub struct PostgresConfig {
    /// Database connection URL.
    pub database_url: String,
    /// Maximum number of connections in the pool.
    pub max_connections: u32,
    /// Minimum number of connections in the pool.
    pub min_connections: u32,
    /// Connection timeout in seconds.
    pub connect_timeout_secs: u64,
    /// Default query timeout in seconds.
    ///
    /// A query exceeding this duration is cancelled and returns
    /// `StorageError::QueryTimeout`.
    pub query_timeout_secs: u64,
    /// Timeout for read operations. Falls back to `query_timeout_secs`.
    pub read_timeout_secs: Option<u64>,
    /// Timeout for write operations. Falls back to `query_timeout_secs`.
    pub write_timeout_secs: Option<u64>,
    /// Timeout for health checks in seconds.
    pub health_check_timeout_secs: u64,
}

// Custom Debug implementation to hide credentials in database_url
impl std::fmt::Debug for PostgresConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresConfig")
            .field("database_url", &"[REDACTED]")
            .field("max_connections", &self.max_connections)
            .field("min_connections", &self.min_connections)
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .field("query_timeout_secs", &self.query_timeout_secs)
            .field("read_timeout_secs", &self.read_timeout_secs)
            .field("write_timeout_secs", &self.write_timeout_secs)
            .field("health_check_timeout_secs", &self.health_check_timeout_secs)
            .finish()
    }
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            database_url: "postgres://localhost/tuplestore".to_string(),
            max_connections: 10,
            min_connections: 1,
            connect_timeout_secs: 30,
            query_timeout_secs: DEFAULT_QUERY_TIMEOUT_SECS,
            read_timeout_secs: None,
            write_timeout_secs: None,
            health_check_timeout_secs: DEFAULT_HEALTH_CHECK_TIMEOUT_SECS,
        }
    }
}

impl SqlBackend for Postgres {
    const NAME: &'static str = "postgres";
    const DIALECT: Dialect = Dialect::Postgres;
    const STORE_NAME: &'static str = "PostgresDataStore";

    fn rows_affected(result: &PgQueryResult) -> u64 {
        result.rows_affected()
    }
}

/// PostgreSQL implementation of DataStore.
pub type PostgresDataStore = SqlDataStore<Postgres>;

impl SqlDataStore<Postgres> {
    /// Creates a new PostgreSQL data store with the given configuration.
    #[instrument(skip(config))]
    pub async fn from_config(config: &PostgresConfig) -> StorageResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .connect(&config.database_url)
            .await
            .map_err(|e| StorageError::wrap("failed to connect to postgres", e))?;

        Ok(Self::with_timeouts(
            pool,
            Timeouts::from_secs(
                config.query_timeout_secs,
                config.read_timeout_secs,
                config.write_timeout_secs,
                config.health_check_timeout_secs,
            ),
        ))
    }

    /// Creates a new PostgreSQL data store from a database URL.
    pub async fn from_url(database_url: &str) -> StorageResult<Self> {
        let config = PostgresConfig {
            database_url: database_url.to_string(),
            ..Default::default()
        };
        Self::from_config(&config).await
    }

    /// Creates the `tuple`, `changelog` and `authorization_model` tables.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> StorageResult<()> {
        debug!("Running database migrations");

        let statements = [
            (
                "tuple table",
                r#"
                CREATE TABLE IF NOT EXISTS tuple (
                    store TEXT NOT NULL,
                    object_type TEXT NOT NULL,
                    object_id TEXT NOT NULL,
                    relation TEXT NOT NULL,
                    _user TEXT NOT NULL,
                    user_type TEXT NOT NULL,
                    ulid TEXT NOT NULL,
                    inserted_at TIMESTAMPTZ NOT NULL,
                    PRIMARY KEY (store, object_type, object_id, relation, _user)
                )
                "#,
            ),
            (
                "tuple ulid index",
                "CREATE UNIQUE INDEX IF NOT EXISTS idx_tuple_ulid ON tuple (ulid)",
            ),
            (
                "tuple userset index",
                "CREATE INDEX IF NOT EXISTS idx_tuple_userset \
                 ON tuple (store, object_type, object_id, relation, user_type)",
            ),
            (
                "tuple user index",
                "CREATE INDEX IF NOT EXISTS idx_tuple_user ON tuple (store, _user)",
            ),
            (
                "changelog table",
                r#"
                CREATE TABLE IF NOT EXISTS changelog (
                    store TEXT NOT NULL,
                    object_type TEXT NOT NULL,
                    object_id TEXT NOT NULL,
                    relation TEXT NOT NULL,
                    _user TEXT NOT NULL,
                    operation SMALLINT NOT NULL,
                    ulid TEXT NOT NULL,
                    inserted_at TIMESTAMPTZ NOT NULL,
                    PRIMARY KEY (store, ulid)
                )
                "#,
            ),
            (
                "changelog index",
                "CREATE INDEX IF NOT EXISTS idx_changelog_store_inserted_at \
                 ON changelog (store, inserted_at, ulid)",
            ),
            (
                "authorization_model table",
                r#"
                CREATE TABLE IF NOT EXISTS authorization_model (
                    store TEXT NOT NULL,
                    authorization_model_id TEXT NOT NULL,
                    type_definitions TEXT NOT NULL,
                    inserted_at TIMESTAMPTZ NOT NULL,
                    PRIMARY KEY (store, authorization_model_id)
                )
                "#,
            ),
        ];

        self.execute_ddl(&statements).await?;

        debug!("Database migrations completed successfully");
        Ok(())
    }
}
