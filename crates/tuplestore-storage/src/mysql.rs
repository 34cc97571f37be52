//! MySQL storage implementation.
//!
//! Also usable with MariaDB and TiDB, which speak the MySQL wire protocol.

use std::time::Duration;

use sqlx::mysql::{MySqlPoolOptions, MySqlQueryResult};
use sqlx::MySql;
use tracing::{debug, instrument};

use crate::error::{StorageError, StorageResult};
use crate::query::Dialect;
use crate::sql::{
    SqlBackend, SqlDataStore, Timeouts, DEFAULT_HEALTH_CHECK_TIMEOUT_SECS,
    DEFAULT_QUERY_TIMEOUT_SECS,
};

/// MySQL configuration options.
#[derive(Clone)]
pub struct MySQLConfig {
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
impl std::fmt::Debug for MySQLConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MySQLConfig")
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

impl Default for MySQLConfig {
    fn default() -> Self {
        Self {
            database_url: "mysql://localhost/tuplestore".to_string(),
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

impl SqlBackend for MySql {
    const NAME: &'static str = "mysql";
    const DIALECT: Dialect = Dialect::MySql;
    const STORE_NAME: &'static str = "MySQLDataStore";

    fn rows_affected(result: &MySqlQueryResult) -> u64 {
        result.rows_affected()
    }
}

/// MySQL implementation of DataStore.
pub type MySQLDataStore = SqlDataStore<MySql>;

impl SqlDataStore<MySql> {
    /// Creates a new MySQL data store with the given configuration.
    #[instrument(skip(config))]
    pub async fn from_config(config: &MySQLConfig) -> StorageResult<Self> {
        let pool = MySqlPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .connect(&config.database_url)
            .await
            .map_err(|e| StorageError::wrap("failed to connect to mysql", e))?;

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

    /// Creates a new MySQL data store from a database URL.
    pub async fn from_url(database_url: &str) -> StorageResult<Self> {
        let config = MySQLConfig {
            database_url: database_url.to_string(),
            ..Default::default()
        };
        Self::from_config(&config).await
    }

    /// Creates the `tuple`, `changelog` and `authorization_model` tables.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> StorageResult<()> {
        debug!("Running database migrations");

        // MySQL has no CREATE INDEX IF NOT EXISTS, so indexes are declared inline.
        let statements = [
            (
                "tuple table",
                r#"
                CREATE TABLE IF NOT EXISTS tuple (
                    store VARCHAR(64) NOT NULL,
                    object_type VARCHAR(128) NOT NULL,
                    object_id VARCHAR(128) NOT NULL,
                    relation VARCHAR(50) NOT NULL,
                    _user VARCHAR(256) NOT NULL,
                    user_type VARCHAR(7) NOT NULL,
                    ulid CHAR(26) NOT NULL,
                    inserted_at TIMESTAMP(6) NOT NULL,
                    PRIMARY KEY (store, object_type, object_id, relation, _user),
                    UNIQUE KEY idx_tuple_ulid (ulid),
                    KEY idx_tuple_userset (store, object_type, object_id, relation, user_type),
                    KEY idx_tuple_user (store, _user)
                ) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4 COLLATE=utf8mb4_bin
                "#,
            ),
            (
                "changelog table",
                r#"
                CREATE TABLE IF NOT EXISTS changelog (
                    store VARCHAR(64) NOT NULL,
                    object_type VARCHAR(128) NOT NULL,
                    object_id VARCHAR(128) NOT NULL,
                    relation VARCHAR(50) NOT NULL,
                    _user VARCHAR(256) NOT NULL,
                    operation SMALLINT NOT NULL,
                    ulid CHAR(26) NOT NULL,
                    inserted_at TIMESTAMP(6) NOT NULL,
                    PRIMARY KEY (store, ulid),
                    KEY idx_changelog_store_inserted_at (store, inserted_at, ulid)
                ) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4 COLLATE=utf8mb4_bin
                "#,
            ),
            (
                "authorization_model table",
                r#"
                CREATE TABLE IF NOT EXISTS authorization_model (
                    store VARCHAR(64) NOT NULL,
                    authorization_model_id CHAR(26) NOT NULL,
                    type_definitions LONGTEXT NOT NULL,
                    inserted_at TIMESTAMP(6) NOT NULL,
                    PRIMARY KEY (store, authorization_model_id)
                ) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4 COLLATE=utf8mb4_bin
                "#,
            ),
        ];

        self.execute_ddl(&statements).await?;

        debug!("Database migrations completed successfully");
        Ok(())
    }
}
