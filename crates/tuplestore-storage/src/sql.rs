//! The SQL-backed `DataStore`, generic over the sqlx driver.
//!
//! PostgreSQL and MySQL share every statement, row decoder and transaction
//! path here; a backend supplies its [`Dialect`] through [`SqlBackend`] plus
//! its own pool construction and DDL.

use std::fmt;
use std::future::Future;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use sqlx::database::Database;
use sqlx::query::Query;
use sqlx::{ColumnIndex, Decode, Encode, Executor, IntoArguments, Pool, Row, Type};
use tracing::instrument;

use crate::cursor::{IdGenerator, InsertionOrderId};
use crate::error::{
    map_sqlx_error, map_write_error, HealthStatus, PoolStats, StorageError, StorageResult,
};
use crate::iterator::TupleIterator;
use crate::query::{
    build_delete_tuple_statement, build_insert_authorization_model_statement,
    build_insert_change_statement, build_insert_tuple_statement,
    build_latest_authorization_model_query, build_read_authorization_model_query,
    build_read_authorization_models_query, build_read_changes_query, build_read_query,
    build_read_userset_tuples_query, Dialect, Param, Statement,
};
use crate::traits::{
    changes_horizon, changes_page_size, AuthorizationModel, AuthorizationModelSummary,
    ChangeRecord, ChangesPage, DataStore, ModelRecord, Page, PaginationOptions, Tuple,
    TupleFilter, TupleKey, TupleOperation, TupleRecord, TypeDefinition,
};
use crate::transaction::{rollback_tx, WriteTransaction};

/// Default query timeout in seconds.
pub const DEFAULT_QUERY_TIMEOUT_SECS: u64 = 30;

/// Default health check timeout in seconds.
pub const DEFAULT_HEALTH_CHECK_TIMEOUT_SECS: u64 = 5;

/// Per-operation-kind timeouts of a SQL backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Timeouts {
    pub read: Duration,
    pub write: Duration,
    pub health_check: Duration,
}

impl Timeouts {
    pub fn uniform(query_timeout: Duration) -> Self {
        Self {
            read: query_timeout,
            write: query_timeout,
            health_check: Duration::from_secs(DEFAULT_HEALTH_CHECK_TIMEOUT_SECS),
        }
    }

    pub fn from_secs(
        query_timeout_secs: u64,
        read_timeout_secs: Option<u64>,
        write_timeout_secs: Option<u64>,
        health_check_timeout_secs: u64,
    ) -> Self {
        let default = Duration::from_secs(query_timeout_secs);
        Self {
            read: read_timeout_secs.map(Duration::from_secs).unwrap_or(default),
            write: write_timeout_secs.map(Duration::from_secs).unwrap_or(default),
            health_check: Duration::from_secs(health_check_timeout_secs),
        }
    }
}

impl Default for Timeouts {
    fn default() -> Self {
        Self::uniform(Duration::from_secs(DEFAULT_QUERY_TIMEOUT_SECS))
    }
}

/// Runs `future` under `timeout` and records its duration.
///
/// Dropping the future on timeout drops any open row stream or transaction
/// with it, which releases the connection (and rolls back a pending write).
///
/// # Metrics
/// - `tuplestore_storage_query_duration_seconds` - Histogram of query durations
/// - `tuplestore_storage_query_timeout_total` - Counter of timeout events
pub(crate) async fn execute_with_timeout_and_metrics<T, F>(
    backend: &'static str,
    operation: &str,
    timeout: Duration,
    future: F,
) -> StorageResult<T>
where
    F: Future<Output = StorageResult<T>>,
{
    let start = Instant::now();
    let result = tokio::time::timeout(timeout, future).await;
    let duration = start.elapsed().as_secs_f64();

    let (status, final_result) = match result {
        Ok(Ok(value)) => ("success", Ok(value)),
        Ok(Err(e)) => ("error", Err(e)),
        Err(_elapsed) => (
            "timeout",
            Err(StorageError::QueryTimeout {
                operation: operation.to_string(),
                timeout,
            }),
        ),
    };

    metrics::histogram!(
        "tuplestore_storage_query_duration_seconds",
        "operation" => operation.to_string(),
        "backend" => backend,
        "status" => status
    )
    .record(duration);

    if status == "timeout" {
        metrics::counter!(
            "tuplestore_storage_query_timeout_total",
            "operation" => operation.to_string(),
            "backend" => backend
        )
        .increment(1);
    }

    final_result
}

/// Publishes pool connection gauges.
pub(crate) fn record_pool_stats(backend: &'static str, stats: &PoolStats) {
    for (state, value) in [
        ("active", stats.active_connections),
        ("idle", stats.idle_connections),
        ("max", stats.max_connections),
    ] {
        metrics::gauge!(
            "tuplestore_storage_pool_connections",
            "backend" => backend,
            "state" => state
        )
        .set(value as f64);
    }
}

pub(crate) fn decode_operation(value: i16) -> StorageResult<TupleOperation> {
    TupleOperation::from_i16(value)
        .ok_or_else(|| StorageError::internal(format!("unknown change-log operation {value}")))
}

/// A sqlx driver the SQL store runs on.
pub trait SqlBackend: Database {
    /// Label used in metrics and health reports.
    const NAME: &'static str;
    const DIALECT: Dialect;
    /// Type name shown by `Debug`.
    const STORE_NAME: &'static str;

    fn rows_affected(result: &Self::QueryResult) -> u64;
}

/// Binds a statement's parameters in placeholder order.
pub(crate) fn bind_statement<DB>(statement: &Statement) -> Query<'_, DB, DB::Arguments<'_>>
where
    DB: Database,
    for<'q> &'q str: Encode<'q, DB> + Type<DB>,
    for<'q> i16: Encode<'q, DB> + Type<DB>,
    for<'q> i64: Encode<'q, DB> + Type<DB>,
    for<'q> DateTime<Utc>: Encode<'q, DB> + Type<DB>,
{
    statement
        .params()
        .iter()
        .fold(sqlx::query(statement.sql()), |query, param| match param {
            Param::Text(value) => query.bind(value.as_str()),
            Param::SmallInt(value) => query.bind(*value),
            Param::Int(value) => query.bind(*value),
            Param::Timestamp(value) => query.bind(*value),
        })
}

fn decode_error(err: sqlx::Error) -> StorageError {
    map_sqlx_error(err, "failed to decode row")
}

/// `DataStore` over a sqlx connection pool.
///
/// Exposed as [`PostgresDataStore`](crate::PostgresDataStore) and
/// [`MySQLDataStore`](crate::MySQLDataStore).
pub struct SqlDataStore<DB: Database> {
    pool: Pool<DB>,
    timeouts: Timeouts,
    ids: IdGenerator,
}

impl<DB: Database> SqlDataStore<DB> {
    /// Creates a data store from a connection pool.
    ///
    /// Uses the default query timeout of 30 seconds for all operations.
    pub fn new(pool: Pool<DB>) -> Self {
        Self::with_timeouts(pool, Timeouts::default())
    }

    /// Creates a data store with one timeout for reads and writes.
    pub fn with_timeout(pool: Pool<DB>, query_timeout: Duration) -> Self {
        Self::with_timeouts(pool, Timeouts::uniform(query_timeout))
    }

    pub(crate) fn with_timeouts(pool: Pool<DB>, timeouts: Timeouts) -> Self {
        Self {
            pool,
            timeouts,
            ids: IdGenerator::new(),
        }
    }

    /// Returns the connection pool for testing or advanced usage.
    pub fn pool(&self) -> &Pool<DB> {
        &self.pool
    }

    /// Runs DDL statements in order, naming the failing one.
    pub(crate) async fn execute_ddl(&self, statements: &[(&str, &str)]) -> StorageResult<()>
    where
        for<'c> &'c mut DB::Connection: Executor<'c, Database = DB>,
        for<'q> DB::Arguments<'q>: IntoArguments<'q, DB>,
    {
        for (name, sql) in statements {
            sqlx::query(sql)
                .execute(&self.pool)
                .await
                .map_err(|e| StorageError::wrap(format!("failed to create {name}"), e))?;
        }
        Ok(())
    }
}

impl<DB> SqlDataStore<DB>
where
    DB: SqlBackend,
    for<'c> &'c mut DB::Connection: Executor<'c, Database = DB>,
    for<'q> DB::Arguments<'q>: IntoArguments<'q, DB>,
    for<'q> &'q str: Encode<'q, DB> + Type<DB>,
    for<'q> i16: Encode<'q, DB> + Decode<'q, DB> + Type<DB>,
    for<'q> i64: Encode<'q, DB> + Type<DB>,
    for<'q> DateTime<Utc>: Encode<'q, DB> + Decode<'q, DB> + Type<DB>,
    for<'r> String: Decode<'r, DB> + Type<DB>,
    for<'a> &'a str: ColumnIndex<DB::Row>,
{
    fn tuple_from_row(row: &DB::Row) -> StorageResult<TupleRecord> {
        Ok(TupleRecord {
            store: row.try_get("store").map_err(decode_error)?,
            object_type: row.try_get("object_type").map_err(decode_error)?,
            object_id: row.try_get("object_id").map_err(decode_error)?,
            relation: row.try_get("relation").map_err(decode_error)?,
            user: row.try_get("_user").map_err(decode_error)?,
            ulid: InsertionOrderId::from_stored(
                row.try_get::<String, _>("ulid").map_err(decode_error)?,
            ),
            inserted_at: row.try_get("inserted_at").map_err(decode_error)?,
        })
    }

    fn change_from_row(row: &DB::Row) -> StorageResult<ChangeRecord> {
        Ok(ChangeRecord {
            object_type: row.try_get("object_type").map_err(decode_error)?,
            object_id: row.try_get("object_id").map_err(decode_error)?,
            relation: row.try_get("relation").map_err(decode_error)?,
            user: row.try_get("_user").map_err(decode_error)?,
            operation: decode_operation(row.try_get("operation").map_err(decode_error)?)?,
            ulid: InsertionOrderId::from_stored(
                row.try_get::<String, _>("ulid").map_err(decode_error)?,
            ),
            inserted_at: row.try_get("inserted_at").map_err(decode_error)?,
        })
    }

    fn model_from_row(row: &DB::Row) -> StorageResult<ModelRecord> {
        Ok(ModelRecord {
            id: InsertionOrderId::from_stored(
                row.try_get::<String, _>("authorization_model_id")
                    .map_err(decode_error)?,
            ),
            inserted_at: row.try_get("inserted_at").map_err(decode_error)?,
        })
    }

    /// Applies deletes then writes on an open transaction.
    async fn apply_writes(
        &self,
        tx: &mut WriteTransaction<DB>,
        store_id: &str,
        writes: &[TupleKey],
        deletes: &[TupleKey],
    ) -> StorageResult<()> {
        for key in deletes {
            let statement = build_delete_tuple_statement(DB::DIALECT, store_id, key);
            let result = bind_statement::<DB>(&statement)
                .execute(tx.connection()?)
                .await
                .map_err(|e| map_write_error(e, key, TupleOperation::Delete))?;

            if DB::rows_affected(&result) == 0 {
                return Err(StorageError::InvalidWriteInput {
                    tuple_key: key.clone(),
                    operation: TupleOperation::Delete,
                });
            }
            self.append_change(tx.connection()?, store_id, key, TupleOperation::Delete)
                .await?;
        }

        for key in writes {
            let (ulid, inserted_at) = self.ids.next_id()?;
            let statement =
                build_insert_tuple_statement(DB::DIALECT, store_id, key, &ulid, inserted_at);
            bind_statement::<DB>(&statement)
                .execute(tx.connection()?)
                .await
                .map_err(|e| map_write_error(e, key, TupleOperation::Write))?;

            self.append_change(tx.connection()?, store_id, key, TupleOperation::Write)
                .await?;
        }

        Ok(())
    }

    async fn append_change(
        &self,
        conn: &mut DB::Connection,
        store_id: &str,
        key: &TupleKey,
        operation: TupleOperation,
    ) -> StorageResult<()> {
        let (ulid, inserted_at) = self.ids.next_id()?;
        let statement = build_insert_change_statement(
            DB::DIALECT,
            store_id,
            key,
            operation,
            &ulid,
            inserted_at,
        );
        bind_statement::<DB>(&statement)
            .execute(conn)
            .await
            .map_err(|e| map_write_error(e, key, operation))?;
        Ok(())
    }
}

#[async_trait]
impl<DB> DataStore for SqlDataStore<DB>
where
    DB: SqlBackend,
    for<'c> &'c mut DB::Connection: Executor<'c, Database = DB>,
    for<'q> DB::Arguments<'q>: IntoArguments<'q, DB>,
    for<'q> &'q str: Encode<'q, DB> + Type<DB>,
    for<'q> i16: Encode<'q, DB> + Decode<'q, DB> + Type<DB>,
    for<'q> i64: Encode<'q, DB> + Type<DB>,
    for<'q> DateTime<Utc>: Encode<'q, DB> + Decode<'q, DB> + Type<DB>,
    for<'r> String: Decode<'r, DB> + Type<DB>,
    for<'a> &'a str: ColumnIndex<DB::Row>,
{
    #[instrument(
        skip(self, writes, deletes),
        fields(backend = <DB as SqlBackend>::NAME, writes = writes.len(), deletes = deletes.len())
    )]
    async fn write_tuples(
        &self,
        store_id: &str,
        writes: Vec<TupleKey>,
        deletes: Vec<TupleKey>,
    ) -> StorageResult<()> {
        execute_with_timeout_and_metrics(<DB as SqlBackend>::NAME, "write_tuples", self.timeouts.write, async {
            let mut tx = WriteTransaction::begin(&self.pool).await?;
            match self.apply_writes(&mut tx, store_id, &writes, &deletes).await {
                Ok(()) => tx.commit().await,
                Err(e) => {
                    rollback_tx(&mut tx).await;
                    Err(e)
                }
            }
        })
        .await
    }

    #[instrument(skip(self), fields(backend = <DB as SqlBackend>::NAME))]
    async fn read_tuples(
        &self,
        store_id: &str,
        filter: &TupleFilter,
        pagination: &PaginationOptions,
    ) -> StorageResult<Page<Tuple>> {
        let statement = build_read_query(DB::DIALECT, store_id, filter, pagination)?;
        let (records, continuation_token) =
            execute_with_timeout_and_metrics(<DB as SqlBackend>::NAME, "read_tuples", self.timeouts.read, async {
                let rows = bind_statement::<DB>(&statement)
                    .fetch(&self.pool)
                    .map(|row| {
                        row.map_err(|e| map_sqlx_error(e, "failed to read tuples"))
                            .and_then(|row| Self::tuple_from_row(&row))
                    });
                TupleIterator::new(rows)
                    .materialize_page(pagination.page_size)
                    .await
            })
            .await?;

        Ok(Page {
            items: records.iter().map(TupleRecord::as_tuple).collect(),
            continuation_token,
        })
    }

    #[instrument(skip(self), fields(backend = <DB as SqlBackend>::NAME))]
    async fn read_userset_tuples(
        &self,
        store_id: &str,
        filter: &TupleFilter,
    ) -> StorageResult<Vec<Tuple>> {
        let statement = build_read_userset_tuples_query(DB::DIALECT, store_id, filter);
        let records = execute_with_timeout_and_metrics(
            <DB as SqlBackend>::NAME,
            "read_userset_tuples",
            self.timeouts.read,
            async {
                let rows = bind_statement::<DB>(&statement)
                    .fetch(&self.pool)
                    .map(|row| {
                        row.map_err(|e| map_sqlx_error(e, "failed to read userset tuples"))
                            .and_then(|row| Self::tuple_from_row(&row))
                    });
                TupleIterator::new(rows).collect_all().await
            },
        )
        .await?;

        Ok(records.iter().map(TupleRecord::as_tuple).collect())
    }

    #[instrument(skip(self), fields(backend = <DB as SqlBackend>::NAME))]
    async fn read_changes(
        &self,
        store_id: &str,
        object_type: Option<&str>,
        pagination: &PaginationOptions,
        horizon_offset: Duration,
    ) -> StorageResult<ChangesPage> {
        let effective = PaginationOptions::new(
            changes_page_size(pagination.page_size),
            pagination.from.clone(),
        );
        let statement = build_read_changes_query(
            DB::DIALECT,
            store_id,
            object_type,
            &effective,
            changes_horizon(horizon_offset)?,
        )?;
        let records =
            execute_with_timeout_and_metrics(<DB as SqlBackend>::NAME, "read_changes", self.timeouts.read, async {
                let rows = bind_statement::<DB>(&statement)
                    .fetch(&self.pool)
                    .map(|row| {
                        row.map_err(|e| map_sqlx_error(e, "failed to read changes"))
                            .and_then(|row| Self::change_from_row(&row))
                    });
                TupleIterator::new(rows).collect_all().await
            })
            .await?;

        Ok(ChangesPage::from_records(records, pagination.from.as_ref()))
    }

    #[instrument(skip(self, type_definitions), fields(backend = <DB as SqlBackend>::NAME))]
    async fn write_authorization_model(
        &self,
        store_id: &str,
        type_definitions: Vec<TypeDefinition>,
    ) -> StorageResult<String> {
        let encoded = serde_json::to_string(&type_definitions)
            .map_err(|e| StorageError::wrap("failed to encode type definitions", e))?;
        let (id, inserted_at) = self.ids.next_id()?;
        let statement = build_insert_authorization_model_statement(
            DB::DIALECT,
            store_id,
            &id,
            &encoded,
            inserted_at,
        );

        execute_with_timeout_and_metrics(
            <DB as SqlBackend>::NAME,
            "write_authorization_model",
            self.timeouts.write,
            async {
                bind_statement::<DB>(&statement)
                    .execute(&self.pool)
                    .await
                    .map_err(|e| map_sqlx_error(e, "failed to write authorization model"))
            },
        )
        .await?;

        Ok(id.to_string())
    }

    #[instrument(skip(self), fields(backend = <DB as SqlBackend>::NAME))]
    async fn read_authorization_model(
        &self,
        store_id: &str,
        model_id: &str,
    ) -> StorageResult<AuthorizationModel> {
        let statement = build_read_authorization_model_query(DB::DIALECT, store_id, model_id);
        let encoded: String = execute_with_timeout_and_metrics(
            <DB as SqlBackend>::NAME,
            "read_authorization_model",
            self.timeouts.read,
            async {
                let row = bind_statement::<DB>(&statement)
                    .fetch_one(&self.pool)
                    .await
                    .map_err(|e| map_sqlx_error(e, "failed to read authorization model"))?;
                row.try_get("type_definitions").map_err(decode_error)
            },
        )
        .await?;

        let type_definitions = serde_json::from_str(&encoded)
            .map_err(|e| StorageError::wrap("failed to decode type definitions", e))?;
        Ok(AuthorizationModel {
            id: model_id.to_string(),
            type_definitions,
        })
    }

    #[instrument(skip(self), fields(backend = <DB as SqlBackend>::NAME))]
    async fn find_latest_authorization_model_id(&self, store_id: &str) -> StorageResult<String> {
        let statement = build_latest_authorization_model_query(DB::DIALECT, store_id);
        let latest: Option<String> = execute_with_timeout_and_metrics(
            <DB as SqlBackend>::NAME,
            "find_latest_authorization_model_id",
            self.timeouts.read,
            async {
                let row = bind_statement::<DB>(&statement)
                    .fetch_optional(&self.pool)
                    .await
                    .map_err(|e| map_sqlx_error(e, "failed to find latest authorization model"))?;
                row.map(|row| row.try_get("authorization_model_id").map_err(decode_error))
                    .transpose()
            },
        )
        .await?;

        latest.ok_or(StorageError::NotFound)
    }

    #[instrument(skip(self), fields(backend = <DB as SqlBackend>::NAME))]
    async fn read_authorization_models(
        &self,
        store_id: &str,
        pagination: &PaginationOptions,
    ) -> StorageResult<Page<AuthorizationModelSummary>> {
        let statement = build_read_authorization_models_query(DB::DIALECT, store_id, pagination)?;
        let (records, continuation_token) = execute_with_timeout_and_metrics(
            <DB as SqlBackend>::NAME,
            "read_authorization_models",
            self.timeouts.read,
            async {
                let rows = bind_statement::<DB>(&statement)
                    .fetch(&self.pool)
                    .map(|row| {
                        row.map_err(|e| map_sqlx_error(e, "failed to read authorization models"))
                            .and_then(|row| Self::model_from_row(&row))
                    });
                TupleIterator::new(rows)
                    .materialize_page(pagination.page_size)
                    .await
            },
        )
        .await?;

        Ok(Page {
            items: records.iter().map(ModelRecord::as_summary).collect(),
            continuation_token,
        })
    }

    #[instrument(skip(self), fields(backend = <DB as SqlBackend>::NAME))]
    async fn health_check(&self) -> StorageResult<HealthStatus> {
        let start = Instant::now();
        execute_with_timeout_and_metrics(
            <DB as SqlBackend>::NAME,
            "health_check",
            self.timeouts.health_check,
            async {
                sqlx::query("SELECT 1")
                    .execute(&self.pool)
                    .await
                    .map_err(|e| map_sqlx_error(e, "database ping failed"))
            },
        )
        .await?;
        let latency = start.elapsed();

        // pool.size() counts every open connection, idle ones included
        let total_connections = self.pool.size();
        let idle_connections = self.pool.num_idle() as u32;
        let stats = PoolStats {
            active_connections: total_connections.saturating_sub(idle_connections),
            idle_connections,
            max_connections: self.pool.options().get_max_connections(),
        };
        record_pool_stats(<DB as SqlBackend>::NAME, &stats);

        Ok(HealthStatus {
            healthy: true,
            latency,
            pool_stats: Some(stats),
            message: Some(<DB as SqlBackend>::NAME.to_string()),
        })
    }
}

impl<DB: SqlBackend> fmt::Debug for SqlDataStore<DB> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(DB::STORE_NAME)
            .field("backend", &<DB as SqlBackend>::NAME)
            .field("timeouts", &self.timeouts)
            .finish()
    }
}
