//! tuplestore-storage: relationship tuple persistence
//!
//! This crate provides:
//! - the `DataStore` trait: tuple writes and filtered reads, the change log, and
//!   authorization model versions
//! - opaque continuation tokens backed by time-sortable insertion ids
//! - parameterized statements for PostgreSQL and MySQL
//! - in-memory, PostgreSQL and MySQL implementations
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────┐
//! │                tuplestore-storage                │
//! ├──────────────────────────────────────────────────┤
//! │  traits.rs      - DataStore trait and types      │
//! │  error.rs       - StorageError and mapping       │
//! │  cursor.rs      - insertion ids, tokens          │
//! │  query.rs       - statement builders             │
//! │  iterator.rs    - page materialization           │
//! │  transaction.rs - write transaction lifecycle    │
//! │  memory.rs      - in-memory implementation       │
//! │  sql.rs         - DataStore generic over sqlx    │
//! │  postgres.rs    - PostgreSQL config and schema   │
//! │  mysql.rs       - MySQL config and schema        │
//! └──────────────────────────────────────────────────┘
//! ```

pub mod cursor;
pub mod error;
mod iterator;
pub mod memory;
pub mod mysql;
pub mod postgres;
pub mod query;
mod sql;
pub mod traits;
pub mod transaction;

// Re-export commonly used types
pub use cursor::{ContinuationToken, InsertionOrderId};
pub use error::{HealthStatus, PoolStats, StorageError, StorageResult};
pub use memory::MemoryDataStore;
pub use mysql::{MySQLConfig, MySQLDataStore};
pub use postgres::{PostgresConfig, PostgresDataStore};
pub use sql::{SqlDataStore, DEFAULT_HEALTH_CHECK_TIMEOUT_SECS, DEFAULT_QUERY_TIMEOUT_SECS};
pub use traits::{
    AuthorizationModel, AuthorizationModelSummary, ChangesPage, DataStore, Page,
    PaginationOptions, Tuple, TupleChange, TupleFilter, TupleKey, TupleOperation, TypeDefinition,
    UserType, DEFAULT_CHANGES_PAGE_SIZE,
};
