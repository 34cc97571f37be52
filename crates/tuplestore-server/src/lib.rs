//! tuplestore-server: service wiring over tuplestore-storage
//!
//! This crate contains:
//! - configuration loading (YAML + environment)
//! - logging setup
//! - datastore construction from configuration
//! - authorization model resolution
//! - the `TupleService` facade
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │              tuplestore-server              │
//! ├─────────────────────────────────────────────┤
//! │  config.rs   - ServerConfig loading         │
//! │  logging.rs  - tracing-subscriber setup     │
//! │  factory.rs  - DataStore construction       │
//! │  resolver.rs - model id resolution          │
//! │  service.rs  - TupleService facade          │
//! └─────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod factory;
pub mod logging;
pub mod resolver;
pub mod service;

// Re-exports for convenience
pub use config::{ChangelogSettings, ConfigLoadError, ServerConfig, StorageSettings};
pub use factory::{build_datastore, BuildError};
pub use logging::{init_logging, LoggingConfig};
pub use resolver::{AuthorizationModelResolver, ResolveError, ResolveResult};
pub use service::TupleService;
