//! Database abstraction layer.
//!
//! This module provides database access functionality:
//! - Driver capability traits and the driver registry
//! - Connection pool management
//! - Query and transaction execution
//! - Result normalization
//! - Relational drivers (sqlx) and, behind `document-mongodb`, the MongoDB driver

pub mod driver;
pub mod executor;
pub(crate) mod macros;
#[cfg(feature = "document-mongodb")]
pub mod mongo;
pub mod normalizer;
pub(crate) mod params;
pub mod pool;
pub mod registry;
pub mod sql;
pub mod transaction;
pub mod types;

pub use driver::{Driver, Session};
pub use executor::QueryExecutor;
pub use normalizer::ResultNormalizer;
pub use pool::{
    ConnectionPool, PoolManager, PoolPhase, PoolStatus, PooledConnection, ReleaseOutcome,
    ShutdownReport,
};
pub use registry::{DriverRegistry, DriverRegistryBuilder};
pub use sql::SqlDriver;
pub use transaction::TransactionScope;
