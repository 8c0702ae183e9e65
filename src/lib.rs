//! db-bridge Library
//!
//! Uniform connection pooling and query dispatch over heterogeneous database backends
//! (SQLite, PostgreSQL, MySQL and, behind the `document-mongodb` feature, MongoDB).

pub mod config;
pub mod db;
pub mod error;
pub mod models;

pub use config::Config;
pub use db::{DriverRegistry, PoolManager, QueryExecutor, ResultNormalizer};
pub use error::{DbError, DbResult};
pub use models::{CanonicalResult, ConnectionDescriptor, Operation, RawConfig, Statement};
