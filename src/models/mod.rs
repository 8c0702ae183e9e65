//! Data models for db-bridge.
//!
//! This module re-exports all model types used throughout the crate.

pub mod descriptor;
pub mod operation;
pub mod result;

// Re-export commonly used types
pub use descriptor::{
    BackendKind, ConnectionDescriptor, Credentials, DriverFamily, RawConfig, RetryPolicy, Target,
    Timeouts, TlsOptions,
};
pub use operation::{Operation, QueryParam, Statement, StatementKind};
pub use result::{CanonicalResult, CanonicalValue, ColumnMetadata, RawResult, RawValue, Record};
