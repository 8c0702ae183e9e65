//! Driver registry.
//!
//! Maps a [`BackendKind`] to the driver that serves it. The registry is built once at
//! start-up, shared by `Arc` and read-only afterwards.

use crate::db::driver::Driver;
use crate::db::sql::SqlDriver;
use crate::error::{DbError, DbResult};
use crate::models::BackendKind;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

#[derive(Clone)]
pub struct DriverRegistry {
    drivers: BTreeMap<BackendKind, Arc<dyn Driver>>,
}

impl std::fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}

impl DriverRegistry {
    pub fn builder() -> DriverRegistryBuilder {
        DriverRegistryBuilder::default()
    }

    /// Registry with every driver compiled into this build.
    pub fn with_builtins() -> Self {
        let builder = Self::builder()
            .register(SqlDriver::new(BackendKind::PostgreSQL))
            .register(SqlDriver::new(BackendKind::MySQL))
            .register(SqlDriver::new(BackendKind::SQLite));

        #[cfg(feature = "document-mongodb")]
        let builder = builder.register(crate::db::mongo::MongoDriver::new());

        builder.build()
    }

    /// Resolve the driver for a backend kind.
    pub fn resolve(&self, kind: BackendKind) -> DbResult<Arc<dyn Driver>> {
        self.drivers
            .get(&kind)
            .cloned()
            .ok_or_else(|| DbError::unsupported_backend(kind.tag()))
    }

    /// Resolve the driver for a raw backend tag.
    pub fn resolve_tag(&self, tag: &str) -> DbResult<Arc<dyn Driver>> {
        let kind = BackendKind::from_tag(tag).ok_or_else(|| DbError::unsupported_backend(tag))?;
        self.resolve(kind)
    }

    /// Registered backend kinds, in a stable order.
    pub fn kinds(&self) -> Vec<BackendKind> {
        self.drivers.keys().copied().collect()
    }
}

#[derive(Default)]
pub struct DriverRegistryBuilder {
    drivers: BTreeMap<BackendKind, Arc<dyn Driver>>,
}

impl DriverRegistryBuilder {
    /// Register a driver under its own kind. A later registration replaces an earlier one.
    pub fn register<D: Driver>(self, driver: D) -> Self {
        self.register_arc(Arc::new(driver))
    }

    pub fn register_arc(mut self, driver: Arc<dyn Driver>) -> Self {
        let kind = driver.kind();
        if self.drivers.insert(kind, driver).is_some() {
            debug!(backend = %kind, "Replacing previously registered driver");
        }
        self
    }

    pub fn build(self) -> DriverRegistry {
        DriverRegistry {
            drivers: self.drivers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtins_cover_relational_backends() {
        let registry = DriverRegistry::with_builtins();
        for kind in [BackendKind::PostgreSQL, BackendKind::MySQL, BackendKind::SQLite] {
            assert_eq!(registry.resolve(kind).unwrap().kind(), kind);
        }
        assert!(registry.kinds().contains(&BackendKind::SQLite));
    }

    #[cfg(not(feature = "document-mongodb"))]
    #[test]
    fn test_document_backend_unsupported_without_feature() {
        let registry = DriverRegistry::with_builtins();
        let err = registry.resolve(BackendKind::MongoDB).err().unwrap();
        assert!(matches!(err, DbError::UnsupportedBackend { .. }));
    }

    #[test]
    fn test_resolve_tag() {
        let registry = DriverRegistry::with_builtins();
        assert_eq!(
            registry.resolve_tag("pg").unwrap().kind(),
            BackendKind::PostgreSQL
        );
        let err = registry.resolve_tag("cassandra").err().unwrap();
        assert!(matches!(err, DbError::UnsupportedBackend { .. }));
    }

    #[test]
    fn test_empty_registry() {
        let registry = DriverRegistry::builder().build();
        assert!(registry.kinds().is_empty());
        assert!(registry.resolve(BackendKind::SQLite).is_err());
    }
}
