//! Driver capability traits.
//!
//! A [`Driver`] knows how to open a [`Session`] for one backend kind. Everything above
//! this seam (pools, executor) talks to sessions only through these traits and never
//! branches on the backend tag.

use crate::error::DbResult;
use crate::models::{BackendKind, ConnectionDescriptor, DriverFamily, RawResult, Statement};
use async_trait::async_trait;

/// Factory for live backend sessions.
#[async_trait]
pub trait Driver: Send + Sync + 'static {
    fn kind(&self) -> BackendKind;

    fn family(&self) -> DriverFamily {
        self.kind().family()
    }

    /// Open one backend session. Implementations should not retry; the pool does.
    async fn open(&self, descriptor: &ConnectionDescriptor) -> DbResult<Box<dyn Session>>;
}

/// One live backend connection.
#[async_trait]
pub trait Session: Send + 'static {
    /// Run a single statement. Parameters are bound by the driver, never interpolated.
    async fn execute(&mut self, statement: &Statement) -> DbResult<RawResult>;

    async fn begin(&mut self) -> DbResult<()>;

    async fn commit(&mut self) -> DbResult<()>;

    async fn rollback(&mut self) -> DbResult<()>;

    /// Health check. Returns `false` when the session is no longer usable.
    async fn ping(&mut self) -> bool;

    async fn close(self: Box<Self>) -> DbResult<()>;
}
