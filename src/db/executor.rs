//! Query execution engine.
//!
//! Runs an [`Operation`] against a connection lent by the pool:
//! - Single statements go straight to the session
//! - Transaction blocks are wrapped in begin/commit on the same connection, with exactly
//!   one rollback on the first failure
//! - Every session call is bounded by the descriptor's socket timeout when one is set
//!
//! Results come back driver-native ([`RawResult`]) or normalized ([`CanonicalResult`]).

use crate::db::normalizer::ResultNormalizer;
use crate::db::pool::PooledConnection;
use crate::db::transaction::TransactionScope;
use crate::error::{DbError, DbResult};
use crate::models::{CanonicalResult, Operation, RawResult, Statement};
use std::future::Future;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Query executor that dispatches operations to driver sessions.
#[derive(Debug, Clone, Default)]
pub struct QueryExecutor {
    /// Statement bound used when the descriptor sets no socket timeout.
    default_timeout: Option<Duration>,
}

impl QueryExecutor {
    /// Create a new query executor with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a query executor that bounds statements by `timeout` unless the
    /// descriptor sets its own socket timeout.
    pub fn with_default_timeout(timeout: Duration) -> Self {
        Self {
            default_timeout: Some(timeout),
        }
    }

    /// Run one operation and return the driver-native result.
    pub async fn run(&self, conn: &mut PooledConnection, op: &Operation) -> DbResult<RawResult> {
        match op {
            Operation::Statement(statement) => {
                execute_statement(conn, statement, self.default_timeout).await
            }
            Operation::Transaction(ops) => self.run_transaction(conn, ops).await,
        }
    }

    /// Run one operation and normalize the result.
    pub async fn run_normalized(
        &self,
        conn: &mut PooledConnection,
        op: &Operation,
    ) -> DbResult<CanonicalResult> {
        let raw = self.run(conn, op).await?;
        ResultNormalizer::normalize(conn.backend(), raw)
    }

    /// Start an interactive transaction on the connection.
    pub async fn begin<'c>(
        &self,
        conn: &'c mut PooledConnection,
    ) -> DbResult<TransactionScope<'c>> {
        TransactionScope::begin(conn, self.default_timeout).await
    }

    async fn run_transaction(
        &self,
        conn: &mut PooledConnection,
        ops: &[Operation],
    ) -> DbResult<RawResult> {
        // Validate the whole block before touching the backend
        if conn.in_transaction() {
            return Err(DbError::transaction_nesting(
                "connection is already inside a transaction",
            ));
        }
        let statements = ops
            .iter()
            .map(|op| match op {
                Operation::Statement(statement) => Ok(statement),
                Operation::Transaction(_) => Err(DbError::transaction_nesting(
                    "transaction blocks cannot contain other transaction blocks",
                )),
            })
            .collect::<DbResult<Vec<&Statement>>>()?;

        let start = Instant::now();
        let transaction_id = generate_transaction_id();
        begin_transaction(conn, self.default_timeout).await?;
        debug!(
            transaction_id = %transaction_id,
            backend = %conn.backend(),
            statements = statements.len(),
            "Transaction block started"
        );

        let mut results = Vec::with_capacity(statements.len());
        for (index, statement) in statements.into_iter().enumerate() {
            match execute_statement(conn, statement, self.default_timeout).await {
                Ok(result) => results.push(result),
                Err(e) => {
                    warn!(
                        transaction_id = %transaction_id,
                        backend = %conn.backend(),
                        statement_index = index,
                        error = %e,
                        "Statement failed, rolling back transaction"
                    );
                    return Err(rollback_after_failure(conn, e, self.default_timeout).await);
                }
            }
        }

        if let Err(e) = commit_transaction(conn, self.default_timeout).await {
            // Outcome unknown; the pool must not hand this session out again
            conn.mark_unhealthy();
            error!(
                transaction_id = %transaction_id,
                backend = %conn.backend(),
                error = %e,
                "Commit failed"
            );
            return Err(e);
        }

        info!(
            transaction_id = %transaction_id,
            backend = %conn.backend(),
            statements = results.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Transaction committed"
        );
        Ok(RawResult::Batch(results))
    }
}

/// Bound a session call by the statement timeout, if any.
async fn bounded<T>(
    limit: Option<Duration>,
    operation: &str,
    call: impl Future<Output = DbResult<T>>,
) -> DbResult<T> {
    match limit {
        Some(limit) => match timeout(limit, call).await {
            Ok(result) => result,
            Err(_) => Err(DbError::timeout(operation, limit)),
        },
        None => call.await,
    }
}

fn statement_limit(conn: &PooledConnection, default: Option<Duration>) -> Option<Duration> {
    conn.descriptor().timeouts().socket.or(default)
}

/// Connection-level failures leave the session unusable.
fn flag_fatal<T>(conn: &mut PooledConnection, result: &DbResult<T>) {
    if let Err(e) = result {
        if e.is_fatal() && conn.is_healthy() {
            warn!(
                backend = %conn.backend(),
                generation = conn.generation(),
                error = %e,
                "Connection marked unhealthy"
            );
            conn.mark_unhealthy();
        }
    }
}

pub(crate) async fn execute_statement(
    conn: &mut PooledConnection,
    statement: &Statement,
    default_timeout: Option<Duration>,
) -> DbResult<RawResult> {
    let limit = statement_limit(conn, default_timeout);
    debug!(
        backend = %conn.backend(),
        kind = ?statement.kind,
        params = statement.params.len(),
        "Executing statement"
    );
    let result = bounded(
        limit,
        "statement execution",
        conn.session()?.execute(statement),
    )
    .await;
    flag_fatal(conn, &result);
    result
}

pub(crate) async fn begin_transaction(
    conn: &mut PooledConnection,
    default_timeout: Option<Duration>,
) -> DbResult<()> {
    if conn.in_transaction() {
        return Err(DbError::transaction_nesting(
            "connection is already inside a transaction",
        ));
    }
    let limit = statement_limit(conn, default_timeout);
    let result = bounded(limit, "begin", conn.session()?.begin()).await;
    flag_fatal(conn, &result);
    result?;
    conn.set_in_transaction(true);
    Ok(())
}

pub(crate) async fn commit_transaction(
    conn: &mut PooledConnection,
    default_timeout: Option<Duration>,
) -> DbResult<()> {
    let limit = statement_limit(conn, default_timeout);
    let result = bounded(limit, "commit", conn.session()?.commit()).await;
    flag_fatal(conn, &result);
    result?;
    conn.set_in_transaction(false);
    Ok(())
}

pub(crate) async fn rollback_transaction(
    conn: &mut PooledConnection,
    default_timeout: Option<Duration>,
) -> DbResult<()> {
    let limit = statement_limit(conn, default_timeout);
    let result = match conn.session() {
        Ok(session) => bounded(limit, "rollback", session.rollback()).await,
        Err(e) => Err(e),
    };
    flag_fatal(conn, &result);
    match result {
        Ok(()) => {
            conn.set_in_transaction(false);
            Ok(())
        }
        Err(e) => {
            // Transaction state unknown
            conn.mark_unhealthy();
            Err(e)
        }
    }
}

/// Issue the single rollback that follows a failed statement.
///
/// Returns the error to surface: the original one, or both when the rollback failed too.
pub(crate) async fn rollback_after_failure(
    conn: &mut PooledConnection,
    original: DbError,
    default_timeout: Option<Duration>,
) -> DbError {
    match rollback_transaction(conn, default_timeout).await {
        Ok(()) => original,
        Err(rollback) => {
            error!(
                backend = %conn.backend(),
                error = %original,
                rollback_error = %rollback,
                "Rollback failed after statement error"
            );
            DbError::rollback_failed(original, rollback)
        }
    }
}

/// Generate a unique transaction ID.
pub(crate) fn generate_transaction_id() -> String {
    format!("tx_{}", uuid::Uuid::new_v4().simple())
}
