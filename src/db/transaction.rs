//! Interactive transactions.
//!
//! A [`TransactionScope`] borrows a pooled connection for the lifetime of one
//! transaction. Statements run through the scope; the caller ends it with
//! [`TransactionScope::commit`] or [`TransactionScope::rollback`]. A scope dropped while
//! still open leaves the backend transaction in an unknown state, so the connection is
//! flagged unhealthy and the pool discards it on release.

use crate::db::executor::{
    begin_transaction, commit_transaction, execute_statement, generate_transaction_id,
    rollback_after_failure, rollback_transaction,
};
use crate::db::pool::PooledConnection;
use crate::error::DbResult;
use crate::models::{RawResult, Statement};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub struct TransactionScope<'c> {
    conn: &'c mut PooledConnection,
    id: String,
    started: Instant,
    statements: usize,
    default_timeout: Option<Duration>,
    finished: bool,
}

impl std::fmt::Debug for TransactionScope<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionScope")
            .field("id", &self.id)
            .field("backend", &self.conn.backend())
            .field("statements", &self.statements)
            .field("finished", &self.finished)
            .finish()
    }
}

impl<'c> TransactionScope<'c> {
    pub(crate) async fn begin(
        conn: &'c mut PooledConnection,
        default_timeout: Option<Duration>,
    ) -> DbResult<Self> {
        begin_transaction(conn, default_timeout).await?;
        let id = generate_transaction_id();
        info!(
            transaction_id = %id,
            backend = %conn.backend(),
            "Transaction started"
        );
        Ok(Self {
            conn,
            id,
            started: Instant::now(),
            statements: 0,
            default_timeout,
            finished: false,
        })
    }

    /// Identifier used in log lines for this transaction.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Run a statement inside the transaction.
    ///
    /// A failed statement does not end the scope; the caller decides whether to roll back.
    pub async fn execute(&mut self, statement: &Statement) -> DbResult<RawResult> {
        self.statements += 1;
        debug!(
            transaction_id = %self.id,
            statement_index = self.statements - 1,
            "Executing statement in transaction"
        );
        execute_statement(self.conn, statement, self.default_timeout).await
    }

    pub async fn commit(mut self) -> DbResult<()> {
        self.finished = true;
        match commit_transaction(self.conn, self.default_timeout).await {
            Ok(()) => {
                info!(
                    transaction_id = %self.id,
                    statements = self.statements,
                    elapsed_ms = self.started.elapsed().as_millis() as u64,
                    "Transaction committed"
                );
                Ok(())
            }
            Err(e) => {
                self.conn.mark_unhealthy();
                warn!(transaction_id = %self.id, error = %e, "Commit failed");
                Err(e)
            }
        }
    }

    pub async fn rollback(mut self) -> DbResult<()> {
        self.finished = true;
        rollback_transaction(self.conn, self.default_timeout).await?;
        info!(
            transaction_id = %self.id,
            statements = self.statements,
            elapsed_ms = self.started.elapsed().as_millis() as u64,
            "Transaction rolled back"
        );
        Ok(())
    }

    /// Roll back because of `error`, returning the error the caller should surface.
    pub async fn abort(mut self, error: crate::error::DbError) -> crate::error::DbError {
        self.finished = true;
        rollback_after_failure(self.conn, error, self.default_timeout).await
    }
}

impl Drop for TransactionScope<'_> {
    fn drop(&mut self) {
        if !self.finished {
            warn!(
                transaction_id = %self.id,
                backend = %self.conn.backend(),
                "Transaction dropped without commit or rollback, discarding connection"
            );
            self.conn.mark_unhealthy();
        }
    }
}
