//! Connection pool management.
//!
//! One [`ConnectionPool`] owns a bounded set of live sessions for one descriptor.
//! [`PoolManager`] keeps one pool per descriptor and creates pools on demand through
//! the driver registry.
//!
//! # Concurrency
//!
//! - All bookkeeping lives in one `std::sync::Mutex<PoolState>` per pool, never held
//!   across an await point
//! - Waiters are served strictly FIFO through `oneshot` hand-offs: a released connection
//!   or a freed slot goes straight to the head waiter
//! - `idle + in_use + opening <= max` holds at every unlock
//! - Dropping an in-flight `acquire` gives back anything it had reserved

use crate::db::driver::{Driver, Session};
use crate::db::registry::DriverRegistry;
use crate::error::{DbError, DbResult};
use crate::models::{BackendKind, ConnectionDescriptor};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{Notify, RwLock, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Lifecycle phase of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolPhase {
    Empty,
    Warming,
    Steady,
    Draining,
    Closed,
}

impl PoolPhase {
    fn accepting(&self) -> bool {
        matches!(self, Self::Empty | Self::Warming | Self::Steady)
    }
}

/// How a borrower hands a connection back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Reusable,
    Broken,
}

/// Snapshot of a pool for observability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    pub backend: BackendKind,
    pub phase: PoolPhase,
    pub idle: usize,
    pub in_use: usize,
    pub opening: usize,
    pub waiters: usize,
    pub min_connections: u32,
    pub max_connections: u32,
    pub opened_total: u64,
    pub closed_total: u64,
}

/// Outcome of [`ConnectionPool::shutdown`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    pub backend: BackendKind,
    /// False when leases were still out at the deadline and had to be revoked.
    pub complete: bool,
    pub closed_idle: usize,
    pub waiters_failed: usize,
    pub revoked_leases: usize,
}

struct IdleConnection {
    session: Box<dyn Session>,
    generation: u64,
    created_at: Instant,
    idle_since: Instant,
    uses: u64,
}

enum Grant {
    Connection(IdleConnection),
    /// A freed slot, already counted in `opening` on behalf of the waiter.
    Slot,
}

struct Waiter {
    id: u64,
    sender: oneshot::Sender<Grant>,
}

struct PoolState {
    phase: PoolPhase,
    /// Most recently returned at the back.
    idle: VecDeque<IdleConnection>,
    in_use: usize,
    opening: usize,
    waiters: VecDeque<Waiter>,
    next_waiter_id: u64,
}

impl PoolState {
    fn total(&self) -> usize {
        self.idle.len() + self.in_use + self.opening
    }

    /// Give a freed slot to the head waiter. Returns false when nobody is waiting.
    fn hand_off_slot(&mut self) -> bool {
        while let Some(waiter) = self.waiters.pop_front() {
            self.opening += 1;
            if waiter.sender.send(Grant::Slot).is_ok() {
                return true;
            }
            self.opening -= 1;
        }
        false
    }

    /// Give a returned connection to the head waiter, or hand it back if nobody is waiting.
    fn hand_off_connection(&mut self, mut conn: IdleConnection) -> Option<IdleConnection> {
        while let Some(waiter) = self.waiters.pop_front() {
            match waiter.sender.send(Grant::Connection(conn)) {
                Ok(()) => {
                    self.in_use += 1;
                    return None;
                }
                Err(Grant::Connection(returned)) => conn = returned,
                Err(Grant::Slot) => return None,
            }
        }
        Some(conn)
    }

    fn remove_waiter(&mut self, id: u64) -> bool {
        match self.waiters.iter().position(|w| w.id == id) {
            Some(pos) => {
                self.waiters.remove(pos);
                true
            }
            None => false,
        }
    }
}

/// Bounded pool of live sessions for one descriptor.
pub struct ConnectionPool {
    descriptor: Arc<ConnectionDescriptor>,
    driver: Arc<dyn Driver>,
    state: Mutex<PoolState>,
    /// Signalled whenever a lease or an in-flight open ends.
    drained: Notify,
    revoked: AtomicBool,
    next_generation: AtomicU64,
    opened_total: AtomicU64,
    closed_total: AtomicU64,
    /// Eviction task handle. Uses std::sync::Mutex for synchronous storage.
    eviction_handle: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("target", &self.descriptor.masked_target())
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl ConnectionPool {
    /// Create a pool and start its idle-eviction task.
    ///
    /// Must be called from within a tokio runtime. No connection is opened until the
    /// first `acquire` or `warm`.
    pub fn new(descriptor: ConnectionDescriptor, driver: Arc<dyn Driver>) -> Arc<Self> {
        let pool = Arc::new(Self {
            descriptor: Arc::new(descriptor),
            driver,
            state: Mutex::new(PoolState {
                phase: PoolPhase::Empty,
                idle: VecDeque::new(),
                in_use: 0,
                opening: 0,
                waiters: VecDeque::new(),
                next_waiter_id: 0,
            }),
            drained: Notify::new(),
            revoked: AtomicBool::new(false),
            next_generation: AtomicU64::new(1),
            opened_total: AtomicU64::new(0),
            closed_total: AtomicU64::new(0),
            eviction_handle: Mutex::new(None),
        });

        // Weak reference so the task never keeps the pool alive
        let weak_pool = Arc::downgrade(&pool);
        let interval = pool.descriptor.eviction_interval();
        let handle = tokio::spawn(async move {
            Self::eviction_task(weak_pool, interval).await;
        });
        *pool
            .eviction_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);

        pool
    }

    pub fn descriptor(&self) -> &ConnectionDescriptor {
        &self.descriptor
    }

    pub fn backend(&self) -> BackendKind {
        self.descriptor.kind()
    }

    fn lock_state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Borrow a connection, waiting at most `timeout` (default: the descriptor's
    /// queue-wait timeout) for one to become available.
    pub async fn acquire(self: &Arc<Self>, timeout: Option<Duration>) -> DbResult<PooledConnection> {
        let timeout = timeout.unwrap_or(self.descriptor.timeouts().queue);
        let started = Instant::now();

        loop {
            enum Step {
                Idle(IdleConnection),
                Open,
                Wait(u64, oneshot::Receiver<Grant>),
            }

            let step = {
                let mut state = self.lock_state();
                if !state.phase.accepting() {
                    return Err(DbError::pool_closed(self.backend()));
                }
                if let Some(conn) = state.idle.pop_back() {
                    state.in_use += 1;
                    Step::Idle(conn)
                } else if state.total() < self.descriptor.max_connections() as usize {
                    state.opening += 1;
                    Step::Open
                } else {
                    let (sender, receiver) = oneshot::channel();
                    let id = state.next_waiter_id;
                    state.next_waiter_id += 1;
                    state.waiters.push_back(Waiter { id, sender });
                    Step::Wait(id, receiver)
                }
            }; // Lock released here

            match step {
                Step::Idle(conn) => {
                    let mut lease = self.lend(conn);
                    if !self.descriptor.test_before_acquire() || lease.ping().await {
                        debug!(
                            backend = %self.backend(),
                            generation = lease.generation,
                            "Reusing idle connection"
                        );
                        return Ok(lease);
                    }
                    warn!(
                        backend = %self.backend(),
                        generation = lease.generation,
                        "Idle connection failed health check, discarding"
                    );
                    self.release(lease, ReleaseOutcome::Broken);
                }
                Step::Open => {
                    let reservation = OpenReservation::new(self);
                    return reservation.open().await;
                }
                Step::Wait(id, receiver) => {
                    return self.wait_for_grant(id, receiver, timeout, started).await;
                }
            }
        }
    }

    async fn wait_for_grant(
        self: &Arc<Self>,
        id: u64,
        receiver: oneshot::Receiver<Grant>,
        timeout: Duration,
        started: Instant,
    ) -> DbResult<PooledConnection> {
        let mut guard = WaiterGuard {
            pool: self,
            id,
            receiver: Some(receiver),
        };
        let remaining = timeout.saturating_sub(started.elapsed());
        debug!(
            backend = %self.backend(),
            waiter = id,
            remaining_ms = remaining.as_millis() as u64,
            "Pool at capacity, waiting"
        );

        let received = match guard.receiver.as_mut() {
            Some(receiver) => tokio::time::timeout(remaining, receiver).await,
            None => return Err(DbError::internal("waiter receiver missing")),
        };

        let grant = match received {
            Ok(Ok(grant)) => grant,
            // Sender dropped: the pool is shutting down
            Ok(Err(_)) => {
                guard.disarm();
                return Err(DbError::pool_closed(self.backend()));
            }
            Err(_) => {
                let still_queued = self.lock_state().remove_waiter(id);
                let mut receiver = guard.disarm();
                if still_queued {
                    debug!(backend = %self.backend(), waiter = id, "Acquire timed out");
                    return Err(DbError::pool_timeout(
                        self.backend(),
                        started.elapsed().as_millis() as u64,
                    ));
                }
                // Granted right at the deadline: use it rather than drop it
                match receiver.as_mut().map(|r| r.try_recv()) {
                    Some(Ok(grant)) => grant,
                    _ => return Err(DbError::pool_closed(self.backend())),
                }
            }
        };
        guard.disarm();

        match grant {
            Grant::Connection(conn) => Ok(self.lend(conn)),
            Grant::Slot => OpenReservation::new(self).open().await,
        }
    }

    /// Wrap an idle connection into a lease. The caller already counted it in `in_use`.
    fn lend(self: &Arc<Self>, conn: IdleConnection) -> PooledConnection {
        PooledConnection {
            session: Some(conn.session),
            pool: Arc::clone(self),
            generation: conn.generation,
            created_at: conn.created_at,
            uses: conn.uses,
            healthy: true,
            in_transaction: false,
        }
    }

    /// Return a connection to the pool.
    ///
    /// `Reusable` connections go to the head waiter or to the idle set. `Broken` ones,
    /// and any connection flagged unhealthy or still inside a transaction, are closed
    /// and their slot is handed on.
    pub fn release(&self, mut conn: PooledConnection, outcome: ReleaseOutcome) {
        let Some(session) = conn.session.take() else {
            return;
        };
        let reusable = outcome == ReleaseOutcome::Reusable && conn.healthy && !conn.in_transaction;
        conn.pool.return_session(
            IdleConnection {
                session,
                generation: conn.generation,
                created_at: conn.created_at,
                idle_since: Instant::now(),
                uses: conn.uses,
            },
            reusable,
        );
    }

    fn return_session(&self, conn: IdleConnection, reusable: bool) {
        let generation = conn.generation;
        let to_close = {
            let mut state = self.lock_state();
            state.in_use = state.in_use.saturating_sub(1);
            let accepting = state.phase.accepting() && !self.revoked.load(Ordering::Acquire);
            if reusable && accepting {
                if let Some(conn) = state.hand_off_connection(conn) {
                    state.idle.push_back(conn);
                }
                None
            } else {
                if accepting {
                    state.hand_off_slot();
                }
                Some(conn)
            }
        }; // Lock released here
        self.drained.notify_waiters();

        match to_close {
            Some(conn) => {
                debug!(backend = %self.backend(), generation, "Closing released connection");
                self.spawn_close(conn.session);
            }
            None => debug!(backend = %self.backend(), generation, "Connection returned to pool"),
        }
    }

    fn spawn_close(&self, session: Box<dyn Session>) {
        self.closed_total.fetch_add(1, Ordering::Relaxed);
        let backend = self.backend();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = session.close().await {
                        debug!(backend = %backend, error = %e, "Error while closing connection");
                    }
                });
            }
            // No runtime left to close on; dropping the session tears it down
            Err(_) => drop(session),
        }
    }

    async fn close_now(&self, session: Box<dyn Session>) {
        self.closed_total.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = session.close().await {
            debug!(backend = %self.backend(), error = %e, "Error while closing connection");
        }
    }

    /// Open a session, retrying retryable failures with exponential backoff.
    async fn open_with_retry(&self) -> DbResult<Box<dyn Session>> {
        let policy = *self.descriptor.retry();
        let connect_timeout = self.descriptor.timeouts().connect;
        let mut attempt = 0;

        loop {
            attempt += 1;
            let result =
                match tokio::time::timeout(connect_timeout, self.driver.open(&self.descriptor))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(DbError::timeout("connect", connect_timeout)),
                };

            match result {
                Ok(session) => {
                    self.opened_total.fetch_add(1, Ordering::Relaxed);
                    debug!(backend = %self.backend(), attempt, "Opened connection");
                    return Ok(session);
                }
                Err(e) if e.is_retryable() && attempt < policy.attempts => {
                    let delay = policy.backoff(attempt);
                    warn!(
                        backend = %self.backend(),
                        target = %self.descriptor.masked_target(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Failed to open connection, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    warn!(
                        backend = %self.backend(),
                        target = %self.descriptor.masked_target(),
                        attempt,
                        error = %e,
                        "Failed to open connection"
                    );
                    return Err(match e {
                        DbError::Timeout { .. } => DbError::connection(
                            format!(
                                "Timed out connecting to {} after {} attempt(s)",
                                self.backend(),
                                attempt
                            ),
                            "Check that the server is reachable or raise connect_timeout_ms",
                        ),
                        other => other,
                    });
                }
            }
        }
    }

    /// Pre-open connections until `min_connections` are live. Returns how many were opened.
    pub async fn warm(self: &Arc<Self>) -> DbResult<usize> {
        let min = self.descriptor.min_connections() as usize;
        {
            let mut state = self.lock_state();
            if state.phase == PoolPhase::Empty {
                state.phase = PoolPhase::Warming;
            }
        }

        let mut opened = 0;
        let result = loop {
            {
                let mut state = self.lock_state();
                if !state.phase.accepting() {
                    break Err(DbError::pool_closed(self.backend()));
                }
                if state.total() >= min {
                    break Ok(opened);
                }
                state.opening += 1;
            }
            match OpenReservation::new(self).open_idle().await {
                Ok(()) => opened += 1,
                Err(e) => break Err(e),
            }
        };

        {
            let mut state = self.lock_state();
            if state.phase == PoolPhase::Warming {
                state.phase = if state.total() > 0 {
                    PoolPhase::Steady
                } else {
                    PoolPhase::Empty
                };
            }
        }
        info!(
            backend = %self.backend(),
            target = %self.descriptor.masked_target(),
            opened,
            min,
            "Pool warmed"
        );
        result
    }

    /// Close connections idle longer than the idle timeout. Returns how many were closed.
    ///
    /// Only goes below `min_connections` when nobody is waiting.
    pub async fn evict_idle(&self) -> usize {
        let idle_timeout = self.descriptor.timeouts().idle;
        let min = self.descriptor.min_connections() as usize;

        let expired: Vec<IdleConnection> = {
            let mut state = self.lock_state();
            if !state.phase.accepting() {
                return 0;
            }
            let now = Instant::now();
            let protect_min = !state.waiters.is_empty();
            let mut total = state.total();
            let mut retained = VecDeque::with_capacity(state.idle.len());
            let mut expired = Vec::new();
            while let Some(conn) = state.idle.pop_front() {
                let stale = now.saturating_duration_since(conn.idle_since) > idle_timeout;
                if stale && !(protect_min && total <= min) {
                    total -= 1;
                    expired.push(conn);
                } else {
                    retained.push_back(conn);
                }
            }
            state.idle = retained;
            expired
        }; // Lock released here

        let count = expired.len();
        for conn in expired {
            debug!(
                backend = %self.backend(),
                generation = conn.generation,
                uses = conn.uses,
                "Evicting idle connection"
            );
            self.close_now(conn.session).await;
        }
        if count > 0 {
            info!(backend = %self.backend(), evicted = count, "Evicted idle connections");
        }
        count
    }

    /// Background task evicting idle connections.
    ///
    /// Uses a Weak reference to the pool to avoid keeping it alive.
    /// The task exits when the pool is dropped or closed.
    async fn eviction_task(weak_pool: Weak<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            ticker.tick().await;

            let Some(pool) = weak_pool.upgrade() else {
                debug!("Connection pool dropped, eviction task exiting");
                return;
            };
            if pool.lock_state().phase == PoolPhase::Closed {
                return;
            }
            pool.evict_idle().await;
        }
    }

    /// Drain and close the pool.
    ///
    /// Queued waiters fail with `PoolClosed`, idle connections are closed, and lent
    /// connections are awaited up to `timeout` (default: the descriptor's shutdown
    /// timeout). Leases still out at the deadline are revoked.
    pub async fn shutdown(&self, timeout: Option<Duration>) -> ShutdownReport {
        let timeout = timeout.unwrap_or(self.descriptor.timeouts().shutdown);

        let (idle, waiters) = {
            let mut state = self.lock_state();
            if state.phase == PoolPhase::Closed {
                return ShutdownReport {
                    backend: self.backend(),
                    complete: true,
                    closed_idle: 0,
                    waiters_failed: 0,
                    revoked_leases: 0,
                };
            }
            state.phase = PoolPhase::Draining;
            (
                std::mem::take(&mut state.idle),
                std::mem::take(&mut state.waiters),
            )
        }; // Lock released here

        info!(
            backend = %self.backend(),
            target = %self.descriptor.masked_target(),
            "Shutting down connection pool"
        );

        if let Some(handle) = self
            .eviction_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }

        // Dropping the senders fails every queued acquire with PoolClosed
        let waiters_failed = waiters.len();
        drop(waiters);

        let closed_idle = idle.len();
        for conn in idle {
            self.close_now(conn.session).await;
        }

        let drained = tokio::time::timeout(timeout, self.wait_for_leases()).await.is_ok();
        let revoked_leases = if drained {
            0
        } else {
            self.revoked.store(true, Ordering::Release);
            self.lock_state().in_use
        };

        self.lock_state().phase = PoolPhase::Closed;

        if drained {
            info!(backend = %self.backend(), closed_idle, "Connection pool closed");
        } else {
            warn!(
                backend = %self.backend(),
                revoked_leases,
                timeout_ms = timeout.as_millis() as u64,
                "Shutdown timed out, outstanding leases revoked"
            );
        }

        ShutdownReport {
            backend: self.backend(),
            complete: drained,
            closed_idle,
            waiters_failed,
            revoked_leases,
        }
    }

    async fn wait_for_leases(&self) {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let state = self.lock_state();
                if state.in_use == 0 && state.opening == 0 {
                    return;
                }
            }
            notified.await;
        }
    }

    pub fn status(&self) -> PoolStatus {
        let state = self.lock_state();
        PoolStatus {
            backend: self.backend(),
            phase: state.phase,
            idle: state.idle.len(),
            in_use: state.in_use,
            opening: state.opening,
            waiters: state.waiters.len(),
            min_connections: self.descriptor.min_connections(),
            max_connections: self.descriptor.max_connections(),
            opened_total: self.opened_total.load(Ordering::Relaxed),
            closed_total: self.closed_total.load(Ordering::Relaxed),
        }
    }
}

/// A slot counted in `opening`. Dropping it unused gives the slot back.
struct OpenReservation<'a> {
    pool: &'a Arc<ConnectionPool>,
    armed: bool,
}

impl<'a> OpenReservation<'a> {
    fn new(pool: &'a Arc<ConnectionPool>) -> Self {
        Self { pool, armed: true }
    }

    /// Open a session and lend it to the caller.
    async fn open(mut self) -> DbResult<PooledConnection> {
        let session = self.pool.open_with_retry().await?;
        let generation = self.pool.next_generation.fetch_add(1, Ordering::Relaxed);
        self.armed = false;

        let accepted = {
            let mut state = self.pool.lock_state();
            state.opening -= 1;
            if state.phase.accepting() {
                state.in_use += 1;
                if state.phase == PoolPhase::Empty {
                    state.phase = PoolPhase::Steady;
                }
                true
            } else {
                false
            }
        };
        self.pool.drained.notify_waiters();

        if !accepted {
            self.pool.close_now(session).await;
            return Err(DbError::pool_closed(self.pool.backend()));
        }
        let now = Instant::now();
        Ok(PooledConnection {
            session: Some(session),
            pool: Arc::clone(self.pool),
            generation,
            created_at: now,
            uses: 0,
            healthy: true,
            in_transaction: false,
        })
    }

    /// Open a session straight into the idle set (or to the head waiter).
    async fn open_idle(mut self) -> DbResult<()> {
        let session = self.pool.open_with_retry().await?;
        let generation = self.pool.next_generation.fetch_add(1, Ordering::Relaxed);
        self.armed = false;
        let now = Instant::now();
        let conn = IdleConnection {
            session,
            generation,
            created_at: now,
            idle_since: now,
            uses: 0,
        };

        let rejected = {
            let mut state = self.pool.lock_state();
            state.opening -= 1;
            if state.phase.accepting() {
                if let Some(conn) = state.hand_off_connection(conn) {
                    state.idle.push_back(conn);
                }
                None
            } else {
                Some(conn)
            }
        };
        self.pool.drained.notify_waiters();

        match rejected {
            Some(conn) => {
                self.pool.close_now(conn.session).await;
                Err(DbError::pool_closed(self.pool.backend()))
            }
            None => Ok(()),
        }
    }
}

impl Drop for OpenReservation<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        {
            let mut state = self.pool.lock_state();
            state.opening -= 1;
            if state.phase.accepting() {
                state.hand_off_slot();
            }
        }
        self.pool.drained.notify_waiters();
    }
}

/// Removes a queued waiter if its `acquire` is dropped, returning anything already granted.
struct WaiterGuard<'a> {
    pool: &'a Arc<ConnectionPool>,
    id: u64,
    receiver: Option<oneshot::Receiver<Grant>>,
}

impl WaiterGuard<'_> {
    fn disarm(&mut self) -> Option<oneshot::Receiver<Grant>> {
        self.receiver.take()
    }
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        let Some(mut receiver) = self.receiver.take() else {
            return;
        };
        if self.pool.lock_state().remove_waiter(self.id) {
            return;
        }
        match receiver.try_recv() {
            Ok(Grant::Connection(conn)) => self.pool.return_session(conn, true),
            Ok(Grant::Slot) => drop(OpenReservation::new(self.pool)),
            Err(_) => {}
        }
    }
}

/// A connection lent by a pool. Owned exclusively by the borrower.
///
/// Hand it back with [`ConnectionPool::release`]. Dropping it also returns it, with a
/// warning.
pub struct PooledConnection {
    session: Option<Box<dyn Session>>,
    pool: Arc<ConnectionPool>,
    generation: u64,
    created_at: Instant,
    uses: u64,
    healthy: bool,
    in_transaction: bool,
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("backend", &self.backend())
            .field("generation", &self.generation)
            .field("uses", &self.uses)
            .field("healthy", &self.healthy)
            .field("in_transaction", &self.in_transaction)
            .finish_non_exhaustive()
    }
}

impl PooledConnection {
    pub fn backend(&self) -> BackendKind {
        self.pool.backend()
    }

    pub fn descriptor(&self) -> &ConnectionDescriptor {
        self.pool.descriptor()
    }

    /// Monotonic per-pool open counter; a new number means a new backend session.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn uses(&self) -> u64 {
        self.uses
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy
    }

    /// Flag the connection so the pool discards it on release.
    pub fn mark_unhealthy(&mut self) {
        self.healthy = false;
    }

    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    pub(crate) fn set_in_transaction(&mut self, in_transaction: bool) {
        self.in_transaction = in_transaction;
    }

    /// True once a forced shutdown revoked this lease.
    pub fn is_revoked(&self) -> bool {
        self.pool.revoked.load(Ordering::Acquire)
    }

    /// The live session, unless the lease was revoked.
    pub(crate) fn session(&mut self) -> DbResult<&mut Box<dyn Session>> {
        if self.is_revoked() {
            return Err(DbError::pool_closed(self.backend()));
        }
        match self.session.as_mut() {
            Some(session) => {
                self.uses += 1;
                Ok(session)
            }
            None => Err(DbError::internal("connection already released")),
        }
    }

    async fn ping(&mut self) -> bool {
        match self.session.as_mut() {
            Some(session) => session.ping().await,
            None => false,
        }
    }

    /// Release back to the owning pool.
    pub fn release(self, outcome: ReleaseOutcome) {
        let pool = Arc::clone(&self.pool);
        pool.release(self, outcome);
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        warn!(
            backend = %self.backend(),
            generation = self.generation,
            "Connection released via Drop - consider using explicit release()"
        );
        let reusable = self.healthy && !self.in_transaction;
        self.pool.return_session(
            IdleConnection {
                session,
                generation: self.generation,
                created_at: self.created_at,
                idle_since: Instant::now(),
                uses: self.uses,
            },
            reusable,
        );
    }
}

/// Keeps one pool per descriptor.
pub struct PoolManager {
    registry: Arc<DriverRegistry>,
    pools: RwLock<HashMap<String, Arc<ConnectionPool>>>,
}

impl std::fmt::Debug for PoolManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolManager")
            .field("registry", &self.registry)
            .field("pool_count", &self.pools.try_read().map(|p| p.len()).unwrap_or(0))
            .finish()
    }
}

impl PoolManager {
    pub fn new(registry: Arc<DriverRegistry>) -> Self {
        Self {
            registry,
            pools: RwLock::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<DriverRegistry> {
        &self.registry
    }

    /// Equal descriptors produce equal keys.
    fn pool_key(descriptor: &ConnectionDescriptor) -> DbResult<String> {
        serde_json::to_string(&descriptor.to_raw())
            .map_err(|e| DbError::internal(format!("Failed to key descriptor: {}", e)))
    }

    /// Get the pool for a descriptor, creating it on first use.
    pub async fn pool(&self, descriptor: &ConnectionDescriptor) -> DbResult<Arc<ConnectionPool>> {
        let key = Self::pool_key(descriptor)?;
        {
            let pools = self.pools.read().await;
            if let Some(pool) = pools.get(&key) {
                return Ok(Arc::clone(pool));
            }
        }

        let driver = self.registry.resolve(descriptor.kind())?;
        let mut pools = self.pools.write().await;
        // Double-check after acquiring write lock
        if let Some(pool) = pools.get(&key) {
            return Ok(Arc::clone(pool));
        }
        info!(
            backend = %descriptor.kind(),
            target = %descriptor.masked_target(),
            max_connections = descriptor.max_connections(),
            "Creating connection pool"
        );
        let pool = ConnectionPool::new(descriptor.clone(), driver);
        pools.insert(key, Arc::clone(&pool));
        Ok(pool)
    }

    /// Acquire a connection from the descriptor's pool.
    pub async fn acquire(
        &self,
        descriptor: &ConnectionDescriptor,
        timeout: Option<Duration>,
    ) -> DbResult<PooledConnection> {
        self.pool(descriptor).await?.acquire(timeout).await
    }

    pub async fn pool_count(&self) -> usize {
        self.pools.read().await.len()
    }

    pub async fn statuses(&self) -> Vec<PoolStatus> {
        let pools = self.pools.read().await;
        pools.values().map(|pool| pool.status()).collect()
    }

    /// Shut down every pool and forget them.
    pub async fn shutdown_all(&self, timeout: Option<Duration>) -> Vec<ShutdownReport> {
        // Drain pools under lock, shut down outside lock
        let pools: Vec<Arc<ConnectionPool>> = {
            let mut pools = self.pools.write().await;
            pools.drain().map(|(_, pool)| pool).collect()
        };

        let mut reports = Vec::with_capacity(pools.len());
        for pool in pools {
            reports.push(pool.shutdown(timeout).await);
        }
        reports
    }
}
