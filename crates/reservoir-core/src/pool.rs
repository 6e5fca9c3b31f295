//! Connection pool
//!
//! Owns the sessions opened against one backing store and lends them to
//! callers one at a time.
//!
//! - `allocate` hands out an idle session, growing the pool by one when none
//!   is idle and blocking only once `max_connections` is reached
//! - sessions come back when the [`PooledConnection`] guard is dropped (or
//!   passed to [`ConnectionPool::release`])
//! - the pool never shrinks; `shutdown` closes idle sessions at once and
//!   in-use ones as they come back
//!
//! A single mutex guards the idle list and in-use bookkeeping. It is never
//! held while a session is opened, closed or used.

use std::collections::HashSet;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex, MutexGuard};
use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::connection::{Backend, Capabilities, Connection};
use crate::storage::{ErrorRecord, StorageError, StorageResult};

/// Pool sizing and retry settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Sessions opened up front by [`ConnectionPool::new`]
    pub initial_size: usize,
    /// Cap on open sessions; `None` grows without bound
    pub max_connections: Option<usize>,
    /// Extra attempts when opening a session fails with a retryable error
    pub connect_retries: u32,
    /// Pause between those attempts
    pub retry_backoff: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            initial_size: 5,
            max_connections: None,
            connect_retries: 3,
            retry_backoff: Duration::from_millis(50),
        }
    }
}

/// Point-in-time pool counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub idle: usize,
    pub in_use: usize,
    pub total: usize,
    pub closed: bool,
}

struct Session {
    id: u64,
    conn: Box<dyn Connection>,
}

#[derive(Default)]
struct PoolState {
    idle: Vec<Session>,
    in_use: HashSet<u64>,
    /// Sessions open: idle plus in use
    total: usize,
    /// Sessions being opened right now, outside the lock
    opening: usize,
    next_session_id: u64,
    closed: bool,
}

impl PoolState {
    fn has_room(&self, max: Option<usize>) -> bool {
        max.map_or(true, |max| self.total + self.opening < max)
    }
}

/// Pool of sessions against one backing store
pub struct ConnectionPool {
    id: Uuid,
    backend: Arc<dyn Backend>,
    config: PoolConfig,
    state: Mutex<PoolState>,
    available: Condvar,
    last_error: Mutex<Option<ErrorRecord>>,
}

impl ConnectionPool {
    /// Create a pool and open `config.initial_size` sessions
    pub fn new(backend: Arc<dyn Backend>, config: PoolConfig) -> StorageResult<Self> {
        let initial = config.initial_size;
        let pool = Self::empty(backend, config);
        pool.grow_pool(initial)?;
        info!(
            backend = pool.backend.name(),
            sessions = initial,
            "connection pool ready"
        );
        Ok(pool)
    }

    /// Create a pool with no sessions yet
    pub fn empty(backend: Arc<dyn Backend>, config: PoolConfig) -> Self {
        Self {
            id: Uuid::new_v4(),
            backend,
            config,
            state: Mutex::new(PoolState::default()),
            available: Condvar::new(),
            last_error: Mutex::new(None),
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn capabilities(&self) -> Capabilities {
        self.backend.capabilities()
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Open `n` more sessions and add them to the idle set
    ///
    /// Stops at the first failure; sessions opened before it stay usable.
    pub fn grow_pool(&self, n: usize) -> StorageResult<()> {
        for _ in 0..n {
            {
                let mut state = self.state.lock();
                if state.closed {
                    return Err(StorageError::PoolClosed);
                }
                if !state.has_room(self.config.max_connections) {
                    return Err(StorageError::ResourceExhausted {
                        reason: format!(
                            "pool already holds {} sessions",
                            state.total + state.opening
                        ),
                    });
                }
                state.opening += 1;
            }

            let opened = self.open_session();

            let mut state = self.state.lock();
            state.opening -= 1;
            let conn = match opened {
                Ok(conn) => conn,
                Err(e) => {
                    drop(state);
                    // The reserved slot is free again for a waiting allocate
                    self.available.notify_one();
                    return Err(e);
                }
            };
            if state.closed {
                drop(state);
                drop(conn);
                return Err(StorageError::PoolClosed);
            }
            let id = next_id(&mut state);
            state.total += 1;
            state.idle.push(Session { id, conn });
            drop(state);
            self.available.notify_one();
        }
        Ok(())
    }

    /// Borrow a session, growing or waiting as needed
    pub fn allocate(&self) -> StorageResult<PooledConnection<'_>> {
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return Err(StorageError::PoolClosed);
            }
            if let Some(session) = state.idle.pop() {
                state.in_use.insert(session.id);
                return Ok(self.lend(session));
            }
            if state.has_room(self.config.max_connections) {
                return self.allocate_new(state);
            }
            self.available.wait(&mut state);
        }
    }

    /// Borrow an idle session without growing or waiting
    pub fn try_allocate(&self) -> StorageResult<Option<PooledConnection<'_>>> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(StorageError::PoolClosed);
        }
        Ok(state.idle.pop().map(|session| {
            state.in_use.insert(session.id);
            self.lend(session)
        }))
    }

    /// Open one session for the caller instead of waiting
    fn allocate_new(
        &self,
        mut state: MutexGuard<'_, PoolState>,
    ) -> StorageResult<PooledConnection<'_>> {
        state.opening += 1;
        let opened = MutexGuard::unlocked(&mut state, || self.open_session());
        state.opening -= 1;

        let conn = match opened {
            Ok(conn) => conn,
            Err(e) => {
                drop(state);
                // A waiter may now have room to try again
                self.available.notify_one();
                return Err(e);
            }
        };
        if state.closed {
            drop(state);
            drop(conn);
            return Err(StorageError::PoolClosed);
        }

        let id = next_id(&mut state);
        state.total += 1;
        state.in_use.insert(id);
        debug!(session = id, total = state.total, "pool grew on demand");
        Ok(self.lend(Session { id, conn }))
    }

    /// Hand a session back explicitly
    ///
    /// Dropping the guard does the same. A guard borrowed from another pool
    /// is reported as `ForeignConnection` and goes back to its own pool.
    pub fn release(&self, conn: PooledConnection<'_>) -> StorageResult<()> {
        if conn.pool.id != self.id {
            error!(
                pool = %self.id,
                owner = %conn.pool.id,
                "connection released to a pool that does not own it"
            );
            let err = StorageError::ForeignConnection;
            self.record_error("release", &err);
            return Err(err);
        }
        drop(conn);
        Ok(())
    }

    fn check_in(&self, session: Session) {
        let mut state = self.state.lock();
        if !state.in_use.remove(&session.id) {
            error!(session = session.id, "released session was not marked in use");
        }
        if state.closed {
            state.total -= 1;
            drop(state);
            warn!(session = session.id, "closing session released after shutdown");
            drop(session);
            return;
        }
        state.idle.push(session);
        drop(state);
        self.available.notify_one();
    }

    /// Refuse new allocations and close every idle session
    ///
    /// Sessions still in use are closed when they are released.
    pub fn shutdown(&self) {
        let drained = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            let drained = std::mem::take(&mut state.idle);
            state.total -= drained.len();
            drained
        };
        self.available.notify_all();

        let closed = drained.len();
        drop(drained);
        info!(
            backend = self.backend.name(),
            closed, "connection pool shut down"
        );
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        PoolStats {
            idle: state.idle.len(),
            in_use: state.in_use.len(),
            total: state.total,
            closed: state.closed,
        }
    }

    /// Remember `error` as the most recent failure (last write wins)
    pub fn record_error(&self, operation: &str, error: &StorageError) {
        error!(operation, code = %error.code(), "{}", error);
        *self.last_error.lock() = Some(ErrorRecord::new(operation, error));
    }

    /// The most recent failure recorded by any caller of this pool
    pub fn last_error(&self) -> Option<ErrorRecord> {
        self.last_error.lock().clone()
    }

    fn lend(&self, session: Session) -> PooledConnection<'_> {
        PooledConnection {
            pool: self,
            session: Some(session),
        }
    }

    /// Open a session, retrying transient failures
    fn open_session(&self) -> StorageResult<Box<dyn Connection>> {
        let mut attempt = 0;
        loop {
            match self.backend.connect() {
                Ok(conn) => {
                    debug!(backend = self.backend.name(), "opened backing session");
                    return Ok(conn);
                }
                Err(e) if e.is_retryable() && attempt < self.config.connect_retries => {
                    attempt += 1;
                    warn!(attempt, error = %e, "opening backing session failed, retrying");
                    std::thread::sleep(self.config.retry_backoff);
                }
                Err(e) => {
                    return Err(match e {
                        StorageError::PoolClosed => e,
                        other => StorageError::ResourceExhausted {
                            reason: other.to_string(),
                        },
                    })
                }
            }
        }
    }
}

fn next_id(state: &mut PoolState) -> u64 {
    state.next_session_id += 1;
    state.next_session_id
}

/// A session on loan from a [`ConnectionPool`]
///
/// Derefs to the session's [`Connection`]; returns it to the pool on drop.
pub struct PooledConnection<'a> {
    pool: &'a ConnectionPool,
    session: Option<Session>,
}

impl PooledConnection<'_> {
    /// Pool-local session number
    pub fn session_id(&self) -> u64 {
        self.session.as_ref().map_or(0, |s| s.id)
    }
}

impl Deref for PooledConnection<'_> {
    type Target = dyn Connection;

    fn deref(&self) -> &Self::Target {
        match &self.session {
            Some(session) => session.conn.as_ref(),
            None => unreachable!("session taken before drop"),
        }
    }
}

impl DerefMut for PooledConnection<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match &mut self.session {
            Some(session) => session.conn.as_mut(),
            None => unreachable!("session taken before drop"),
        }
    }
}

impl Drop for PooledConnection<'_> {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            self.pool.check_in(session);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;

    /// Backend whose sessions do nothing; counts connects and can refuse them
    struct CountingBackend {
        connects: AtomicUsize,
        limit: usize,
        transient_failures: AtomicUsize,
    }

    impl CountingBackend {
        fn new(limit: usize) -> Arc<Self> {
            Arc::new(Self {
                connects: AtomicUsize::new(0),
                limit,
                transient_failures: AtomicUsize::new(0),
            })
        }
    }

    struct NullConnection;

    impl Connection for NullConnection {
        fn backend_name(&self) -> &'static str {
            "null"
        }
    }

    impl Backend for CountingBackend {
        fn name(&self) -> &'static str {
            "null"
        }

        fn capabilities(&self) -> Capabilities {
            Capabilities::all()
        }

        fn connect(&self) -> StorageResult<Box<dyn Connection>> {
            if self
                .transient_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(StorageError::Backend {
                    message: "busy".into(),
                    retryable: true,
                });
            }
            if self.connects.load(Ordering::SeqCst) >= self.limit {
                return Err(StorageError::Backend {
                    message: "too many connections".into(),
                    retryable: false,
                });
            }
            self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(NullConnection))
        }
    }

    fn config(initial_size: usize, max_connections: Option<usize>) -> PoolConfig {
        PoolConfig {
            initial_size,
            max_connections,
            connect_retries: 2,
            retry_backoff: Duration::from_millis(1),
        }
    }

    /// Backend whose first connect is slow and fails; later ones succeed
    struct SlowFirstConnectBackend {
        attempts: AtomicUsize,
    }

    impl Backend for SlowFirstConnectBackend {
        fn name(&self) -> &'static str {
            "null"
        }

        fn capabilities(&self) -> Capabilities {
            Capabilities::all()
        }

        fn connect(&self) -> StorageResult<Box<dyn Connection>> {
            if self.attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                std::thread::sleep(Duration::from_millis(200));
                return Err(StorageError::Backend {
                    message: "refused".into(),
                    retryable: false,
                });
            }
            Ok(Box::new(NullConnection))
        }
    }

    #[test]
    fn test_failed_grow_wakes_waiting_allocate() {
        let backend = Arc::new(SlowFirstConnectBackend {
            attempts: AtomicUsize::new(0),
        });
        let pool = Arc::new(ConnectionPool::empty(backend, config(0, Some(1))));

        let (tx, rx) = std::sync::mpsc::channel();
        let waiter = Arc::clone(&pool);
        std::thread::spawn(move || {
            // Start while the only slot is reserved by grow_pool
            std::thread::sleep(Duration::from_millis(50));
            let allocated = waiter.allocate().map(|conn| conn.session_id());
            let _ = tx.send(allocated.is_ok());
        });

        assert!(pool.grow_pool(1).is_err());
        let allocated = rx
            .recv_timeout(Duration::from_secs(5))
            .expect("allocate stayed blocked after the failed grow");
        assert!(allocated);
        assert_eq!(pool.stats().total, 1);
    }

    #[test]
    fn test_new_pool_is_pre_grown() {
        let backend = CountingBackend::new(100);
        let pool = ConnectionPool::new(backend.clone(), config(3, None)).unwrap();

        assert_eq!(backend.connects.load(Ordering::SeqCst), 3);
        let stats = pool.stats();
        assert_eq!(stats.idle, 3);
        assert_eq!(stats.in_use, 0);
        assert_eq!(stats.total, 3);
    }

    #[test]
    fn test_allocate_and_release() {
        let pool = ConnectionPool::new(CountingBackend::new(100), config(1, None)).unwrap();

        let conn = pool.allocate().unwrap();
        assert_eq!(conn.backend_name(), "null");
        assert_eq!(pool.stats().in_use, 1);
        assert_eq!(pool.stats().idle, 0);

        pool.release(conn).unwrap();
        assert_eq!(pool.stats().in_use, 0);
        assert_eq!(pool.stats().idle, 1);
    }

    #[test]
    fn test_grows_by_exactly_one_when_idle_set_empty() {
        let backend = CountingBackend::new(100);
        let pool = ConnectionPool::new(backend.clone(), config(2, None)).unwrap();

        let a = pool.allocate().unwrap();
        let b = pool.allocate().unwrap();
        assert_eq!(backend.connects.load(Ordering::SeqCst), 2);

        let c = pool.allocate().unwrap();
        assert_eq!(backend.connects.load(Ordering::SeqCst), 3);

        let ids: HashSet<u64> = [a.session_id(), b.session_id(), c.session_id()]
            .into_iter()
            .collect();
        assert_eq!(ids.len(), 3);
        assert_eq!(pool.stats().total, 3);
    }

    #[test]
    fn test_three_concurrent_allocations_on_pool_of_two() {
        let backend = CountingBackend::new(100);
        let pool = ConnectionPool::new(backend.clone(), config(2, None)).unwrap();
        let barrier = Barrier::new(3);

        let ids: Vec<u64> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..3)
                .map(|_| {
                    s.spawn(|| {
                        let conn = pool.allocate().unwrap();
                        // Hold every session until all three callers have one
                        barrier.wait();
                        conn.session_id()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let unique: HashSet<u64> = ids.into_iter().collect();
        assert_eq!(unique.len(), 3);
        assert_eq!(backend.connects.load(Ordering::SeqCst), 3);
        assert_eq!(pool.stats().idle, 3);
    }

    #[test]
    fn test_capped_pool_blocks_until_release() {
        let backend = CountingBackend::new(100);
        let pool = ConnectionPool::new(backend.clone(), config(1, Some(1))).unwrap();

        let first = pool.allocate().unwrap();
        let first_id = first.session_id();
        assert!(pool.try_allocate().unwrap().is_none());

        std::thread::scope(|s| {
            let waiter = s.spawn(|| pool.allocate().unwrap().session_id());
            std::thread::sleep(Duration::from_millis(50));
            drop(first);
            assert_eq!(waiter.join().unwrap(), first_id);
        });

        assert_eq!(backend.connects.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_no_session_is_shared_between_concurrent_callers() {
        let pool = ConnectionPool::new(CountingBackend::new(100), config(2, Some(4))).unwrap();
        let active = Mutex::new(HashSet::new());

        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    for _ in 0..200 {
                        let conn = pool.allocate().unwrap();
                        let id = conn.session_id();
                        assert!(active.lock().insert(id), "session {} lent twice", id);
                        std::thread::yield_now();
                        assert!(active.lock().remove(&id));
                        drop(conn);
                    }
                });
            }
        });

        let stats = pool.stats();
        assert!(stats.total <= 4);
        assert_eq!(stats.in_use, 0);
    }

    #[test]
    fn test_grow_pool_reports_resource_exhausted_and_keeps_partial_growth() {
        let backend = CountingBackend::new(3);
        let pool = ConnectionPool::empty(backend, config(0, None));

        let err = pool.grow_pool(5).unwrap_err();
        assert!(matches!(err, StorageError::ResourceExhausted { .. }));
        assert_eq!(pool.stats().idle, 3);
        assert!(pool.allocate().is_ok());
    }

    #[test]
    fn test_transient_connect_failures_are_retried() {
        let backend = CountingBackend::new(100);
        backend.transient_failures.store(2, Ordering::SeqCst);

        let pool = ConnectionPool::new(backend.clone(), config(1, None)).unwrap();
        assert_eq!(pool.stats().total, 1);
        assert_eq!(backend.transient_failures.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_shutdown_rejects_new_allocations() {
        let pool = ConnectionPool::new(CountingBackend::new(100), config(2, None)).unwrap();
        pool.shutdown();

        assert!(pool.is_closed());
        assert!(matches!(pool.allocate(), Err(StorageError::PoolClosed)));
        assert_eq!(pool.stats().total, 0);
    }

    #[test]
    fn test_in_use_session_closed_on_release_after_shutdown() {
        let pool = ConnectionPool::new(CountingBackend::new(100), config(2, None)).unwrap();
        let conn = pool.allocate().unwrap();

        pool.shutdown();
        assert_eq!(pool.stats().total, 1);

        pool.release(conn).unwrap();
        let stats = pool.stats();
        assert_eq!(stats.total, 0);
        assert_eq!(stats.idle, 0);
        assert_eq!(stats.in_use, 0);
    }

    #[test]
    fn test_shutdown_wakes_waiters() {
        let pool = ConnectionPool::new(CountingBackend::new(100), config(1, Some(1))).unwrap();
        let held = pool.allocate().unwrap();

        std::thread::scope(|s| {
            let waiter = s.spawn(|| pool.allocate().map(|c| c.session_id()));
            std::thread::sleep(Duration::from_millis(50));
            pool.shutdown();
            assert!(matches!(waiter.join().unwrap(), Err(StorageError::PoolClosed)));
        });
        drop(held);
    }

    #[test]
    fn test_release_to_wrong_pool_is_reported() {
        let a = ConnectionPool::new(CountingBackend::new(100), config(1, None)).unwrap();
        let b = ConnectionPool::new(CountingBackend::new(100), config(1, None)).unwrap();

        let conn = a.allocate().unwrap();
        let err = b.release(conn).unwrap_err();
        assert!(matches!(err, StorageError::ForeignConnection));

        // The session went back to its own pool
        assert_eq!(a.stats().idle, 1);
        assert_eq!(b.stats().idle, 1);
        assert_eq!(
            b.last_error().map(|r| r.code),
            Some(crate::storage::ErrorCode::ForeignConnection)
        );
    }

    #[test]
    fn test_last_error_is_last_write_wins() {
        let pool = ConnectionPool::empty(CountingBackend::new(100), config(0, None));
        assert!(pool.last_error().is_none());

        pool.record_error("reading_append", &StorageError::invalid("first"));
        pool.record_error("common_insert", &StorageError::PoolClosed);

        let record = pool.last_error().unwrap();
        assert_eq!(record.operation, "common_insert");
        assert_eq!(record.code, crate::storage::ErrorCode::PoolClosed);
    }
}
