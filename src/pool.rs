use serde::Serialize;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tracing::{debug, info, warn};

use crate::audit::AuditorRef;
use crate::engine::{EngineError, EngineRef};
use crate::session::{ConnectionSession, SessionError};

/// Errors from acquiring a session
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Session pool exhausted: all {max} sessions are leased")]
    PoolExhausted { max: usize },

    #[error("Timed out after {0:?} waiting for a free session")]
    PoolTimeout(Duration),

    #[error("Session pool is closed")]
    PoolClosed,

    #[error("Failed to open database connection: {0}")]
    Connect(#[source] EngineError),
}

impl PoolError {
    /// Exhaustion and timeouts clear up on their own; callers may retry with backoff
    pub fn is_retryable(&self) -> bool {
        matches!(self, PoolError::PoolExhausted { .. } | PoolError::PoolTimeout(_))
    }
}

#[derive(Debug, Clone)]
pub struct PoolOptions {
    pub max_connections: usize,
    /// Engine setting that carries the tenant marker, e.g. `app.tenant_id`
    pub tenant_marker: String,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            max_connections: 10,
            tenant_marker: "app.tenant_id".to_string(),
        }
    }
}

/// Point-in-time view of the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    pub max: usize,
    pub size: usize,
    pub idle: usize,
    pub leased: usize,
}

// Every session is counted in `size` and is either in `idle` or counted in `leased`
#[derive(Default)]
struct Slots {
    idle: Vec<ConnectionSession>,
    leased: usize,
    size: usize,
}

struct PoolInner {
    engine: EngineRef,
    options: PoolOptions,
    auditor: AuditorRef,
    slots: Mutex<Slots>,
    semaphore: Arc<Semaphore>,
    next_id: AtomicU64,
}

impl PoolInner {
    fn slots(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn open(&self) -> Result<ConnectionSession, PoolError> {
        let conn = self.engine.connect().await.map_err(PoolError::Connect)?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        debug!("Opened session {} on {} engine", id, self.engine.name());
        Ok(ConnectionSession::new(
            id,
            conn,
            self.options.tenant_marker.clone(),
            self.auditor.clone(),
        ))
    }

    /// Return a restored session to the idle set, or close it if it cannot be trusted.
    /// The permit is released only once the session is accounted for.
    async fn checkin(
        &self,
        session: ConnectionSession,
        restored: Result<(), SessionError>,
        permit: Option<OwnedSemaphorePermit>,
    ) {
        match restored {
            Ok(()) if session.is_clean() && !self.semaphore.is_closed() => {
                let mut slots = self.slots();
                slots.idle.push(session);
                slots.leased -= 1;
                drop(permit);
            }
            Ok(()) => {
                self.discard(session).await;
                drop(permit);
            }
            Err(e) => {
                warn!("Discarding session {} after failed restore: {}", session.id(), e);
                self.discard(session).await;
                drop(permit);
            }
        }
    }

    /// Close a leased session and free its slot
    async fn discard(&self, session: ConnectionSession) {
        self.forget(&session);
        debug!("Closing session {}", session.id());
        session.close().await;
    }

    /// Stop counting a leased session without waiting on the engine
    fn forget(&self, session: &ConnectionSession) {
        let mut slots = self.slots();
        slots.leased -= 1;
        slots.size -= 1;
        debug!("Session {} removed from pool accounting", session.id());
    }
}

/// Bounded pool of reusable sessions.
///
/// A session is either in the idle set or owned by exactly one
/// [`PooledSession`]. The only way back into the idle set is the restore gate
/// run on release, which rolls back, unbinds and verifies the session is
/// clean, so a session is never handed out carrying a previous tenant.
#[derive(Clone)]
pub struct SessionPool {
    inner: Arc<PoolInner>,
}

impl SessionPool {
    pub fn new(engine: EngineRef, options: PoolOptions, auditor: AuditorRef) -> Self {
        let max = options.max_connections.max(1);
        info!(
            "Creating session pool: engine={}, max_connections={}, marker={}",
            engine.name(),
            max,
            options.tenant_marker
        );
        Self {
            inner: Arc::new(PoolInner {
                engine,
                options: PoolOptions {
                    max_connections: max,
                    ..options
                },
                auditor,
                slots: Mutex::new(Slots::default()),
                semaphore: Arc::new(Semaphore::new(max)),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Lease a session, waiting at most `timeout` for a free slot.
    ///
    /// A zero timeout tries once and reports [`PoolError::PoolExhausted`].
    pub async fn acquire(&self, timeout: Duration) -> Result<PooledSession, PoolError> {
        let max = self.inner.options.max_connections;
        let semaphore = self.inner.semaphore.clone();

        let permit = if timeout.is_zero() {
            match semaphore.try_acquire_owned() {
                Ok(permit) => permit,
                Err(TryAcquireError::NoPermits) => {
                    self.inner
                        .auditor
                        .pool_exhausted(format!("all {} sessions leased", max));
                    return Err(PoolError::PoolExhausted { max });
                }
                Err(TryAcquireError::Closed) => return Err(PoolError::PoolClosed),
            }
        } else {
            match tokio::time::timeout(timeout, semaphore.acquire_owned()).await {
                Ok(Ok(permit)) => permit,
                Ok(Err(_)) => return Err(PoolError::PoolClosed),
                Err(_) => {
                    self.inner.auditor.pool_exhausted(format!(
                        "acquire timed out after {:?} with all {} sessions leased",
                        timeout, max
                    ));
                    return Err(PoolError::PoolTimeout(timeout));
                }
            }
        };

        let idle = {
            let mut slots = self.inner.slots();
            let idle = slots.idle.pop();
            if idle.is_some() {
                slots.leased += 1;
            }
            idle
        };
        let session = match idle {
            Some(session) => session,
            None => {
                // the permit is dropped on error, returning the slot
                let session = self.inner.open().await?;
                let mut slots = self.inner.slots();
                slots.size += 1;
                slots.leased += 1;
                session
            }
        };
        debug_assert!(session.is_clean(), "idle session {} was not clean", session.id());

        Ok(PooledSession {
            session: Some(session),
            permit: Some(permit),
            pool: self.inner.clone(),
        })
    }

    /// Give a session back; equivalent to [`PooledSession::release`]
    pub async fn release(&self, session: PooledSession) {
        session.release().await;
    }

    pub fn status(&self) -> PoolStatus {
        let slots = self.inner.slots();
        PoolStatus {
            max: self.inner.options.max_connections,
            size: slots.size,
            idle: slots.idle.len(),
            leased: slots.leased,
        }
    }

    pub fn options(&self) -> &PoolOptions {
        &self.inner.options
    }

    /// Reject new acquires and close idle sessions. Leased sessions close when released.
    pub async fn close(&self) {
        self.inner.semaphore.close();
        let drained: Vec<ConnectionSession> = {
            let mut slots = self.inner.slots();
            slots.size -= slots.idle.len();
            slots.idle.drain(..).collect()
        };
        for session in drained {
            debug!("Closing idle session {}", session.id());
            session.close().await;
        }
        info!("Session pool closed");
    }
}

/// A leased session. Dereferences to [`ConnectionSession`].
///
/// Dropping without calling [`release`](Self::release), for example when the
/// owning task is cancelled, still runs the restore gate on a background task;
/// the pool slot stays occupied until that cleanup finishes.
pub struct PooledSession {
    session: Option<ConnectionSession>,
    permit: Option<OwnedSemaphorePermit>,
    pool: Arc<PoolInner>,
}

const LEASE_INVARIANT: &str = "leased session already released";

impl PooledSession {
    /// Restore the session and return it to the pool
    pub async fn release(mut self) {
        // restore in place so a cancelled release still leaves the session to Drop
        let restored = match self.session.as_mut() {
            Some(session) => session.restore().await,
            None => return,
        };
        if let Some(session) = self.session.take() {
            self.pool.checkin(session, restored, self.permit.take()).await;
        }
    }
}

impl fmt::Debug for PooledSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledSession").field("session", &self.session).finish()
    }
}

impl Deref for PooledSession {
    type Target = ConnectionSession;

    fn deref(&self) -> &Self::Target {
        self.session.as_ref().expect(LEASE_INVARIANT)
    }
}

impl DerefMut for PooledSession {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.session.as_mut().expect(LEASE_INVARIANT)
    }
}

impl Drop for PooledSession {
    fn drop(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        let reclaim = Reclaim {
            session: Some(session),
            permit: self.permit.take(),
            pool: self.pool.clone(),
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                debug!("Session dropped without release, restoring in background");
                handle.spawn(reclaim.run());
            }
            // dropping the reclaim discards the connection
            Err(_) => warn!("Session dropped outside a runtime, discarding connection"),
        }
    }
}

/// Background restore of a dropped lease. If the task is dropped before it
/// finishes, for example during runtime shutdown, the session is discarded and
/// its slot freed.
struct Reclaim {
    session: Option<ConnectionSession>,
    permit: Option<OwnedSemaphorePermit>,
    pool: Arc<PoolInner>,
}

impl Reclaim {
    async fn run(mut self) {
        let restored = match self.session.as_mut() {
            Some(session) => session.restore().await,
            None => return,
        };
        if let Some(session) = self.session.take() {
            self.pool.checkin(session, restored, self.permit.take()).await;
        }
    }
}

impl Drop for Reclaim {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            warn!("Restore of session {} never completed, discarding connection", session.id());
            self.pool.forget(&session);
        }
    }
}
