use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use std::error::Error as StdError;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::audit::{AccessAuditor, AuditRecord, AuditorRef};
use crate::config::AppConfig;
use crate::engine::{EngineRef, Row};
use crate::pool::{PoolError, PoolStatus, SessionPool};
use crate::session::{ConnectionSession, ScopedSession, SessionError, Statement};
use crate::token::ContextToken;

/// Failure of a scoped unit of work. The original cause is always preserved.
#[derive(Debug, Error)]
pub enum ScopeError {
    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("Scoped work exceeded the transaction timeout of {0:?}")]
    TransactionTimeout(Duration),

    #[error("Scoped work failed: {0}")]
    Work(#[source] Box<dyn StdError + Send + Sync>),
}

impl ScopeError {
    /// Wrap a caller's own error so it can be returned from scoped work
    pub fn work(err: impl Into<Box<dyn StdError + Send + Sync>>) -> Self {
        ScopeError::Work(err.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, ScopeError::Pool(e) if e.is_retryable())
    }
}

/// Timeouts applied to every scoped unit of work
#[derive(Debug, Clone, Copy)]
pub struct ExecutorSettings {
    pub acquire_timeout: Duration,
    pub transaction_timeout: Duration,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            acquire_timeout: Duration::from_secs(5),
            transaction_timeout: Duration::from_secs(30),
        }
    }
}

/// The sanctioned entry point for business logic to reach the database.
///
/// Every call leases a session, opens a transaction, binds the tenant marker
/// for that transaction only, runs the work, and then commits or rolls back,
/// unbinds and releases, on every exit path.
#[derive(Clone)]
pub struct ScopedExecutor {
    pool: SessionPool,
    auditor: AuditorRef,
    settings: ExecutorSettings,
}

impl ScopedExecutor {
    pub fn new(pool: SessionPool, auditor: AuditorRef, settings: ExecutorSettings) -> Self {
        Self {
            pool,
            auditor,
            settings,
        }
    }

    /// Build the auditor, pool and executor described by `config`
    pub fn from_config(engine: EngineRef, config: &AppConfig) -> Self {
        let auditor = Arc::new(AccessAuditor::new(
            config.security.audit_retention,
            config.security.enable_audit_logging,
        ));
        let pool = SessionPool::new(engine, config.database.pool_options(), auditor.clone());
        let settings = ExecutorSettings {
            acquire_timeout: config.database.acquire_timeout(),
            transaction_timeout: config.database.transaction_timeout(),
        };
        Self::new(pool, auditor, settings)
    }

    /// Run `work` with `token` bound for its whole duration.
    ///
    /// `work` only sees a [`ScopedSession`], so it can run statements but can
    /// neither end the transaction nor change the bound tenant.
    ///
    /// ```ignore
    /// let rows = executor
    ///     .run_scoped(&token, |session| Box::pin(async move {
    ///         Ok(session.fetch_all(&Statement::new("SELECT * FROM shipments")).await?)
    ///     }))
    ///     .await?;
    /// ```
    pub async fn run_scoped<T, F>(&self, token: &ContextToken, work: F) -> Result<T, ScopeError>
    where
        F: for<'s> FnOnce(&'s mut ScopedSession<'_>) -> BoxFuture<'s, Result<T, ScopeError>> + Send,
        T: Send,
    {
        let mut lease = self.pool.acquire(self.settings.acquire_timeout).await?;
        let outcome = self.drive(&mut lease, token, work).await;

        if let Err(e) = &outcome {
            warn!("Scoped work for tenant {} failed on session {}: {}", token, lease.id(), e);
            abort(&mut lease).await;
        }

        lease.release().await;
        outcome
    }

    async fn drive<T, F>(&self, session: &mut ConnectionSession, token: &ContextToken, work: F) -> Result<T, ScopeError>
    where
        F: for<'s> FnOnce(&'s mut ScopedSession<'_>) -> BoxFuture<'s, Result<T, ScopeError>> + Send,
        T: Send,
    {
        session.begin().await?;
        session.bind(token).await?;

        let timeout = self.settings.transaction_timeout;
        let mut scoped = ScopedSession::new(session);
        let value = match tokio::time::timeout(timeout, work(&mut scoped)).await {
            Ok(result) => result?,
            Err(_) => return Err(ScopeError::TransactionTimeout(timeout)),
        };

        session.commit().await?;
        session.unbind().await?;
        debug!("Scoped work committed for tenant {} on session {}", token, session.id());
        Ok(value)
    }

    /// All rows of a single tenant-scoped statement
    pub async fn query_all(&self, token: &ContextToken, statement: Statement) -> Result<Vec<Row>, ScopeError> {
        self.run_scoped(token, move |session| {
            Box::pin(async move { Ok(session.fetch_all(&statement).await?) })
        })
        .await
    }

    /// First row of a single tenant-scoped statement, if any
    pub async fn query_one(&self, token: &ContextToken, statement: Statement) -> Result<Option<Row>, ScopeError> {
        self.run_scoped(token, move |session| {
            Box::pin(async move { Ok(session.fetch_optional(&statement).await?) })
        })
        .await
    }

    /// Verify a session can be leased and can run a transaction. Binds no tenant.
    pub async fn health_check(&self) -> Result<(), ScopeError> {
        let mut lease = self.pool.acquire(self.settings.acquire_timeout).await?;
        let result = async {
            lease.begin().await?;
            lease.fetch_all(&Statement::global("SELECT 1")).await?;
            lease.commit().await
        }
        .await;
        lease.release().await;
        result.map_err(ScopeError::from)
    }

    pub fn audit_violations_since(&self, since: DateTime<Utc>) -> Vec<AuditRecord> {
        self.auditor.violations_since(since)
    }

    pub fn auditor(&self) -> &AuditorRef {
        &self.auditor
    }

    pub fn pool(&self) -> &SessionPool {
        &self.pool
    }

    pub fn pool_status(&self) -> PoolStatus {
        self.pool.status()
    }

    pub fn settings(&self) -> ExecutorSettings {
        self.settings
    }
}

// Cleanup failures are logged; the caller always sees the original error
async fn abort(session: &mut ConnectionSession) {
    if let Err(e) = session.rollback().await {
        warn!("Rollback failed on session {}: {}", session.id(), e);
    }
    if let Err(e) = session.unbind().await {
        warn!("Defensive unbind failed on session {}: {}", session.id(), e);
    }
}
