use serde_json::Value;
use std::fmt;
use thiserror::Error;

use crate::audit::AuditorRef;
use crate::engine::{EngineConnection, EngineError, Row};
use crate::token::ContextToken;

/// Errors raised by a leased session
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Failed to bind tenant context: {0}")]
    BindFailed(String),

    #[error("Failed to unbind tenant context: {0}")]
    UnbindFailed(String),

    #[error("Invalid transaction state: expected {expected}, found {found}")]
    TransactionState { expected: &'static str, found: TxState },

    #[error("Session is still bound to tenant {0}; unbind before starting a new transaction")]
    StaleBinding(String),

    #[error("Transaction error: {0}")]
    Transaction(#[source] EngineError),

    #[error("Unscoped access to tenant resource: {0}")]
    UnscopedAccessViolation(String),

    #[error("Query failed: {0}")]
    QueryFailed(#[source] EngineError),
}

/// Transaction lifecycle of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    None,
    Active,
    Committed,
    RolledBack,
}

impl fmt::Display for TxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TxState::None => "none",
            TxState::Active => "active",
            TxState::Committed => "committed",
            TxState::RolledBack => "rolled-back",
        };
        f.write_str(s)
    }
}

/// Which rows a statement can reach
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResourceClass {
    /// Rows owned by a tenant; requires a bound context
    #[default]
    TenantScoped,
    /// Tenant-independent data such as `SELECT 1` or reference tables
    Global,
}

/// Parameterized SQL plus the resource class it touches
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<Value>,
    pub class: ResourceClass,
}

impl Statement {
    /// Statement against tenant-owned rows
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
            class: ResourceClass::TenantScoped,
        }
    }

    /// Statement that does not touch tenant-owned rows
    pub fn global(sql: impl Into<String>) -> Self {
        Self {
            class: ResourceClass::Global,
            ..Self::new(sql)
        }
    }

    pub fn bind(mut self, value: impl Into<Value>) -> Self {
        self.params.push(value.into());
        self
    }
}

/// A single engine connection together with its tenant binding.
///
/// `bind` is only legal inside a transaction and uses the engine's
/// transaction-local marker, so the binding cannot outlive the transaction at
/// the engine level. The session additionally tracks the bound token until
/// `unbind` so the pool can verify the clean state on release.
///
/// Transaction control and binding belong to the pool and the executor; code
/// holding a leased session can only run statements on it.
///
/// ```compile_fail
/// # async fn rebind(lease: &mut monk_scope::PooledSession, other: &monk_scope::ContextToken) {
/// lease.bind(other).await.ok();
/// # }
/// ```
pub struct ConnectionSession {
    id: u64,
    conn: Box<dyn EngineConnection>,
    marker: String,
    token: Option<ContextToken>,
    tx: TxState,
    // set when the engine state can no longer be trusted
    poisoned: bool,
    auditor: AuditorRef,
}

impl ConnectionSession {
    pub(crate) fn new(id: u64, conn: Box<dyn EngineConnection>, marker: String, auditor: AuditorRef) -> Self {
        Self {
            id,
            conn,
            marker,
            token: None,
            tx: TxState::None,
            poisoned: false,
            auditor,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn tx_state(&self) -> TxState {
        self.tx
    }

    pub fn bound_token(&self) -> Option<&ContextToken> {
        self.token.as_ref()
    }

    /// True while a token is bound inside the active transaction that set its marker
    pub fn is_scoped(&self) -> bool {
        self.token.is_some() && self.tx == TxState::Active
    }

    /// Clean means eligible for the idle set
    pub fn is_clean(&self) -> bool {
        self.tx == TxState::None && self.token.is_none() && !self.poisoned
    }

    pub(crate) async fn begin(&mut self) -> Result<(), SessionError> {
        if self.tx == TxState::Active {
            return Err(SessionError::TransactionState {
                expected: "no active transaction",
                found: self.tx,
            });
        }
        // the engine marker died with the previous transaction; the token must not outlive it
        if let Some(token) = &self.token {
            return Err(SessionError::StaleBinding(token.canonical()));
        }
        self.conn.begin().await.map_err(SessionError::Transaction)?;
        self.tx = TxState::Active;
        Ok(())
    }

    pub(crate) async fn commit(&mut self) -> Result<(), SessionError> {
        if self.tx != TxState::Active {
            return Err(SessionError::TransactionState {
                expected: "active",
                found: self.tx,
            });
        }
        let result = self.conn.commit().await;
        // A failed COMMIT still ends the transaction on the server
        self.tx = if result.is_ok() {
            TxState::Committed
        } else {
            TxState::RolledBack
        };
        result.map_err(SessionError::Transaction)
    }

    /// Roll back the active transaction; a no-op when none is active
    pub(crate) async fn rollback(&mut self) -> Result<(), SessionError> {
        if self.tx != TxState::Active {
            return Ok(());
        }
        let result = self.conn.rollback().await;
        self.tx = TxState::RolledBack;
        if result.is_err() {
            self.poisoned = true;
        }
        result.map_err(SessionError::Transaction)
    }

    /// Bind `token` as the transaction-local tenant marker
    pub(crate) async fn bind(&mut self, token: &ContextToken) -> Result<(), SessionError> {
        if self.tx != TxState::Active {
            return Err(SessionError::BindFailed(format!(
                "bind requires an active transaction (state: {})",
                self.tx
            )));
        }
        if let Some(existing) = &self.token {
            return Err(SessionError::BindFailed(format!(
                "session {} already bound to tenant {}",
                self.id, existing
            )));
        }

        self.conn
            .set_tenant_marker(&self.marker, &token.canonical())
            .await
            .map_err(|e| SessionError::BindFailed(e.to_string()))?;

        self.token = Some(*token);
        self.auditor.bind(token, self.id);
        Ok(())
    }

    /// Clear the tenant marker. Calling this with nothing bound does nothing.
    pub(crate) async fn unbind(&mut self) -> Result<(), SessionError> {
        let Some(token) = self.token.take() else {
            return Ok(());
        };

        let result = self.conn.clear_tenant_marker(&self.marker).await;
        self.auditor.unbind(&token, self.id);
        if result.is_err() {
            self.poisoned = true;
        }
        result.map_err(|e| SessionError::UnbindFailed(e.to_string()))
    }

    /// Run a statement and return the affected row count
    pub async fn execute(&mut self, statement: &Statement) -> Result<u64, SessionError> {
        self.check_scope(statement)?;
        self.conn
            .execute(&statement.sql, &statement.params)
            .await
            .map_err(SessionError::QueryFailed)
    }

    pub async fn fetch_all(&mut self, statement: &Statement) -> Result<Vec<Row>, SessionError> {
        self.check_scope(statement)?;
        self.conn
            .fetch_all(&statement.sql, &statement.params)
            .await
            .map_err(SessionError::QueryFailed)
    }

    pub async fn fetch_optional(&mut self, statement: &Statement) -> Result<Option<Row>, SessionError> {
        Ok(self.fetch_all(statement).await?.into_iter().next())
    }

    fn check_scope(&self, statement: &Statement) -> Result<(), SessionError> {
        // The engine-level marker only exists inside the transaction that set it
        let scoped = self.is_scoped();
        if statement.class == ResourceClass::TenantScoped && !scoped {
            self.auditor.violation(self.id, &statement.sql);
            return Err(SessionError::UnscopedAccessViolation(statement.sql.clone()));
        }
        if scoped {
            self.auditor.query(self.token.as_ref(), self.id, &statement.sql);
        } else {
            self.auditor.unscoped_query(self.id, &statement.sql);
        }
        Ok(())
    }

    /// Bring the session back to the idle invariant: no transaction, no token.
    ///
    /// Both steps always run. An error means the connection state is unknown
    /// and the connection must not be reused.
    pub(crate) async fn restore(&mut self) -> Result<(), SessionError> {
        let rolled_back = self.rollback().await;
        let unbound = self.unbind().await;
        self.tx = TxState::None;
        rolled_back.and(unbound)
    }

    pub(crate) async fn close(self) {
        self.conn.close().await;
    }
}

/// The view of a session handed to scoped work.
///
/// The tenant was bound before the work started and stays bound until it
/// returns; the handle can run statements but cannot begin, commit, roll back,
/// bind or unbind.
///
/// ```compile_fail
/// # async fn rebind(session: &mut monk_scope::ScopedSession<'_>, other: &monk_scope::ContextToken) {
/// session.bind(other).await.ok();
/// # }
/// ```
pub struct ScopedSession<'c> {
    session: &'c mut ConnectionSession,
}

impl<'c> ScopedSession<'c> {
    pub(crate) fn new(session: &'c mut ConnectionSession) -> Self {
        Self { session }
    }

    pub fn id(&self) -> u64 {
        self.session.id()
    }

    pub fn bound_token(&self) -> Option<&ContextToken> {
        self.session.bound_token()
    }

    pub async fn execute(&mut self, statement: &Statement) -> Result<u64, SessionError> {
        self.session.execute(statement).await
    }

    pub async fn fetch_all(&mut self, statement: &Statement) -> Result<Vec<Row>, SessionError> {
        self.session.fetch_all(statement).await
    }

    pub async fn fetch_optional(&mut self, statement: &Statement) -> Result<Option<Row>, SessionError> {
        self.session.fetch_optional(statement).await
    }
}

impl fmt::Debug for ConnectionSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionSession")
            .field("id", &self.id)
            .field("token", &self.token)
            .field("tx", &self.tx)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AccessAuditor, AuditKind};
    use crate::engine::{Engine, EngineEvent, MemoryEngine};
    use std::sync::Arc;

    const TENANT: &str = "123e4567-e89b-12d3-a456-426614174000";

    async fn session(engine: &MemoryEngine) -> (ConnectionSession, AuditorRef) {
        let auditor = Arc::new(AccessAuditor::default());
        let conn = engine.connect().await.unwrap();
        (
            ConnectionSession::new(1, conn, "app.tenant_id".to_string(), auditor.clone()),
            auditor,
        )
    }

    fn token() -> ContextToken {
        ContextToken::parse(TENANT).unwrap()
    }

    #[tokio::test]
    async fn bind_requires_active_transaction() {
        let engine = MemoryEngine::new();
        let (mut s, _) = session(&engine).await;

        let err = s.bind(&token()).await.unwrap_err();
        assert!(matches!(err, SessionError::BindFailed(_)));
        assert!(!s.is_scoped());
        assert!(engine.events().iter().all(|e| !matches!(e, EngineEvent::SetMarker { .. })));
    }

    #[tokio::test]
    async fn rebinding_is_rejected() {
        let engine = MemoryEngine::new();
        let (mut s, _) = session(&engine).await;
        s.begin().await.unwrap();
        s.bind(&token()).await.unwrap();

        let other = ContextToken::parse("00000000-0000-0000-0000-000000000002").unwrap();
        assert!(matches!(s.bind(&other).await, Err(SessionError::BindFailed(_))));
        assert_eq!(s.bound_token(), Some(&token()));
    }

    #[tokio::test]
    async fn unbind_twice_is_noop() {
        let engine = MemoryEngine::new();
        let (mut s, auditor) = session(&engine).await;
        s.begin().await.unwrap();
        s.bind(&token()).await.unwrap();

        s.unbind().await.unwrap();
        s.unbind().await.unwrap();

        let unbinds = auditor.records().iter().filter(|r| r.kind == AuditKind::Unbind).count();
        assert_eq!(unbinds, 1);
        let clears = engine
            .events()
            .iter()
            .filter(|e| matches!(e, EngineEvent::ClearMarker { .. }))
            .count();
        assert_eq!(clears, 1);
    }

    #[tokio::test]
    async fn scoped_statement_without_bind_is_violation() {
        let engine = MemoryEngine::new();
        let (mut s, auditor) = session(&engine).await;
        s.begin().await.unwrap();

        let err = s.fetch_all(&Statement::new("SELECT * FROM shipments")).await.unwrap_err();
        assert!(matches!(err, SessionError::UnscopedAccessViolation(_)));
        assert_eq!(auditor.records()[0].kind, AuditKind::Violation);
        // the engine never saw the query
        assert!(engine.query_markers().is_empty());
    }

    #[tokio::test]
    async fn scoped_statement_after_commit_is_violation() {
        let engine = MemoryEngine::new();
        let (mut s, _) = session(&engine).await;
        s.begin().await.unwrap();
        s.bind(&token()).await.unwrap();
        s.commit().await.unwrap();

        let err = s.fetch_all(&Statement::new("SELECT * FROM shipments")).await.unwrap_err();
        assert!(matches!(err, SessionError::UnscopedAccessViolation(_)));
    }

    #[tokio::test]
    async fn global_statement_runs_unscoped_and_is_audited() {
        let engine = MemoryEngine::new();
        // query auditing off, as in production
        let (mut s, auditor) = session(&engine).await;
        let rows = s.fetch_all(&Statement::global("SELECT 1")).await.unwrap();
        assert_eq!(rows.len(), 1);

        let records = auditor.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].kind, AuditKind::Query);
        assert!(records[0].tenant.is_none());
        assert_eq!(records[0].detail.as_deref(), Some("SELECT 1"));
    }

    #[tokio::test]
    async fn scoped_queries_are_audited_only_when_enabled() {
        let engine = MemoryEngine::new();
        let (mut s, auditor) = session(&engine).await;
        s.begin().await.unwrap();
        s.bind(&token()).await.unwrap();
        s.fetch_all(&Statement::new("SELECT * FROM shipments")).await.unwrap();

        assert!(auditor.records().iter().all(|r| r.kind != AuditKind::Query));
    }

    #[tokio::test]
    async fn new_transaction_cannot_revive_a_stale_binding() {
        let engine = MemoryEngine::new();
        let (mut s, _) = session(&engine).await;
        s.begin().await.unwrap();
        s.bind(&token()).await.unwrap();
        s.rollback().await.unwrap();

        let err = s.begin().await.unwrap_err();
        assert!(matches!(err, SessionError::StaleBinding(_)));
        assert_eq!(s.tx_state(), TxState::RolledBack);
        assert!(!s.is_scoped());

        // a tenant-scoped statement is still refused by the session, not by the engine
        let err = s
            .execute(&Statement::new("INSERT INTO shipments VALUES ($1)").bind(serde_json::json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::UnscopedAccessViolation(_)));

        s.unbind().await.unwrap();
        s.begin().await.unwrap();
        assert_eq!(s.tx_state(), TxState::Active);
    }

    #[tokio::test]
    async fn restore_rolls_back_and_unbinds() {
        let engine = MemoryEngine::new();
        let (mut s, _) = session(&engine).await;
        s.begin().await.unwrap();
        s.bind(&token()).await.unwrap();

        s.restore().await.unwrap();
        assert!(s.is_clean());
        assert!(engine.events().contains(&EngineEvent::Rollback { conn: 1 }));
    }

    #[tokio::test]
    async fn restore_reports_unbind_failure_and_poisons() {
        let engine = MemoryEngine::new();
        let (mut s, _) = session(&engine).await;
        s.begin().await.unwrap();
        s.bind(&token()).await.unwrap();
        engine.fail_clear_marker(true);

        assert!(matches!(s.restore().await, Err(SessionError::UnbindFailed(_))));
        assert_eq!(s.tx_state(), TxState::None);
        assert!(s.bound_token().is_none());
        assert!(!s.is_clean());
    }
}
