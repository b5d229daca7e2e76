//! Tenant-scoped database access for multi-tenant Monk services.
//!
//! Business logic reaches the database only through [`ScopedExecutor`], which
//! binds a validated [`ContextToken`] to a transaction on a pooled session and
//! guarantees the binding is gone before the session can be reused.

pub mod audit;
pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod executor;
pub mod guard;
pub mod handlers;
pub mod middleware;
pub mod pool;
pub mod server;
pub mod session;
pub mod token;

pub use audit::{AccessAuditor, AuditKind, AuditRecord};
pub use executor::{ExecutorSettings, ScopeError, ScopedExecutor};
pub use guard::{CredentialIssuer, GuardError, Role, TenantContext, TenantGuard};
pub use pool::{PoolError, PoolOptions, PoolStatus, PooledSession, SessionPool};
pub use session::{ConnectionSession, ResourceClass, ScopedSession, SessionError, Statement, TxState};
pub use token::{ContextToken, TokenError};
