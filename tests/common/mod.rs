#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use monk_scope::config::AppConfig;
use monk_scope::engine::MemoryEngine;
use monk_scope::server::AppState;
use monk_scope::{
    AccessAuditor, ContextToken, CredentialIssuer, ExecutorSettings, PoolOptions, Role, ScopedExecutor,
    SessionPool, TenantGuard,
};

pub const TENANT_A: &str = "123e4567-e89b-12d3-a456-426614174000";
pub const TENANT_B: &str = "9b2f3c1e-0d4a-4e8b-a1c2-3d4e5f607182";
pub const SECRET: &str = "integration-test-secret";

pub fn token(raw: &str) -> ContextToken {
    ContextToken::parse(raw).expect("valid tenant")
}

pub fn executor(engine: &MemoryEngine, max_connections: usize, acquire_timeout: Duration) -> ScopedExecutor {
    let auditor = Arc::new(AccessAuditor::default());
    let options = PoolOptions {
        max_connections,
        ..PoolOptions::default()
    };
    let pool = SessionPool::new(Arc::new(engine.clone()), options, auditor.clone());
    ScopedExecutor::new(
        pool,
        auditor,
        ExecutorSettings {
            acquire_timeout,
            transaction_timeout: Duration::from_secs(5),
        },
    )
}

pub fn issuer() -> CredentialIssuer {
    CredentialIssuer::new(SECRET, chrono::Duration::hours(1)).expect("issuer")
}

pub fn credential(tenant: Option<&str>, roles: Vec<Role>) -> String {
    issuer().issue("user-1", tenant, roles).expect("signed credential")
}

pub fn app_state(executor: ScopedExecutor) -> AppState {
    AppState::new(executor, TenantGuard::new(SECRET, 0).expect("guard"))
}

pub fn test_config() -> AppConfig {
    let mut config = AppConfig::development();
    config.api.enable_request_logging = false;
    config
}
