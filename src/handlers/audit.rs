// handlers/audit.rs - GET /api/audit/violations handler

use axum::extract::{Extension, Query, State};
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;

use crate::audit::AuditRecord;
use crate::error::ApiError;
use crate::guard::{Role, TenantContext};
use crate::middleware::{ApiResponse, ApiResult};
use crate::server::AppState;

#[derive(Debug, Deserialize)]
pub struct ViolationsQuery {
    /// RFC 3339 timestamp; defaults to one hour ago
    pub since: Option<DateTime<Utc>>,
}

/// GET /api/audit/violations - unscoped access attempts, for operational monitoring.
///
/// Violation records span all tenants, so only service credentials may read them.
pub async fn violations_get(
    State(state): State<AppState>,
    Extension(context): Extension<TenantContext>,
    Query(query): Query<ViolationsQuery>,
) -> ApiResult<Vec<AuditRecord>> {
    if !context.has_role(Role::Service) {
        return Err(ApiError::forbidden("Service role required to read audit violations"));
    }

    let since = query.since.unwrap_or_else(|| Utc::now() - Duration::hours(1));
    Ok(ApiResponse::success(state.executor.audit_violations_since(since)))
}
