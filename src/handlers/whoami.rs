// handlers/whoami.rs - GET /api/whoami handler

use axum::extract::{Extension, State};
use serde::Serialize;
use serde_json::Value;

use crate::guard::{Role, TenantContext};
use crate::middleware::{ApiResponse, ApiResult};
use crate::server::AppState;
use crate::session::Statement;

#[derive(Debug, Serialize)]
pub struct WhoamiResponse {
    pub subject: String,
    pub tenant: String,
    pub roles: Vec<Role>,
    pub expires_at: chrono::DateTime<chrono::Utc>,
    /// Tenant marker as the database sees it inside the scoped transaction
    pub database_tenant: Value,
}

/// GET /api/whoami - echo the authenticated context and the tenant the database observed
pub async fn whoami_get(
    State(state): State<AppState>,
    Extension(context): Extension<TenantContext>,
) -> ApiResult<WhoamiResponse> {
    let marker = state.executor.pool().options().tenant_marker.clone();
    let row = state
        .executor
        .query_one(
            &context.token,
            Statement::global("SELECT current_setting($1, true) AS tenant").bind(marker),
        )
        .await?;

    let database_tenant = row
        .and_then(|mut r| r.remove("tenant"))
        .unwrap_or(Value::Null);

    Ok(ApiResponse::success(WhoamiResponse {
        subject: context.subject.to_string(),
        tenant: context.token.canonical(),
        roles: context.roles,
        expires_at: context.expires_at,
        database_tenant,
    }))
}
