use axum::{
    extract::{Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::Response,
};

use crate::error::ApiError;
use crate::guard::{GuardError, TenantContext};
use crate::server::AppState;

/// Tenant authentication middleware.
///
/// Runs the tenant guard once per request and injects the resulting
/// [`TenantContext`] into request extensions; handlers take it as
/// `Extension<TenantContext>` and pass it explicitly to every database call.
/// Requests without a valid tenant claim never reach a handler, so they never
/// lease a session.
pub async fn tenant_auth_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let context = authenticate_request(&state, &request)?;

    tracing::debug!(
        "Request authenticated: subject={}, tenant={}",
        context.subject,
        context.token
    );

    request.extensions_mut().insert(context);
    Ok(next.run(request).await)
}

fn authenticate_request(state: &AppState, request: &Request) -> Result<TenantContext, GuardError> {
    let header = match request.headers().get(AUTHORIZATION) {
        Some(value) => Some(value.to_str().map_err(|_| {
            GuardError::MalformedCredential("Invalid Authorization header format".to_string())
        })?),
        None => None,
    };
    state.guard.authenticate_header(header)
}
