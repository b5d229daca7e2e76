use axum::{middleware::from_fn_with_state, routing::get, Router};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::config::AppConfig;
use crate::executor::ScopedExecutor;
use crate::guard::TenantGuard;
use crate::handlers;
use crate::middleware::tenant_auth_middleware;

/// Shared state handed to every handler
#[derive(Clone)]
pub struct AppState {
    pub executor: ScopedExecutor,
    pub guard: Arc<TenantGuard>,
}

impl AppState {
    pub fn new(executor: ScopedExecutor, guard: TenantGuard) -> Self {
        Self {
            executor,
            guard: Arc::new(guard),
        }
    }
}

pub fn app(state: AppState, config: &AppConfig) -> Router {
    let router = Router::new()
        // Public
        .route("/health", get(handlers::health_get))
        // Protected
        .merge(protected_routes(state.clone()))
        .with_state(state)
        .layer(CorsLayer::permissive());

    if config.api.enable_request_logging {
        router.layer(TraceLayer::new_for_http())
    } else {
        router
    }
}

fn protected_routes(state: AppState) -> Router<AppState> {
    Router::new()
        .route("/api/whoami", get(handlers::whoami_get))
        .route("/api/audit/violations", get(handlers::violations_get))
        .route_layer(from_fn_with_state(state, tenant_auth_middleware))
}

/// Bind the listener and serve until shutdown, then close the session pool
pub async fn serve(state: AppState, config: &AppConfig) -> anyhow::Result<()> {
    let executor = state.executor.clone();
    let app = app(state, config);

    let bind_addr = format!("0.0.0.0:{}", config.api.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .map_err(|e| anyhow::anyhow!("failed to bind {}: {}", bind_addr, e))?;

    tracing::info!("Monk scope server listening on http://{}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    executor.pool().close().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
