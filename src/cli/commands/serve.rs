use clap::Args;
use std::sync::Arc;

use crate::config::{self, Environment};
use crate::engine::{EngineRef, MemoryEngine, PgEngine};
use crate::executor::ScopedExecutor;
use crate::guard::TenantGuard;
use crate::server::{self, AppState};

#[derive(Args, Debug)]
pub struct ServeArgs {
    #[arg(long, help = "Port to listen on (overrides MONK_API_PORT)")]
    pub port: Option<u16>,

    #[arg(long, help = "Use the in-process engine instead of DATABASE_URL")]
    pub in_memory: bool,
}

pub async fn handle(args: ServeArgs) -> anyhow::Result<()> {
    let mut config = config::config().clone();
    config.validate()?;
    if let Some(port) = args.port {
        config.api.port = port;
    }

    tracing::info!("Starting monk-scope in {:?} mode", config.environment);

    let engine: EngineRef = match (&config.database.url, args.in_memory) {
        (_, true) => {
            if config.environment == Environment::Production {
                anyhow::bail!("the in-memory engine is not available in production");
            }
            tracing::warn!("Using in-memory engine; data is not persisted");
            Arc::new(MemoryEngine::new())
        }
        (Some(url), false) => {
            tracing::info!(
                "Using postgres engine at {}",
                config.database.redacted_url().unwrap_or_default()
            );
            Arc::new(PgEngine::from_url(url)?)
        }
        (None, false) => anyhow::bail!("DATABASE_URL is not set (use --in-memory for a local engine)"),
    };

    let guard = TenantGuard::from_config(&config.security)?;
    let executor = ScopedExecutor::from_config(engine, &config);

    server::serve(AppState::new(executor, guard), &config).await
}
