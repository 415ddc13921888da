use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use runtime::{Config, RunOrchestrator};
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const LOG_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::parse_config();
    init_tracing(config.log_json);

    tokio::fs::create_dir_all(&config.workspace_root)
        .await
        .with_context(|| {
            format!(
                "failed to create workspace root {}",
                config.workspace_root.display()
            )
        })?;

    let engine = config.runtime_kind().into_engine();
    info!(
        bind = %config.bind,
        runtime = %config.container_runtime,
        workspace_root = %config.workspace_root.display(),
        "starting shipyard runtime"
    );

    let bind = config.bind;
    let orchestrator = Arc::new(RunOrchestrator::new(config, engine));
    let sweeper = orchestrator.logs().spawn_sweeper(LOG_SWEEP_INTERVAL);

    runtime::server::serve(bind, orchestrator, shutdown_signal()).await?;
    sweeper.abort();
    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("runtime=info,capsules_container=info,tower_http=info")
    });
    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer())
            .init();
    }
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for shutdown signal");
        return;
    }
    info!("shutdown signal received");
}
