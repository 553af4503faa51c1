use std::sync::Arc;
use tracing::info;

use inferd_gateway_server::config::ServerConfig;
use inferd_gateway_server::{create_app, AppState};
use inferd_orchestrator::IdleReaper;
use inferd_runtime::DockerRuntime;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,inferd_gateway_server=debug".into()),
        )
        .init();

    let config = ServerConfig::from_env()?;

    let runtime = Arc::new(DockerRuntime::connect().await?);
    let state = AppState::new(runtime, &config);

    let reaper = Arc::new(IdleReaper::new(
        state.tracker.clone(),
        state.runtime.clone(),
        config.reaper_interval,
    ));
    reaper.spawn();

    let app = create_app(state);

    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    info!("inferd gateway listening on {}", config.bind_addr);
    axum::serve(listener, app).await?;

    Ok(())
}
