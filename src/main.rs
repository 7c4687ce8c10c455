use std::net::SocketAddr;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use smartroads_sync::{
    config::Config,
    dashboard::{DashboardModule, RoleDashboard},
    proxy::{self, ProxyState},
    AppContext,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env()?;
    let bind_addr = config.bind_addr.clone();
    let origin = config.worker.origin.clone();
    let role = config.role;
    let ctx = AppContext::initialize(config).await?;

    match ctx.worker.install().await {
        Ok(count) => info!(count, "offline assets cached"),
        Err(e) => warn!(error = %e, "install incomplete, serving from network only"),
    }
    ctx.worker.activate().await;
    ctx.realtime.connect().await;

    let mut dashboard = RoleDashboard::new(role);
    dashboard.init(&ctx).await?;

    let router = proxy::router(ProxyState {
        worker: ctx.worker.clone(),
        origin,
    });

    let addr: SocketAddr = bind_addr.parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("listening on {}", addr);

    let served = axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| {
            error!(error = %e, "server failed");
            e
        });

    dashboard.teardown().await;
    ctx.teardown().await;
    served?;

    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}
