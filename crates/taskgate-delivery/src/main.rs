use anyhow::Context;
use clap::Parser;
use std::{net::SocketAddr, sync::Arc};
use taskgate_delivery::{
    build_state,
    config::DeliveryConfig,
    controller::MapHandlerRegistry,
    handlers::LogPayloadHandler,
    load_status_mapper, load_task_types, router,
};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,taskgate_delivery=debug")),
        )
        .init();

    let cfg = DeliveryConfig::parse();
    let addr: SocketAddr = cfg.bind.parse().context("parse bind addr")?;

    let registry = Arc::new(load_task_types(&cfg)?);
    let mapper = Arc::new(load_status_mapper(&cfg)?);

    let mut handlers = MapHandlerRegistry::new();
    for task_type in registry.task_types() {
        handlers.insert(task_type, Arc::new(LogPayloadHandler));
    }

    let state = build_state(cfg, registry, mapper, Arc::new(handlers))
        .await
        .context("build state")?;
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("bind tcp listener")?;
    let local = listener.local_addr().context("read local addr")?;
    tracing::info!(addr = %local, "delivery endpoint listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serve delivery endpoint")?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %err, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}
