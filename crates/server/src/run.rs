// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Top-level server runner — shared by `main` and integration tests.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::state::Services;
use crate::transport::build_router;
use crate::watch::spawn_session_watcher;

/// Initialize the tracing subscriber from config. Safe to call twice.
pub fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let result = if config.log_format == "json" {
        tracing_subscriber::fmt().json().with_env_filter(filter).try_init()
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).try_init()
    };
    let _ = result;
}

/// Build services and background tasks without binding a listener.
///
/// Integration tests use this to drive the router directly.
pub fn prepare(config: Config) -> anyhow::Result<Arc<Services>> {
    let services = Services::build(config)?;
    let router = build_router(Arc::clone(&services));
    services.set_internal_router(router);

    services.projects.spawn_invalidator(&services.bus, services.shutdown.clone());
    services.supervisor.spawn_reaper(services.shutdown.clone());
    spawn_session_watcher(
        services.config.sessions_root(),
        services.bus.clone(),
        services.shutdown.clone(),
    );
    Ok(services)
}

/// Run the server until a shutdown signal arrives.
pub async fn run(config: Config) -> anyhow::Result<()> {
    init_tracing(&config);
    config.validate()?;

    let services = prepare(config)?;
    let router = services
        .internal_router()
        .ok_or_else(|| anyhow::anyhow!("router was not initialized"))?;

    let addr = format!("{}:{}", services.config.host, services.config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!(addr = %listener.local_addr()?, install_id = %services.install_id, "porter listening");

    let shutdown = services.shutdown.clone();
    let signal_services = Arc::clone(&services);
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("shutdown signal received");
        signal_services.shutdown.cancel();
    });

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    teardown(&services).await;
    Ok(())
}

async fn wait_for_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    let mut term = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
        Ok(term) => term,
        Err(_) => {
            let _ = ctrl_c.await;
            return;
        }
    };
    tokio::select! {
        _ = ctrl_c => {}
        _ = term.recv() => {}
    }
}

/// Abort every live process within the grace window.
async fn teardown(services: &Arc<Services>) {
    let processes = services.supervisor.all_processes().await;
    if processes.is_empty() {
        return;
    }
    info!(count = processes.len(), "aborting live processes for shutdown");
    for process in &processes {
        process.abort("server shutdown");
    }
    for process in &processes {
        let _ = tokio::time::timeout(Duration::from_secs(5), process.wait_terminated()).await;
    }
}
