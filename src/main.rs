mod admin;
mod backend;
mod cli;
mod config;
mod routing;
mod server;
mod session;
mod uistate;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use backend::BackendManager;
use config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = cli::Cli::parse();

    let mut config = Config::load(&cli.config)
        .with_context(|| format!("failed to load config: {}", cli.config.display()))?;
    if let Some(level) = &cli.log_level {
        config.log_level = level.clone();
    }
    if let Some(listen) = &cli.listen {
        let mut parts = listen.rsplitn(2, ':');
        let port = parts.next().context("--listen must be host:port")?;
        let host = parts.next().context("--listen must be host:port")?;
        config.host = host.to_string();
        config.port = port.parse().context("--listen port must be numeric")?;
    }

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    let ui_state_path = cli
        .ui_state
        .clone()
        .unwrap_or_else(|| sibling_path(&cli.config, "ui-state.json"));

    info!(
        config_path = %cli.config.display(),
        backends = config.backends.len(),
        "mcp-aggregate-gateway starting"
    );

    let masks = uistate::load(&ui_state_path)
        .await
        .with_context(|| format!("failed to load UI state: {}", ui_state_path.display()))?;
    let backend_manager = BackendManager::new_with_masks(Arc::new(masks));
    backend_manager.spawn_event_loop();

    for backend in config.backends.values().filter(|b| b.enabled) {
        if let Err(e) = backend_manager.add(backend.clone()).await {
            error!(backend = %backend.id, error = %e, "failed to register backend at startup");
        }
    }

    let sessions = Arc::new(session::SessionStore::new(config.session_idle_timeout));
    let shutdown_notify = Arc::new(tokio::sync::Notify::new());
    tokio::spawn(session::run_session_gc(
        Arc::clone(&sessions),
        Arc::clone(&shutdown_notify),
    ));

    let shared_config = Arc::new(arc_swap::ArcSwap::from_pointee(config.clone()));
    tokio::spawn(config::watch_config(
        cli.config.clone(),
        Arc::clone(&shared_config),
        Arc::clone(&backend_manager),
        Arc::clone(&shutdown_notify),
    ));

    let sse_ct = CancellationToken::new();
    let client_addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .with_context(|| format!("invalid listen address {}:{}", config.host, config.port))?;
    let client_router = server::build_router(
        Arc::clone(&backend_manager),
        Arc::clone(&sessions),
        client_addr,
        sse_ct.clone(),
    );
    let client_listener = tokio::net::TcpListener::bind(client_addr)
        .await
        .with_context(|| format!("failed to bind client-facing listener on {client_addr}"))?;
    info!(addr = %client_addr, "client-facing MCP endpoint listening");
    let client_shutdown = Arc::clone(&shutdown_notify);
    let client_task = tokio::spawn(async move {
        axum::serve(client_listener, client_router)
            .with_graceful_shutdown(async move { client_shutdown.notified().await })
            .await
    });

    let restart = Arc::new(tokio::sync::Notify::new());
    if config.admin.enabled {
        let admin_state = admin::AdminState {
            config: Arc::clone(&shared_config),
            backend_manager: Arc::clone(&backend_manager),
            sessions: Arc::clone(&sessions),
            config_path: cli.config.clone(),
            ui_state_path: ui_state_path.clone(),
            restart: Arc::clone(&restart),
        };
        let admin_addr: SocketAddr = config
            .admin
            .listen
            .parse()
            .with_context(|| format!("invalid admin listen address: {}", config.admin.listen))?;
        let admin_listener = tokio::net::TcpListener::bind(admin_addr)
            .await
            .with_context(|| format!("failed to bind admin listener on {admin_addr}"))?;
        info!(addr = %admin_addr, "admin control plane listening");
        let admin_shutdown = Arc::clone(&shutdown_notify);
        tokio::spawn(async move {
            if let Err(e) = axum::serve(admin_listener, admin::router(admin_state))
                .with_graceful_shutdown(async move { admin_shutdown.notified().await })
                .await
            {
                error!(error = %e, "admin control plane exited with error");
            }
        });
    }

    wait_for_shutdown_signal(&restart).await;

    info!("shutting down");
    shutdown_notify.notify_waiters();
    sse_ct.cancel();
    backend_manager.disconnect_all().await;
    if let Err(e) = uistate::save(&ui_state_path, &backend_manager.masks()).await {
        error!(error = %e, "failed to persist UI state on shutdown");
    }
    let _ = client_task.await;

    Ok(())
}

fn sibling_path(config_path: &PathBuf, file_name: &str) -> PathBuf {
    config_path
        .parent()
        .map(|dir| dir.join(file_name))
        .unwrap_or_else(|| PathBuf::from(file_name))
}

/// Resolves on SIGTERM/SIGINT or an admin-triggered restart (spec §6
/// `POST /admin/restart`) — either way the process tears down the same way;
/// restart-after-exit is left to whatever supervises this process.
#[cfg(unix)]
async fn wait_for_shutdown_signal(restart: &tokio::sync::Notify) {
    let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to install SIGTERM handler");
            return;
        }
    };
    let mut sigint = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt()) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to install SIGINT handler");
            return;
        }
    };
    tokio::select! {
        _ = sigterm.recv() => info!("received SIGTERM"),
        _ = sigint.recv() => info!("received SIGINT"),
        _ = restart.notified() => info!("admin restart requested"),
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal(restart: &tokio::sync::Notify) {
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("received ctrl-c"),
        _ = restart.notified() => info!("admin restart requested"),
    }
}
