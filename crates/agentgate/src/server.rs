//! Wiring and the HTTP server lifecycle.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use log::info;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::agent::ImageStore;
use crate::api::{AppState, AuthState, HttpState, create_router};
use crate::chat::{ChatService, ChatSettings};
use crate::config::GatewayConfig;
use crate::session::SessionStore;

/// A fully wired application.
pub struct Gateway {
    pub router: Router,
    pub sessions: Arc<SessionStore>,
}

impl Gateway {
    /// Wire the services and router. Loads persisted sessions if configured.
    pub fn build(config: &GatewayConfig) -> Self {
        let sessions = Arc::new(SessionStore::open(config.sessions.clone()));
        let chat = Arc::new(ChatService::new(
            ChatSettings::from(config),
            Arc::clone(&sessions),
            ImageStore::new(&config.image_dir),
        ));
        let state = AppState::new(
            chat,
            AuthState::new(config.api_key.clone()),
            HttpState {
                allowed_origins: config.allowed_origins.clone(),
                max_body_bytes: config.max_body_bytes,
            },
        );
        Self {
            router: create_router(state),
            sessions,
        }
    }
}

/// Serve until Ctrl-C or SIGTERM, then flush the session store.
pub async fn serve(config: GatewayConfig) -> Result<()> {
    let gateway = Gateway::build(&config);
    let shutdown = CancellationToken::new();
    let maintenance = gateway.sessions.spawn_maintenance(shutdown.clone());

    let listener = TcpListener::bind((config.host.as_str(), config.port))
        .await
        .with_context(|| format!("binding to {}:{}", config.host, config.port))?;
    let addr = listener.local_addr().context("reading bound address")?;

    info!("Listening on http://{}", addr);
    if config.api_key.is_none() {
        info!("No API key configured; requests are not authenticated");
    }
    info!(
        "Agent: {} (default model {}, default cwd {})",
        config.agent.binary.display(),
        config.default_model,
        config.default_cwd.display()
    );

    axum::serve(listener, gateway.router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running server")?;

    shutdown.cancel();
    if let Err(e) = maintenance.await {
        log::warn!("Session maintenance task failed: {:?}", e);
    }
    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
