//! Server lifecycle management
//!
//! Manages the startup and shutdown of all server components:
//! - HTTP/WebSocket server
//! - SFU manager and its media engine

use std::net::SocketAddr;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use huddle_core::{bootstrap::Services, Config};
use huddle_sfu::engine::MediaEngine;

/// Huddle server - manages all server components
pub struct HuddleServer {
    config: Config,
    services: Services,
}

impl HuddleServer {
    pub const fn new(config: Config, services: Services) -> Self {
        Self { config, services }
    }

    /// Start all servers and wait for shutdown signal
    ///
    /// Returns an error when the media engine dies: the process should exit
    /// so a supervisor restarts it cleanly.
    pub async fn start(self) -> anyhow::Result<()> {
        info!("Starting Huddle server...");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let http_handle = self.start_http_server(shutdown_rx).await?;

        info!("All servers started successfully");

        let engine = self.services.engine.clone();
        let outcome = tokio::select! {
            _ = http_handle => {
                error!("HTTP server stopped unexpectedly");
                Err(anyhow::anyhow!("HTTP server stopped unexpectedly"))
            }
            () = engine.closed() => {
                error!("Media engine closed, shutting down");
                Err(anyhow::anyhow!("media engine closed"))
            }
            () = shutdown_signal() => {
                info!("Shutdown signal received, starting graceful shutdown...");
                Ok(())
            }
        };

        // Signal all components to shut down
        let _ = shutdown_tx.send(true);

        self.shutdown().await;
        outcome
    }

    /// Gracefully shut down all server components
    async fn shutdown(&self) {
        info!("Shutting down Huddle server...");

        // 1. Disconnect every peer and close all rooms
        let stats = self.services.sfu_manager.stats();
        info!(
            rooms = stats.rooms.active_rooms,
            sessions = stats.sessions.active_sessions,
            "Shutting down SFU manager..."
        );
        self.services.sfu_manager.shutdown().await;

        // 2. Stop the media engine
        self.services.engine.shutdown();
        info!("Huddle server shut down");
    }

    /// Start HTTP server with graceful shutdown support
    async fn start_http_server(
        &self,
        shutdown_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<JoinHandle<()>> {
        let http_addr: SocketAddr = self
            .config
            .http_address()
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid HTTP address '{}': {e}", self.config.http_address()))?;

        let http_router =
            huddle_api::create_router(self.services.sfu_manager.clone(), &self.config.server);

        let listener = tokio::net::TcpListener::bind(http_addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind HTTP address {http_addr}: {e}"))?;
        info!("HTTP server listening on {}", http_addr);

        let handle = tokio::spawn(async move {
            let mut rx = shutdown_rx;
            let graceful = async move {
                let _ = rx.changed().await;
            };

            if let Err(e) = axum::serve(listener, http_router)
                .with_graceful_shutdown(graceful)
                .await
            {
                error!("HTTP server error: {}", e);
            }

            info!("HTTP server shut down gracefully");
        });

        Ok(handle)
    }
}

/// Wait for a shutdown signal (SIGTERM or SIGINT/Ctrl+C)
async fn shutdown_signal() {
    let ctrl_c = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl+C signal");
            }
            Err(e) => {
                error!("Failed to install Ctrl+C handler: {}", e);
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
                info!("Received SIGTERM signal");
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
