//! Process lifecycle for the long-running services.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// A service started once at boot and stopped once at shutdown.
#[async_trait]
pub trait HostedService: Send + Sync {
    fn name(&self) -> &str;

    /// Start background work. Must return promptly; cancelling `shutdown`
    /// asks the service to wind down.
    async fn start(&self, shutdown: &CancellationToken) -> Result<()>;

    /// Wait for the service to finish, within its own deadline.
    async fn stop(&self) -> Result<()>;
}

/// Owns the root cancellation token shared by every hosted service.
pub struct Host {
    services: Vec<Arc<dyn HostedService>>,
    shutdown: CancellationToken,
}

impl Host {
    pub fn new() -> Self {
        Self {
            services: Vec::new(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn add(&mut self, service: Arc<dyn HostedService>) {
        self.services.push(service);
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Start every service in registration order and wait for `signal` (or
    /// the root token). Services are then stopped in reverse order, each
    /// with its own shutdown policy, and the root token is cancelled last.
    pub async fn run<S>(self, signal: S) -> Result<()>
    where
        S: Future<Output = ()>,
    {
        for (started, service) in self.services.iter().enumerate() {
            if let Err(e) = service.start(&self.shutdown).await {
                error!("Failed to start {}: {:#}", service.name(), e);
                self.shutdown.cancel();
                self.stop_services(&self.services[..started]).await;
                return Err(e).with_context(|| format!("Failed to start {}", service.name()));
            }
            info!("Started {}", service.name());
        }

        tokio::select! {
            _ = signal => info!("Shutdown signal received"),
            _ = self.shutdown.cancelled() => info!("Shutdown requested"),
        }

        self.stop_services(&self.services).await;
        self.shutdown.cancel();
        info!("All services stopped");
        Ok(())
    }

    async fn stop_services(&self, services: &[Arc<dyn HostedService>]) {
        for service in services.iter().rev() {
            info!("Stopping {}...", service.name());
            if let Err(e) = service.stop().await {
                error!("Failed to stop {}: {:#}", service.name(), e);
            }
        }
    }
}

impl Default for Host {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolves on Ctrl+C, or on SIGTERM where available.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
