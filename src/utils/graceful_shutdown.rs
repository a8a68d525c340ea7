use std::{
    sync::{Arc, OnceLock},
    time::Duration,
};

use eyre::{Result, WrapErr};
use tokio::{signal, sync::broadcast};

/// Why the proxy is stopping
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// SIGTERM or SIGINT
    Graceful,
    /// A listener reported a fatal error
    Fatal { port: u16, message: String },
    /// In-flight connections did not drain within the shutdown timeout
    Force,
}

impl ShutdownReason {
    pub fn is_fatal(&self) -> bool {
        matches!(self, ShutdownReason::Fatal { .. })
    }
}

/// Broadcasts the first shutdown request to every subscriber.
///
/// The first reason wins and is remembered, so late subscribers still observe it.
pub struct GracefulShutdown {
    shutdown_tx: broadcast::Sender<ShutdownReason>,
    reason: Arc<OnceLock<ShutdownReason>>,
    /// Upper bound for draining in-flight connections
    shutdown_timeout: Duration,
}

impl GracefulShutdown {
    /// Create a shutdown manager with a 30-second drain timeout
    pub fn new() -> Self {
        Self::with_timeout(Duration::from_secs(30))
    }

    pub fn with_timeout(shutdown_timeout: Duration) -> Self {
        let (shutdown_tx, _) = broadcast::channel(16);
        Self {
            shutdown_tx,
            reason: Arc::new(OnceLock::new()),
            shutdown_timeout,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ShutdownReason> {
        self.shutdown_tx.subscribe()
    }

    pub fn is_shutdown_initiated(&self) -> bool {
        self.reason.get().is_some()
    }

    pub fn reason(&self) -> Option<ShutdownReason> {
        self.reason.get().cloned()
    }

    pub fn shutdown_timeout(&self) -> Duration {
        self.shutdown_timeout
    }

    /// Request shutdown. Returns false when shutdown was already initiated.
    pub fn trigger_shutdown(&self, reason: ShutdownReason) -> bool {
        if self.reason.set(reason.clone()).is_err() {
            tracing::debug!(?reason, "Shutdown already initiated, ignoring");
            return false;
        }

        tracing::info!(?reason, "Shutdown initiated");
        // No receivers is fine; the reason is remembered for later waiters
        let _ = self.shutdown_tx.send(reason);
        true
    }

    /// Wait for SIGINT or SIGTERM and trigger a graceful shutdown
    pub async fn run_signal_handler(&self) -> Result<()> {
        tracing::info!("Signal handler started, listening for SIGTERM and SIGINT");

        #[cfg(unix)]
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
            .wrap_err("Failed to register SIGTERM handler")?;

        #[cfg(unix)]
        let terminate = sigterm.recv();
        #[cfg(not(unix))]
        let terminate = std::future::pending::<Option<()>>();

        tokio::select! {
            result = signal::ctrl_c() => {
                result.wrap_err("Failed to listen for Ctrl+C")?;
                tracing::info!("Received SIGINT, initiating graceful shutdown");
            }
            _ = terminate => {
                tracing::info!("Received SIGTERM, initiating graceful shutdown");
            }
        }

        self.trigger_shutdown(ShutdownReason::Graceful);
        Ok(())
    }

    /// Wait until shutdown is triggered and return the first reason
    pub async fn wait_for_shutdown_signal(&self) -> ShutdownReason {
        let mut receiver = self.subscribe();
        if let Some(reason) = self.reason() {
            return reason;
        }

        match receiver.recv().await {
            Ok(reason) => reason,
            Err(_) => self.reason().unwrap_or(ShutdownReason::Force),
        }
    }
}

impl Default for GracefulShutdown {
    fn default() -> Self {
        Self::new()
    }
}
