//! Supervisor owning every listener of the proxy.
//!
//! Listeners start in configuration order. Any fatal listener event (or an OS
//! signal) shuts all of them down together.
use std::{
    io,
    net::{IpAddr, SocketAddr},
    path::Path,
    sync::Arc,
};

use tokio::{
    sync::{broadcast, mpsc},
    task::JoinSet,
    time::timeout,
};
use tracing::{debug, error, info, warn};

use crate::{
    adapters::{
        BackendPool, FileSystemAdapter,
        http_handler::{HandlerSettings, ProxyHandler},
        listener::{Listener, ListenerEvent, ListenerHandle},
    },
    config::ProxyConfig,
    core::{certificates::CertificateStore, error::ProxyError, vhost::VirtualHostRegistry},
    ports::http_client::BackendClient,
    utils::{GracefulShutdown, ShutdownReason},
};

const OBSERVER_CAPACITY: usize = 64;

pub struct EdgeServer {
    config: ProxyConfig,
    registry: Arc<VirtualHostRegistry>,
    handler: Arc<ProxyHandler>,
}

impl EdgeServer {
    /// Build the registry, the backend pool and the request handler
    pub fn new(config: ProxyConfig) -> Self {
        let backend = Arc::new(BackendPool::new(&config.timeouts, &config.backend_pool));
        Self::with_backend(config, backend)
    }

    pub fn with_backend(config: ProxyConfig, backend: Arc<dyn BackendClient>) -> Self {
        let registry = Arc::new(VirtualHostRegistry::from_config(&config));
        let handler = Arc::new(ProxyHandler::new(
            registry.clone(),
            backend,
            Arc::new(FileSystemAdapter::new()),
            HandlerSettings::from(&config),
        ));
        Self {
            config,
            registry,
            handler,
        }
    }

    /// Start one listener per server binding.
    ///
    /// Certificates of an encrypted port are loaded right before its listener
    /// starts. On any failure the listeners started so far are stopped again
    /// and the error is returned.
    pub async fn start(self, shutdown: Arc<GracefulShutdown>) -> Result<RunningServer, ProxyError> {
        let bind_ip = parse_bind_address(&self.config)?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let mut listeners: Vec<ListenerHandle> = Vec::new();

        for server in self.registry.server_bindings() {
            let started = async {
                let listener = if server.encrypted {
                    let store = self.load_certificates(server.port).await?;
                    Listener::tls(Arc::new(store), self.config.timeouts.clone())
                } else {
                    Listener::plaintext(self.config.timeouts.clone())
                };
                listener
                    .start(
                        SocketAddr::new(bind_ip, server.port),
                        self.handler.clone(),
                        events_tx.clone(),
                    )
                    .await
            }
            .await;

            match started {
                Ok(handle) => listeners.push(handle),
                Err(e) => {
                    error!(port = server.port, error = %e, "Failed to start listener");
                    for handle in listeners {
                        handle.stop().await;
                    }
                    return Err(e);
                }
            }
        }

        info!(listeners = listeners.len(), "Edge server started");
        Ok(RunningServer {
            listeners,
            events_rx,
            observers: broadcast::channel(OBSERVER_CAPACITY).0,
            shutdown,
        })
    }

    async fn load_certificates(&self, port: u16) -> Result<CertificateStore, ProxyError> {
        let Some(dir) = self.config.certificates_dir.as_deref() else {
            return Err(ProxyError::FatalCertLoad {
                certificate: format!("port {port}"),
                path: Default::default(),
                source: io::Error::new(
                    io::ErrorKind::NotFound,
                    "certificates_dir is not configured",
                ),
            });
        };
        CertificateStore::load(&self.registry, port, Path::new(dir)).await
    }
}

fn parse_bind_address(config: &ProxyConfig) -> Result<IpAddr, ProxyError> {
    config
        .bind_address
        .parse()
        .map_err(|e| ProxyError::FatalListener {
            port: config.servers.first().map(|s| s.port).unwrap_or_default(),
            source: io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid bind address '{}': {e}", config.bind_address),
            ),
        })
}

/// Listeners that are up and accepting
pub struct RunningServer {
    listeners: Vec<ListenerHandle>,
    events_rx: mpsc::UnboundedReceiver<ListenerEvent>,
    observers: broadcast::Sender<ListenerEvent>,
    shutdown: Arc<GracefulShutdown>,
}

impl RunningServer {
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.listeners.iter().map(ListenerHandle::local_addr).collect()
    }

    /// Receive every listener event processed by [`RunningServer::run`]
    pub fn subscribe_events(&self) -> broadcast::Receiver<ListenerEvent> {
        self.observers.subscribe()
    }

    /// Supervise listeners until shutdown, then stop all of them.
    pub async fn run(mut self) -> ShutdownReason {
        let reason = loop {
            tokio::select! {
                reason = self.shutdown.wait_for_shutdown_signal() => break reason,
                event = self.events_rx.recv() => {
                    let Some(event) = event else {
                        break self.shutdown.reason().unwrap_or(ShutdownReason::Graceful);
                    };
                    self.observe(event).await;
                }
            }
        };

        info!(?reason, "Stopping listeners");
        let mut stopping = JoinSet::new();
        for handle in self.listeners.drain(..) {
            stopping.spawn(handle.stop());
        }

        let drained = timeout(self.shutdown.shutdown_timeout(), async {
            while stopping.join_next().await.is_some() {}
        })
        .await;

        while let Ok(event) = self.events_rx.try_recv() {
            let _ = self.observers.send(event);
        }

        match drained {
            Ok(()) => {
                info!("All listeners stopped");
                reason
            }
            Err(_) if reason.is_fatal() => reason,
            Err(_) => {
                warn!(
                    timeout = ?self.shutdown.shutdown_timeout(),
                    "Connections did not drain in time, forcing shutdown"
                );
                ShutdownReason::Force
            }
        }
    }

    async fn observe(&self, event: ListenerEvent) {
        let fatal = match &event {
            ListenerEvent::Error { error, .. } if event.is_fatal() => Some(ShutdownReason::Fatal {
                port: event.port(),
                message: error.to_string(),
            }),
            ListenerEvent::Error { error, .. } => {
                debug!(port = event.port(), error = %error, "Listener reported a connection error");
                None
            }
            ListenerEvent::Listening { .. } | ListenerEvent::Closed { .. } => None,
        };

        let _ = self.observers.send(event);

        if let Some(reason) = fatal {
            error!(?reason, "Fatal listener error, shutting down every listener");
            self.shutdown.trigger_shutdown(reason);
            // Let observers see the fatal event before listeners start closing
            tokio::task::yield_now().await;
        }
    }
}
