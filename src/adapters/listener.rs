//! One listening socket, plaintext or TLS, serving HTTP/1.1.
use std::{convert::Infallible, io, net::SocketAddr, sync::Arc, time::Duration};

use hyper::{Request, body::Incoming, server::conn::http1, service::service_fn};
use hyper_util::rt::{TokioIo, TokioTimer};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{TcpListener, TcpStream},
    sync::mpsc::UnboundedSender,
    task::JoinHandle,
    time::timeout,
};
use tokio_rustls::TlsAcceptor;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{Instrument, debug, error, info, warn};

use crate::{
    adapters::tls,
    config::TimeoutConfig,
    core::{certificates::CertificateStore, error::ProxyError},
    ports::http_server::{ConnectionInfo, RequestHandler},
    tracing_setup::configure_component_tracing,
};

/// Lifecycle notifications emitted by a running listener
#[derive(Debug, Clone)]
pub enum ListenerEvent {
    Listening { port: u16, local_addr: SocketAddr },
    Error { port: u16, fatal: bool, error: Arc<ProxyError> },
    Closed { port: u16 },
}

impl ListenerEvent {
    pub fn port(&self) -> u16 {
        match self {
            ListenerEvent::Listening { port, .. }
            | ListenerEvent::Error { port, .. }
            | ListenerEvent::Closed { port } => *port,
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, ListenerEvent::Error { fatal: true, .. })
    }
}

/// Accept errors that only concern a single connection
fn is_connection_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
    )
}

/// Running out of file descriptors clears up on its own once connections close
fn is_resource_exhausted(e: &io::Error) -> bool {
    matches!(e.raw_os_error(), Some(23) | Some(24))
}

pub struct Listener {
    tls: Option<Arc<CertificateStore>>,
    timeouts: TimeoutConfig,
}

impl Listener {
    pub fn plaintext(timeouts: TimeoutConfig) -> Self {
        Self { tls: None, timeouts }
    }

    pub fn tls(store: Arc<CertificateStore>, timeouts: TimeoutConfig) -> Self {
        Self {
            tls: Some(store),
            timeouts,
        }
    }

    /// Bind `addr` and start accepting connections.
    ///
    /// Resolves once the socket is listening. A bind failure is returned as
    /// [`ProxyError::FatalListener`]; errors after that are reported on `events`.
    pub async fn start<H: RequestHandler>(
        &self,
        addr: SocketAddr,
        handler: Arc<H>,
        events: UnboundedSender<ListenerEvent>,
    ) -> Result<ListenerHandle, ProxyError> {
        let acceptor = match &self.tls {
            Some(store) => Some(TlsAcceptor::from(tls::server_config(store.clone())?)),
            None => None,
        };

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ProxyError::FatalListener {
                port: addr.port(),
                source,
            })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| ProxyError::FatalListener {
                port: addr.port(),
                source,
            })?;
        let port = local_addr.port();

        info!(%local_addr, encrypted = acceptor.is_some(), "Listener started");
        let _ = events.send(ListenerEvent::Listening { port, local_addr });

        let token = CancellationToken::new();
        let accept_loop = AcceptLoop {
            listener,
            port,
            acceptor,
            handler,
            events,
            token: token.clone(),
            frontend_keep_alive: self.timeouts.frontend_keep_alive(),
            tls_handshake_timeout: self.timeouts.tls_handshake_timeout(),
        };
        let span = configure_component_tracing("listener", port);
        let task = tokio::spawn(accept_loop.run().instrument(span));

        Ok(ListenerHandle {
            local_addr,
            token,
            task,
        })
    }
}

/// Handle to a started listener
pub struct ListenerHandle {
    local_addr: SocketAddr,
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl ListenerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting, let in-flight connections finish their current exchange,
    /// and wait for the accept loop to exit.
    pub async fn stop(self) {
        self.token.cancel();
        if let Err(e) = self.task.await {
            error!(port = self.local_addr.port(), error = %e, "Listener task failed");
        }
    }
}

struct AcceptLoop<H> {
    listener: TcpListener,
    port: u16,
    acceptor: Option<TlsAcceptor>,
    handler: Arc<H>,
    events: UnboundedSender<ListenerEvent>,
    token: CancellationToken,
    frontend_keep_alive: Duration,
    tls_handshake_timeout: Duration,
}

impl<H: RequestHandler> AcceptLoop<H> {
    async fn run(self) {
        let connections = TaskTracker::new();

        loop {
            let accepted = tokio::select! {
                _ = self.token.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, remote_addr)) => {
                    let conn = Connection {
                        port: self.port,
                        remote_addr,
                        acceptor: self.acceptor.clone(),
                        handler: self.handler.clone(),
                        events: self.events.clone(),
                        token: self.token.clone(),
                        frontend_keep_alive: self.frontend_keep_alive,
                        tls_handshake_timeout: self.tls_handshake_timeout,
                    };
                    connections.spawn(conn.run(stream).in_current_span());
                }
                Err(e) if is_connection_error(&e) => {
                    debug!(error = %e, "Transient accept error");
                }
                Err(e) if is_resource_exhausted(&e) => {
                    warn!(error = %e, "Accept failed, backing off");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
                Err(source) => {
                    error!(error = %source, "Listener socket failed");
                    let _ = self.events.send(ListenerEvent::Error {
                        port: self.port,
                        fatal: true,
                        error: Arc::new(ProxyError::FatalListener {
                            port: self.port,
                            source,
                        }),
                    });
                    break;
                }
            }
        }

        drop(self.listener);
        connections.close();
        connections.wait().await;
        info!("Listener closed");
        let _ = self.events.send(ListenerEvent::Closed { port: self.port });
    }
}

struct Connection<H> {
    port: u16,
    remote_addr: SocketAddr,
    acceptor: Option<TlsAcceptor>,
    handler: Arc<H>,
    events: UnboundedSender<ListenerEvent>,
    token: CancellationToken,
    frontend_keep_alive: Duration,
    tls_handshake_timeout: Duration,
}

impl<H: RequestHandler> Connection<H> {
    async fn run(self, stream: TcpStream) {
        let _ = stream.set_nodelay(true);
        let Some(acceptor) = self.acceptor.clone() else {
            self.serve(stream, false).await;
            return;
        };

        let reason = match timeout(self.tls_handshake_timeout, acceptor.accept(stream)).await {
            Ok(Ok(tls_stream)) => {
                self.serve(tls_stream, true).await;
                return;
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("handshake timed out after {:?}", self.tls_handshake_timeout),
        };

        debug!(remote = %self.remote_addr, %reason, "TLS handshake failed");
        let _ = self.events.send(ListenerEvent::Error {
            port: self.port,
            fatal: false,
            error: Arc::new(ProxyError::TlsContext {
                server_name: None,
                reason,
            }),
        });
    }

    async fn serve<I>(&self, io: I, encrypted: bool)
    where
        I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let info = ConnectionInfo {
            local_port: self.port,
            remote_addr: self.remote_addr,
            encrypted,
        };
        let handler = self.handler.clone();
        let service = service_fn(move |req: Request<Incoming>| {
            let handler = handler.clone();
            async move { Ok::<_, Infallible>(handler.handle(req, info).await) }
        });

        let mut builder = http1::Builder::new();
        builder
            .timer(TokioTimer::new())
            .keep_alive(true)
            .header_read_timeout(self.frontend_keep_alive);
        let conn = builder.serve_connection(TokioIo::new(io), service);
        tokio::pin!(conn);

        let result = tokio::select! {
            result = conn.as_mut() => result,
            _ = self.token.cancelled() => {
                conn.as_mut().graceful_shutdown();
                conn.as_mut().await
            }
        };

        if let Err(e) = result {
            debug!(remote = %self.remote_addr, error = %e, "Connection closed with error");
        }
    }
}
