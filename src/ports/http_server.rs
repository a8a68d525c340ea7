use std::net::SocketAddr;

use axum::body::Body as AxumBody;
use hyper::{Request, Response, body::Incoming};

/// Facts about the client connection a request arrived on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// Port the listener accepted the connection on
    pub local_port: u16,
    pub remote_addr: SocketAddr,
    /// Whether the connection was TLS-terminated by the edge
    pub encrypted: bool,
}

/// RequestHandler defines the port listeners hand every parsed request to
pub trait RequestHandler: Send + Sync + 'static {
    /// Handle an incoming HTTP request
    ///
    /// Handlers never fail: every error is converted into an edge response.
    fn handle(
        &self,
        req: Request<Incoming>,
        conn: ConnectionInfo,
    ) -> impl std::future::Future<Output = Response<AxumBody>> + Send;
}
