use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body as AxumBody;
use hyper::{Request, Response, Version};
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::{TokioExecutor, TokioTimer},
};

use crate::{
    config::{BackendPoolConfig, TimeoutConfig},
    ports::http_client::{BackendClient, BackendError, BackendResult},
};

/// Keep-alive connection pool to local backend processes.
///
/// Backends are plaintext HTTP/1.1 on the loopback interface, so the pool is a
/// bare `HttpConnector` without TLS. Idle connections are kept for the backend
/// keep-alive period advertised on every forwarded request. The pool is the only
/// mutable state shared between requests; one instance is injected into the
/// request handler at startup.
#[derive(Clone)]
pub struct BackendPool {
    client: Client<HttpConnector, AxumBody>,
}

impl BackendPool {
    pub fn new(timeouts: &TimeoutConfig, pool: &BackendPoolConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.set_keepalive(Some(timeouts.backend_keep_alive()));

        let mut builder = Client::builder(TokioExecutor::new());
        builder
            .pool_idle_timeout(timeouts.backend_keep_alive())
            .pool_timer(TokioTimer::new());
        if let Some(max_idle) = pool.max_idle_per_backend {
            builder.pool_max_idle_per_host(max_idle);
        }

        tracing::debug!(
            idle_timeout_secs = timeouts.backend_keep_alive_secs,
            max_idle_per_backend = ?pool.max_idle_per_backend,
            "Created backend connection pool"
        );
        Self {
            client: builder.build(connector),
        }
    }

    pub fn with_idle_timeout(idle_timeout: Duration) -> Self {
        let timeouts = TimeoutConfig {
            backend_keep_alive_secs: idle_timeout.as_secs().max(1),
            ..TimeoutConfig::default()
        };
        Self::new(&timeouts, &BackendPoolConfig::default())
    }
}

#[async_trait]
impl BackendClient for BackendPool {
    async fn send_request(&self, req: Request<AxumBody>) -> BackendResult<Response<AxumBody>> {
        if req.uri().host().is_none() {
            return Err(BackendError::InvalidRequest(format!(
                "Outgoing URI has no host: {}",
                req.uri()
            )));
        }

        let (mut parts, body) = req.into_parts();
        parts.version = Version::HTTP_11;
        let method = parts.method.clone();
        let uri = parts.uri.clone();

        match self.client.request(Request::from_parts(parts, body)).await {
            Ok(response) => Ok(response.map(AxumBody::new)),
            Err(e) if e.is_connect() => {
                tracing::debug!(%method, %uri, error = %e, "Backend connection failed");
                Err(BackendError::ConnectionError(format!(
                    "Connecting for {method} {uri} failed: {e}"
                )))
            }
            Err(e) => {
                tracing::debug!(%method, %uri, error = %e, "Backend request failed");
                Err(BackendError::RequestError(format!(
                    "Request to {method} {uri} failed: {e}"
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use axum::{Router, routing::get};
    use http_body_util::BodyExt;
    use tokio::net::TcpListener;

    use super::*;

    async fn spawn_backend() -> SocketAddr {
        let app = Router::new().route("/hello", get(|| async { "hello from backend" }));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    #[tokio::test]
    async fn test_send_request_streams_response() {
        let addr = spawn_backend().await;
        let pool = BackendPool::new(&TimeoutConfig::default(), &BackendPoolConfig::default());

        let request = Request::builder()
            .uri(format!("http://127.0.0.1:{}/hello", addr.port()))
            .body(AxumBody::empty())
            .unwrap();
        let response = pool.send_request(request).await.unwrap();
        assert_eq!(response.status(), 200);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"hello from backend");
    }

    #[tokio::test]
    async fn test_refused_connection_is_connect_error() {
        // Bind then drop to get a port nothing listens on
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let pool = BackendPool::with_idle_timeout(Duration::from_secs(5));
        let request = Request::builder()
            .uri(format!("http://127.0.0.1:{port}/"))
            .body(AxumBody::empty())
            .unwrap();
        let err = pool.send_request(request).await.unwrap_err();
        assert!(err.is_connect());
    }

    #[tokio::test]
    async fn test_relative_uri_is_rejected() {
        let pool = BackendPool::with_idle_timeout(Duration::from_secs(5));
        let request = Request::builder().uri("/").body(AxumBody::empty()).unwrap();
        assert!(matches!(
            pool.send_request(request).await,
            Err(BackendError::InvalidRequest(_))
        ));
    }
}
