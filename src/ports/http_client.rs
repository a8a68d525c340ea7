use async_trait::async_trait;
use axum::body::Body as AxumBody;
use hyper::{Request, Response};
use thiserror::Error;

/// Custom error type for backend pool operations
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum BackendError {
    /// Error when no connection to the backend could be established
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// Error when the request failed after the connection was established
    #[error("Request error: {0}")]
    RequestError(String),

    /// Error when the outbound request could not be built
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl BackendError {
    pub fn is_connect(&self) -> bool {
        matches!(self, BackendError::ConnectionError(_))
    }
}

/// Result type alias for backend pool operations
pub type BackendResult<T> = Result<T, BackendError>;

/// BackendClient defines the port (interface) for reaching local backend processes
#[async_trait]
pub trait BackendClient: Send + Sync + 'static {
    /// Send a request to a backend, resolving once the response headers arrive
    ///
    /// The returned body streams the backend response; dropping it (or dropping
    /// the pending future) tears down the backend request.
    async fn send_request(&self, req: Request<AxumBody>) -> BackendResult<Response<AxumBody>>;
}
