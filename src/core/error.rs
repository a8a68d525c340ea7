//! Tagged error kinds for the edge proxy.
//!
//! Per-request kinds (`BadRequest`, `NotFound`, `BadGateway`, `GatewayTimeout`)
//! never leave the request that produced them: the handler converts them into
//! an edge response. `TlsContext` is an operational error reported by a TLS
//! listener for a single handshake. Only `FatalCertLoad` and `FatalListener`
//! are allowed to stop the process-wide proxy.
use std::{io, path::PathBuf, time::Duration};

use http::StatusCode;
use thiserror::Error;

/// Why a request was rejected before reaching virtual-host resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// Host header missing, not visible ASCII, or containing disallowed characters.
    InvalidHost,
    /// Request target with disallowed characters or undecodable escapes.
    InvalidUrl,
    /// ACME challenge path with traversal sequences or disallowed segment characters.
    InvalidChallengePath,
    /// Client request body failed while it was being forwarded.
    ClientAborted,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectReason::InvalidHost => write!(f, "invalid host"),
            RejectReason::InvalidUrl => write!(f, "invalid url"),
            RejectReason::InvalidChallengePath => write!(f, "invalid challenge path"),
            RejectReason::ClientAborted => write!(f, "client aborted request"),
        }
    }
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ProxyError {
    #[error("bad request: {reason}")]
    BadRequest { reason: RejectReason },

    #[error("no application for host '{hostname}' on port {port}")]
    NotFound { hostname: String, port: u16 },

    #[error("backend on port {backend_port} unavailable: {reason}")]
    BadGateway { backend_port: u16, reason: String },

    #[error("backend on port {backend_port} sent no response within {timeout:?}")]
    GatewayTimeout { backend_port: u16, timeout: Duration },

    #[error("failed to load certificate '{certificate}' from {}: {source}", path.display())]
    FatalCertLoad {
        certificate: String,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("listener on port {port} failed: {source}")]
    FatalListener {
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error("no TLS context for server name {server_name:?}: {reason}")]
    TlsContext {
        server_name: Option<String>,
        reason: String,
    },
}

impl ProxyError {
    /// Fatal errors abort startup or trigger a coordinated shutdown of every listener.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ProxyError::FatalCertLoad { .. } | ProxyError::FatalListener { .. }
        )
    }

    /// Status code of the edge response for per-request kinds.
    pub fn status_code(&self) -> Option<StatusCode> {
        match self {
            ProxyError::BadRequest { .. } => Some(StatusCode::BAD_REQUEST),
            ProxyError::NotFound { .. } => Some(StatusCode::NOT_FOUND),
            ProxyError::BadGateway { .. } => Some(StatusCode::BAD_GATEWAY),
            ProxyError::GatewayTimeout { .. } => Some(StatusCode::GATEWAY_TIMEOUT),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_kinds() {
        let cert = ProxyError::FatalCertLoad {
            certificate: "example".to_string(),
            path: PathBuf::from("/etc/certs/example.cert"),
            source: io::Error::new(io::ErrorKind::NotFound, "missing"),
        };
        assert!(cert.is_fatal());
        assert!(cert.status_code().is_none());
        assert!(cert.to_string().contains("/etc/certs/example.cert"));

        let listener = ProxyError::FatalListener {
            port: 443,
            source: io::Error::new(io::ErrorKind::AddrInUse, "in use"),
        };
        assert!(listener.is_fatal());

        let tls = ProxyError::TlsContext {
            server_name: Some("unknown.test".to_string()),
            reason: "no certificate mapped".to_string(),
        };
        assert!(!tls.is_fatal());
    }

    #[test]
    fn test_per_request_status_codes() {
        let cases = [
            (
                ProxyError::BadRequest {
                    reason: RejectReason::InvalidHost,
                },
                StatusCode::BAD_REQUEST,
            ),
            (
                ProxyError::NotFound {
                    hostname: "a.test".to_string(),
                    port: 80,
                },
                StatusCode::NOT_FOUND,
            ),
            (
                ProxyError::BadGateway {
                    backend_port: 3000,
                    reason: "refused".to_string(),
                },
                StatusCode::BAD_GATEWAY,
            ),
            (
                ProxyError::GatewayTimeout {
                    backend_port: 3000,
                    timeout: Duration::from_secs(20),
                },
                StatusCode::GATEWAY_TIMEOUT,
            ),
        ];

        for (error, expected) in cases {
            assert!(!error.is_fatal());
            assert_eq!(error.status_code(), Some(expected));
        }
    }
}
