use std::sync::Arc;

use rustls::{
    ServerConfig,
    server::{ClientHello, ResolvesServerCert},
    sign::CertifiedKey,
};
use tracing::debug;

use crate::core::{certificates::CertificateStore, error::ProxyError};

/// SNI callback backed by the certificate store of one port
#[derive(Debug)]
pub struct SniCertResolver {
    store: Arc<CertificateStore>,
}

impl SniCertResolver {
    pub fn new(store: Arc<CertificateStore>) -> Self {
        Self { store }
    }
}

impl ResolvesServerCert for SniCertResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        match self.store.select_secure_context(client_hello.server_name()) {
            Ok(key) => Some(key),
            Err(e) => {
                // The failed handshake is reported by the listener
                debug!(port = self.store.port(), error = %e, "No TLS context for client hello");
                None
            }
        }
    }
}

/// rustls server configuration selecting certificates per SNI name.
///
/// Uses the aws-lc-rs provider explicitly so no process-wide default provider
/// has to be installed.
pub fn server_config(store: Arc<CertificateStore>) -> Result<Arc<ServerConfig>, ProxyError> {
    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
    let mut config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| ProxyError::TlsContext {
            server_name: None,
            reason: format!("unsupported protocol versions: {e}"),
        })?
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(SniCertResolver::new(store)));
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}
