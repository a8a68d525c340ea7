//! Per-port certificate cache used for SNI selection.
//!
//! Certificate and key files are read once at startup. The rustls signing key is
//! built lazily on the first handshake that needs it and memoized per certificate
//! name, so the lookup tables never change after [`CertificateStore::load`].
use std::{
    collections::HashMap,
    fmt,
    path::{Path, PathBuf},
    sync::{Arc, OnceLock},
};

use rustls::{
    crypto::aws_lc_rs::sign::any_supported_type,
    pki_types::{CertificateDer, PrivateKeyDer},
    sign::CertifiedKey,
};
use tracing::{debug, info};

use crate::core::{error::ProxyError, vhost::VirtualHostRegistry};

pub const CERTIFICATE_EXTENSION: &str = "cert";
pub const KEY_EXTENSION: &str = "key";

/// Raw PEM bytes of one certificate chain and its private key.
pub struct CertificateRecord {
    pub certificate_name: String,
    pub certificate_bytes: Vec<u8>,
    pub key_bytes: Vec<u8>,
    context: OnceLock<Arc<CertifiedKey>>,
}

impl CertificateRecord {
    pub fn new(certificate_name: String, certificate_bytes: Vec<u8>, key_bytes: Vec<u8>) -> Self {
        Self {
            certificate_name,
            certificate_bytes,
            key_bytes,
            context: OnceLock::new(),
        }
    }

    fn secure_context(&self, server_name: &str) -> Result<Arc<CertifiedKey>, ProxyError> {
        if let Some(context) = self.context.get() {
            return Ok(context.clone());
        }

        let context = Arc::new(self.build_context(server_name)?);
        // A concurrent handshake may have won the race; either value is equivalent
        let _ = self.context.set(context.clone());
        Ok(self.context.get().cloned().unwrap_or(context))
    }

    fn build_context(&self, server_name: &str) -> Result<CertifiedKey, ProxyError> {
        let tls_error = |reason: String| ProxyError::TlsContext {
            server_name: Some(server_name.to_string()),
            reason,
        };

        let chain: Vec<CertificateDer<'static>> =
            rustls_pemfile::certs(&mut self.certificate_bytes.as_slice())
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| {
                    tls_error(format!(
                        "failed to parse certificate '{}': {e}",
                        self.certificate_name
                    ))
                })?;
        if chain.is_empty() {
            return Err(tls_error(format!(
                "certificate '{}' contains no PEM certificates",
                self.certificate_name
            )));
        }

        let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut self.key_bytes.as_slice())
            .map_err(|e| {
                tls_error(format!(
                    "failed to parse key '{}': {e}",
                    self.certificate_name
                ))
            })?
            .ok_or_else(|| {
                tls_error(format!(
                    "key file for '{}' contains no private key",
                    self.certificate_name
                ))
            })?;

        let signing_key = any_supported_type(&key).map_err(|e| {
            tls_error(format!(
                "unsupported key for '{}': {e}",
                self.certificate_name
            ))
        })?;

        Ok(CertifiedKey::new(chain, signing_key))
    }
}

impl fmt::Debug for CertificateRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateRecord")
            .field("certificate_name", &self.certificate_name)
            .field("certificate_bytes", &self.certificate_bytes.len())
            .field("key_bytes", &"<redacted>")
            .field("context_built", &self.context.get().is_some())
            .finish()
    }
}

/// Certificates needed by the applications served on one port.
#[derive(Debug, Default)]
pub struct CertificateStore {
    port: u16,
    records: HashMap<String, CertificateRecord>,
    /// Lowercased hostname -> certificate name
    hostnames: HashMap<String, String>,
}

impl CertificateStore {
    /// Read every certificate referenced by an application on `port`.
    ///
    /// A missing or unreadable file aborts with [`ProxyError::FatalCertLoad`].
    pub async fn load(
        registry: &VirtualHostRegistry,
        port: u16,
        certificates_dir: impl AsRef<Path>,
    ) -> Result<Self, ProxyError> {
        let dir = certificates_dir.as_ref();
        let mut store = Self {
            port,
            ..Self::default()
        };

        for app in registry.applications_on_port(port) {
            for binding in &app.hostnames {
                let Some(name) = &binding.certificate_name else {
                    continue;
                };

                if !store.records.contains_key(name) {
                    let certificate_bytes =
                        read_pem(name, certificate_path(dir, name)).await?;
                    let key_bytes = read_pem(name, key_path(dir, name)).await?;
                    debug!(port, certificate = %name, "Loaded certificate");
                    store.records.insert(
                        name.clone(),
                        CertificateRecord::new(name.clone(), certificate_bytes, key_bytes),
                    );
                }

                store
                    .hostnames
                    .entry(binding.hostname.to_ascii_lowercase())
                    .or_insert_with(|| name.clone());
            }
        }

        info!(
            port,
            certificates = store.records.len(),
            hostnames = store.hostnames.len(),
            "Certificate store ready"
        );
        Ok(store)
    }

    /// Build (or reuse) the TLS context for an SNI server name.
    pub fn select_secure_context(
        &self,
        server_name: Option<&str>,
    ) -> Result<Arc<CertifiedKey>, ProxyError> {
        let Some(server_name) = server_name else {
            return Err(ProxyError::TlsContext {
                server_name: None,
                reason: "client did not send SNI".to_string(),
            });
        };

        let record = self
            .hostnames
            .get(&server_name.to_ascii_lowercase())
            .and_then(|name| self.records.get(name))
            .ok_or_else(|| ProxyError::TlsContext {
                server_name: Some(server_name.to_string()),
                reason: format!("no certificate mapped on port {}", self.port),
            })?;

        record.secure_context(server_name)
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn certificate_count(&self) -> usize {
        self.records.len()
    }

    pub fn certificate_for(&self, hostname: &str) -> Option<&str> {
        self.hostnames
            .get(&hostname.to_ascii_lowercase())
            .map(String::as_str)
    }
}

pub fn certificate_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{name}.{CERTIFICATE_EXTENSION}"))
}

pub fn key_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{name}.{KEY_EXTENSION}"))
}

async fn read_pem(name: &str, path: PathBuf) -> Result<Vec<u8>, ProxyError> {
    tokio::fs::read(&path)
        .await
        .map_err(|source| ProxyError::FatalCertLoad {
            certificate: name.to_string(),
            path,
            source,
        })
}
