//! Configuration data structures for the edge proxy.
//!
//! These types map directly to TOML (also JSON / YAML) configuration files. They are
//! serde‑friendly and include defaults so that minimal configs remain concise.
//! Configuration is read once at startup; there is no hot reload.
use std::time::Duration;

use serde::{Deserialize, Serialize};

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_public_dir() -> String {
    "public".to_string()
}

fn default_backend_host() -> String {
    "localhost".to_string()
}

fn default_true() -> bool {
    true
}

/// Top-level proxy configuration.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ProxyConfig {
    /// Address every listener binds to
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Directory holding `<name>.cert` / `<name>.key` PEM pairs
    #[serde(default)]
    pub certificates_dir: Option<String>,
    /// Directory serving `/.well-known/acme-challenge/*`
    #[serde(default = "default_public_dir")]
    pub public_dir: String,
    /// Host the backend pool connects to (the forwarded `Host` is always `localhost:<port>`)
    #[serde(default = "default_backend_host")]
    pub backend_host: String,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub backend_pool: BackendPoolConfig,
    /// Listening sockets, in start order
    pub servers: Vec<ServerBindingConfig>,
    /// Virtual hosts, in match order
    #[serde(default)]
    pub applications: Vec<ApplicationConfig>,
}

impl ProxyConfig {
    /// Create a new proxy configuration builder
    pub fn builder() -> ProxyConfigBuilder {
        ProxyConfigBuilder::default()
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            certificates_dir: None,
            public_dir: default_public_dir(),
            backend_host: default_backend_host(),
            timeouts: TimeoutConfig::default(),
            backend_pool: BackendPoolConfig::default(),
            servers: Vec::new(),
            applications: Vec::new(),
        }
    }
}

/// One listening socket.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct ServerBindingConfig {
    pub port: u16,
    #[serde(default)]
    pub encrypted: bool,
}

/// A hostname an application answers to, with the certificate that covers it.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct HostnameConfig {
    pub hostname: String,
    #[serde(default)]
    pub certificate: Option<String>,
}

/// A backend application reachable through the edge.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ApplicationConfig {
    pub name: String,
    /// Local port of the backend process
    pub backend_port: u16,
    /// Whether the backend prefers to be reached over TLS
    #[serde(default = "default_true")]
    pub prefer_encrypted: bool,
    /// Edge ports serving this application; the first one is preferred
    pub ports: Vec<u16>,
    /// Hostnames of this application; the first one is preferred
    #[serde(default)]
    pub hostnames: Vec<HostnameConfig>,
}

impl ApplicationConfig {
    pub fn new(name: impl Into<String>, backend_port: u16) -> Self {
        Self {
            name: name.into(),
            backend_port,
            prefer_encrypted: true,
            ports: Vec::new(),
            hostnames: Vec::new(),
        }
    }

    pub fn port(mut self, port: u16) -> Self {
        self.ports.push(port);
        self
    }

    pub fn hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostnames.push(HostnameConfig {
            hostname: hostname.into(),
            certificate: None,
        });
        self
    }

    pub fn hostname_with_certificate(
        mut self,
        hostname: impl Into<String>,
        certificate: impl Into<String>,
    ) -> Self {
        self.hostnames.push(HostnameConfig {
            hostname: hostname.into(),
            certificate: Some(certificate.into()),
        });
        self
    }

    pub fn prefer_encrypted(mut self, prefer: bool) -> Self {
        self.prefer_encrypted = prefer;
        self
    }
}

/// Timeouts applied by the edge, all in seconds.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Deadline for backend response headers once the client request has ended
    pub gateway_timeout_secs: u64,
    /// Idle lifetime of pooled backend connections, advertised in `keep-alive`
    pub backend_keep_alive_secs: u64,
    /// Idle lifetime of client connections, advertised in `keep-alive`
    pub frontend_keep_alive_secs: u64,
    /// Deadline for completing a client TLS handshake
    pub tls_handshake_timeout_secs: u64,
}

impl TimeoutConfig {
    pub fn gateway_timeout(&self) -> Duration {
        Duration::from_secs(self.gateway_timeout_secs)
    }

    pub fn backend_keep_alive(&self) -> Duration {
        Duration::from_secs(self.backend_keep_alive_secs)
    }

    pub fn frontend_keep_alive(&self) -> Duration {
        Duration::from_secs(self.frontend_keep_alive_secs)
    }

    pub fn tls_handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.tls_handshake_timeout_secs)
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            gateway_timeout_secs: 20,
            backend_keep_alive_secs: 300,
            frontend_keep_alive_secs: 20,
            tls_handshake_timeout_secs: 10,
        }
    }
}

/// Backend keep-alive pool sizing.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct BackendPoolConfig {
    /// Idle connections kept per backend; unbounded when absent
    pub max_idle_per_backend: Option<usize>,
}

/// Builder for ProxyConfig to allow for cleaner configuration creation
#[derive(Default)]
pub struct ProxyConfigBuilder {
    config: ProxyConfig,
}

impl ProxyConfigBuilder {
    /// Set the address listeners bind to
    pub fn bind_address(mut self, addr: impl Into<String>) -> Self {
        self.config.bind_address = addr.into();
        self
    }

    /// Set the certificates directory
    pub fn certificates_dir(mut self, dir: impl Into<String>) -> Self {
        self.config.certificates_dir = Some(dir.into());
        self
    }

    /// Set the ACME public directory
    pub fn public_dir(mut self, dir: impl Into<String>) -> Self {
        self.config.public_dir = dir.into();
        self
    }

    /// Set the host the backend pool connects to
    pub fn backend_host(mut self, host: impl Into<String>) -> Self {
        self.config.backend_host = host.into();
        self
    }

    /// Add a listening socket
    pub fn server(mut self, port: u16, encrypted: bool) -> Self {
        self.config
            .servers
            .push(ServerBindingConfig { port, encrypted });
        self
    }

    /// Add an application
    pub fn application(mut self, application: ApplicationConfig) -> Self {
        self.config.applications.push(application);
        self
    }

    /// Set timeout configuration
    pub fn timeouts(mut self, timeouts: TimeoutConfig) -> Self {
        self.config.timeouts = timeouts;
        self
    }

    /// Set the gateway timeout in seconds
    pub fn gateway_timeout_secs(mut self, secs: u64) -> Self {
        self.config.timeouts.gateway_timeout_secs = secs;
        self
    }

    /// Build the final ProxyConfig
    pub fn build(self) -> Result<ProxyConfig, String> {
        if self.config.servers.is_empty() {
            return Err("At least one server binding must be configured".to_string());
        }
        Ok(self.config)
    }
}
