//! Virtual-host registry.
//!
//! Built once from [`ProxyConfig`] at startup and shared read-only afterwards.
//! Resolution maps a `(hostname, port)` pair onto the [`ApplicationBinding`]
//! that owns it.
use std::collections::HashMap;

use tracing::warn;

use crate::config::ProxyConfig;

/// One listening socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerBinding {
    pub port: u16,
    pub encrypted: bool,
}

/// A hostname belonging to an application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostnameBinding {
    pub hostname: String,
    pub certificate_name: Option<String>,
    /// Only true when the application prefers TLS and a certificate is mapped.
    pub prefer_encrypted: bool,
}

/// A backend application together with the edge ports and hostnames serving it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplicationBinding {
    pub name: String,
    pub backend_port: u16,
    /// Edge ports, first one preferred. Only ports with a server binding survive.
    pub ports: Vec<u16>,
    /// Hostnames, first one preferred.
    pub hostnames: Vec<HostnameBinding>,
    /// True iff at least one of `ports` is an encrypted server port.
    pub prefer_encrypted: bool,
}

impl ApplicationBinding {
    pub fn serves_port(&self, port: u16) -> bool {
        self.ports.contains(&port)
    }
}

#[derive(Debug, Clone, Default)]
pub struct VirtualHostRegistry {
    servers: Vec<ServerBinding>,
    applications: Vec<ApplicationBinding>,
    /// Lowercased hostname -> index into `applications`
    hostname_index: HashMap<String, usize>,
}

impl VirtualHostRegistry {
    pub fn from_config(config: &ProxyConfig) -> Self {
        let servers: Vec<ServerBinding> = config
            .servers
            .iter()
            .map(|s| ServerBinding {
                port: s.port,
                encrypted: s.encrypted,
            })
            .collect();

        let mut applications = Vec::with_capacity(config.applications.len());
        let mut hostname_index = HashMap::new();

        for app in &config.applications {
            let mut ports = Vec::with_capacity(app.ports.len());
            for &port in &app.ports {
                if servers.iter().any(|s| s.port == port) {
                    ports.push(port);
                } else {
                    warn!(
                        application = %app.name,
                        port,
                        "Application port has no server binding; excluding it"
                    );
                }
            }

            let prefer_encrypted = ports
                .iter()
                .any(|p| servers.iter().any(|s| s.port == *p && s.encrypted));

            let hostnames: Vec<HostnameBinding> = app
                .hostnames
                .iter()
                .map(|h| HostnameBinding {
                    hostname: h.hostname.clone(),
                    certificate_name: h.certificate.clone(),
                    prefer_encrypted: app.prefer_encrypted && h.certificate.is_some(),
                })
                .collect();

            let index = applications.len();
            for h in &hostnames {
                // First application to claim a hostname keeps it
                hostname_index
                    .entry(h.hostname.to_ascii_lowercase())
                    .or_insert(index);
            }

            applications.push(ApplicationBinding {
                name: app.name.clone(),
                backend_port: app.backend_port,
                ports,
                hostnames,
                prefer_encrypted,
            });
        }

        Self {
            servers,
            applications,
            hostname_index,
        }
    }

    /// Resolve the application a request for `hostname` on `port` belongs to.
    ///
    /// A registry holding a single application returns it for every request.
    /// Otherwise an exact hostname match wins regardless of port, falling back to
    /// the first application in configuration order that serves `port`.
    pub fn resolve(&self, hostname: &str, port: u16) -> Option<&ApplicationBinding> {
        if self.applications.len() == 1 {
            return self.applications.first();
        }

        if let Some(&index) = self.hostname_index.get(&hostname.to_ascii_lowercase()) {
            return self.applications.get(index);
        }

        self.applications.iter().find(|app| app.serves_port(port))
    }

    pub fn preferred_host<'a>(&self, binding: &'a ApplicationBinding) -> Option<&'a HostnameBinding> {
        binding.hostnames.first()
    }

    pub fn preferred_port(&self, binding: &ApplicationBinding) -> Option<u16> {
        binding.ports.first().copied()
    }

    pub fn server_bindings(&self) -> &[ServerBinding] {
        &self.servers
    }

    pub fn applications(&self) -> &[ApplicationBinding] {
        &self.applications
    }

    pub fn applications_on_port(&self, port: u16) -> impl Iterator<Item = &ApplicationBinding> {
        self.applications
            .iter()
            .filter(move |app| app.serves_port(port))
    }

    pub fn is_encrypted_port(&self, port: u16) -> bool {
        self.servers.iter().any(|s| s.port == port && s.encrypted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ApplicationConfig;

    fn registry() -> VirtualHostRegistry {
        let config = ProxyConfig::builder()
            .server(443, true)
            .server(80, false)
            .server(8080, false)
            .application(
                ApplicationConfig::new("www", 3000)
                    .port(443)
                    .port(80)
                    .hostname_with_certificate("www.example.com", "example")
                    .hostname("example.com"),
            )
            .application(
                ApplicationConfig::new("admin", 3001)
                    .port(8080)
                    .port(9999)
                    .hostname("admin.example.com"),
            )
            .build()
            .unwrap();
        VirtualHostRegistry::from_config(&config)
    }

    #[test]
    fn test_exact_hostname_wins_regardless_of_port() {
        let registry = registry();
        let app = registry.resolve("admin.example.com", 443).unwrap();
        assert_eq!(app.name, "admin");
    }

    #[test]
    fn test_hostname_match_is_case_insensitive() {
        let registry = registry();
        assert_eq!(registry.resolve("WWW.Example.COM", 8080).unwrap().name, "www");
    }

    #[test]
    fn test_falls_back_to_first_application_on_port() {
        let registry = registry();
        assert_eq!(registry.resolve("unknown.test", 80).unwrap().name, "www");
        assert_eq!(registry.resolve("unknown.test", 8080).unwrap().name, "admin");
        assert!(registry.resolve("unknown.test", 9999).is_none());
    }

    #[test]
    fn test_single_application_always_resolves() {
        let config = ProxyConfig::builder()
            .server(80, false)
            .application(ApplicationConfig::new("only", 3000).port(80).hostname("a.test"))
            .build()
            .unwrap();
        let registry = VirtualHostRegistry::from_config(&config);
        assert_eq!(registry.resolve("other.test", 1234).unwrap().name, "only");
    }

    #[test]
    fn test_unbound_ports_are_excluded() {
        let registry = registry();
        let admin = registry.resolve("admin.example.com", 8080).unwrap();
        assert_eq!(admin.ports, vec![8080]);
        assert!(!admin.prefer_encrypted);
    }

    #[test]
    fn test_derived_encryption_preferences() {
        let registry = registry();
        let www = registry.resolve("www.example.com", 443).unwrap();
        assert!(www.prefer_encrypted);
        assert!(www.hostnames[0].prefer_encrypted);
        assert!(!www.hostnames[1].prefer_encrypted);

        assert_eq!(registry.preferred_host(www).unwrap().hostname, "www.example.com");
        assert_eq!(registry.preferred_port(www), Some(443));
        assert!(registry.is_encrypted_port(443));
        assert!(!registry.is_encrypted_port(80));
        assert_eq!(registry.applications_on_port(80).count(), 1);
    }

    #[test]
    fn test_hostname_requires_backend_preference() {
        let config = ProxyConfig::builder()
            .server(443, true)
            .application(
                ApplicationConfig::new("plain", 3000)
                    .prefer_encrypted(false)
                    .port(443)
                    .hostname_with_certificate("plain.test", "plain"),
            )
            .build()
            .unwrap();
        let registry = VirtualHostRegistry::from_config(&config);
        let app = &registry.applications()[0];
        assert!(!app.hostnames[0].prefer_encrypted);
        assert!(app.prefer_encrypted);
    }
}
