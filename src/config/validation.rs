#![allow(clippy::collapsible_if)]

use std::{
    collections::{HashMap, HashSet},
    net::IpAddr,
};

use once_cell::sync::Lazy;
use regex::Regex;

use crate::config::models::{ApplicationConfig, ProxyConfig, TimeoutConfig};

static HOSTNAME_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-zA-Z0-9_]([a-zA-Z0-9_\-]{0,61}[a-zA-Z0-9_])?(\.[a-zA-Z0-9_]([a-zA-Z0-9_\-]{0,61}[a-zA-Z0-9_])?)*$")
        .expect("invalid hostname regex")
});

static CERTIFICATE_NAME_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z0-9_.\-]+$").expect("invalid certificate name regex"));

/// Validation result type alias
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Validation error types
#[derive(Debug, thiserror::Error, Clone)]
pub enum ValidationError {
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid field '{field}': {message}")]
    InvalidField { field: String, message: String },

    #[error("Invalid bind address '{address}': {reason}")]
    InvalidBindAddress { address: String, reason: String },

    #[error("Invalid TLS configuration: {message}")]
    InvalidTls { message: String },

    #[error("Conflict detected: {message}")]
    Conflict { message: String },

    #[error("Validation failed: {message}")]
    ValidationFailed { message: String },
}

/// Proxy configuration validator
pub struct ProxyConfigValidator;

impl ProxyConfigValidator {
    /// Validate the entire proxy configuration, collecting every problem found.
    ///
    /// Application ports that no server binding listens on are not an error: they
    /// are dropped (with a warning) when the virtual-host registry is built.
    pub fn validate(config: &ProxyConfig) -> ValidationResult<()> {
        let mut errors = Vec::new();

        if let Err(e) = Self::validate_bind_address(&config.bind_address) {
            errors.push(e);
        }

        if config.servers.is_empty() {
            errors.push(ValidationError::MissingField {
                field: "servers".to_string(),
            });
        }

        let mut seen_ports = HashSet::new();
        for server in &config.servers {
            if server.port == 0 {
                errors.push(ValidationError::InvalidField {
                    field: "servers.port".to_string(),
                    message: "Server port must be greater than 0".to_string(),
                });
            }
            if !seen_ports.insert(server.port) {
                errors.push(ValidationError::Conflict {
                    message: format!("Port {} is bound more than once", server.port),
                });
            }
        }

        if config.servers.iter().any(|s| s.encrypted) && config.certificates_dir.is_none() {
            errors.push(ValidationError::InvalidTls {
                message: "Encrypted servers require 'certificates_dir' to be set".to_string(),
            });
        }

        if let Err(mut timeout_errors) = Self::validate_timeouts(&config.timeouts) {
            errors.append(&mut timeout_errors);
        }

        let mut seen_names = HashSet::new();
        let mut hostname_owners: HashMap<String, &str> = HashMap::new();
        for application in &config.applications {
            if !seen_names.insert(application.name.as_str()) {
                errors.push(ValidationError::Conflict {
                    message: format!("Application '{}' is defined more than once", application.name),
                });
            }

            if let Err(mut app_errors) = Self::validate_application(application) {
                errors.append(&mut app_errors);
            }

            for binding in &application.hostnames {
                let key = binding.hostname.to_ascii_lowercase();
                if let Some(owner) = hostname_owners.insert(key, &application.name) {
                    errors.push(ValidationError::Conflict {
                        message: format!(
                            "Hostname '{}' is claimed by both '{}' and '{}'",
                            binding.hostname, owner, application.name
                        ),
                    });
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::ValidationFailed {
                message: Self::format_multiple_errors(errors),
            })
        }
    }

    /// Validate bind address format
    fn validate_bind_address(address: &str) -> ValidationResult<()> {
        if address.parse::<IpAddr>().is_err() {
            return Err(ValidationError::InvalidBindAddress {
                address: address.to_string(),
                reason: "Must be an IP address (e.g., '0.0.0.0' or '::')".to_string(),
            });
        }
        Ok(())
    }

    fn validate_timeouts(timeouts: &TimeoutConfig) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();
        let fields = [
            ("timeouts.gateway_timeout_secs", timeouts.gateway_timeout_secs),
            ("timeouts.backend_keep_alive_secs", timeouts.backend_keep_alive_secs),
            ("timeouts.frontend_keep_alive_secs", timeouts.frontend_keep_alive_secs),
            (
                "timeouts.tls_handshake_timeout_secs",
                timeouts.tls_handshake_timeout_secs,
            ),
        ];

        for (field, value) in fields {
            if value == 0 {
                errors.push(ValidationError::InvalidField {
                    field: field.to_string(),
                    message: "Timeout must be greater than 0".to_string(),
                });
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Validate a single application
    fn validate_application(application: &ApplicationConfig) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();
        let name = &application.name;

        if name.trim().is_empty() {
            errors.push(ValidationError::MissingField {
                field: "applications.name".to_string(),
            });
        }

        if application.backend_port == 0 {
            errors.push(ValidationError::InvalidField {
                field: format!("application '{name}' backend_port"),
                message: "Backend port must be greater than 0".to_string(),
            });
        }

        if application.ports.is_empty() {
            errors.push(ValidationError::InvalidField {
                field: format!("application '{name}' ports"),
                message: "Applications must be served on at least one port".to_string(),
            });
        }

        for binding in &application.hostnames {
            if let Err(e) = Self::validate_hostname(&binding.hostname, name) {
                errors.push(e);
            }

            if let Some(certificate) = &binding.certificate {
                if let Err(e) = Self::validate_certificate_name(certificate, name) {
                    errors.push(e);
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Validate hostname format
    fn validate_hostname(hostname: &str, application: &str) -> ValidationResult<()> {
        if hostname.is_empty() {
            return Err(ValidationError::InvalidField {
                field: format!("application '{application}' hostname"),
                message: "Hostname cannot be empty".to_string(),
            });
        }

        if hostname.contains("://") {
            return Err(ValidationError::InvalidField {
                field: format!("application '{application}' hostname"),
                message: "Hostname should not contain protocol (e.g., use 'example.com' not 'http://example.com')".to_string(),
            });
        }

        if !HOSTNAME_REGEX.is_match(hostname) {
            return Err(ValidationError::InvalidField {
                field: format!("application '{application}' hostname"),
                message: format!("Invalid hostname format: '{hostname}'"),
            });
        }

        Ok(())
    }

    /// Certificate names become file names, so they must not escape the certificates directory
    fn validate_certificate_name(certificate: &str, application: &str) -> ValidationResult<()> {
        if !CERTIFICATE_NAME_REGEX.is_match(certificate) || certificate.contains("..") {
            return Err(ValidationError::InvalidTls {
                message: format!(
                    "Application '{application}' references invalid certificate name '{certificate}'"
                ),
            });
        }
        Ok(())
    }

    /// Format multiple validation errors into a single message
    fn format_multiple_errors(errors: Vec<ValidationError>) -> String {
        if errors.is_empty() {
            return "No errors".to_string();
        }

        if errors.len() == 1 {
            return errors[0].to_string();
        }

        let mut message = format!("Found {} validation errors:\n", errors.len());
        for (i, error) in errors.iter().enumerate() {
            message.push_str(&format!("  {}. {}\n", i + 1, error));
        }
        message
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_valid_config() -> ProxyConfig {
        ProxyConfig::builder()
            .certificates_dir("/etc/edge/certs")
            .server(443, true)
            .server(80, false)
            .application(
                ApplicationConfig::new("www", 3000)
                    .port(443)
                    .port(80)
                    .hostname_with_certificate("www.example.com", "example")
                    .hostname("example.com"),
            )
            .build()
            .unwrap()
    }

    #[test]
    fn validate_accepts_minimal_config() {
        assert!(ProxyConfigValidator::validate(&minimal_valid_config()).is_ok());
    }

    #[test]
    fn validate_allows_ports_without_server() {
        let mut config = minimal_valid_config();
        config.applications[0].ports.push(8443);
        assert!(ProxyConfigValidator::validate(&config).is_ok());
    }

    #[test]
    fn validate_rejects_duplicate_ports() {
        let mut config = minimal_valid_config();
        config.servers.push(config.servers[0]);
        assert!(ProxyConfigValidator::validate(&config).is_err());
    }

    #[test]
    fn validate_rejects_encrypted_server_without_certificates_dir() {
        let mut config = minimal_valid_config();
        config.certificates_dir = None;
        let err = ProxyConfigValidator::validate(&config).unwrap_err();
        assert!(err.to_string().contains("certificates_dir"));
    }

    #[test]
    fn validate_rejects_traversing_certificate_name() {
        let mut config = minimal_valid_config();
        config.applications[0].hostnames[0].certificate = Some("../secret".to_string());
        assert!(ProxyConfigValidator::validate(&config).is_err());
    }

    #[test]
    fn validate_rejects_shared_hostname() {
        let mut config = minimal_valid_config();
        config.applications.push(
            ApplicationConfig::new("other", 3001)
                .port(80)
                .hostname("WWW.example.com"),
        );
        let err = ProxyConfigValidator::validate(&config).unwrap_err();
        assert!(err.to_string().contains("claimed by both"));
    }

    #[test]
    fn validate_reports_every_problem() {
        let mut config = minimal_valid_config();
        config.bind_address = "not-an-ip".to_string();
        config.timeouts.gateway_timeout_secs = 0;
        config.applications[0].backend_port = 0;
        config.applications[0].hostnames[1].hostname = "bad host".to_string();

        let err = ProxyConfigValidator::validate(&config).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("Found 4 validation errors"));
    }
}
