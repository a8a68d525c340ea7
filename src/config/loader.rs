use std::path::Path;

use config::{Config, File, FileFormat};
use eyre::{Context, Result};

use crate::config::models::ProxyConfig;

/// Load configuration from a file using the config crate
/// Supports multiple formats: TOML, YAML, JSON, etc.
pub async fn load_config(config_path: &str) -> Result<ProxyConfig> {
    load_config_sync(config_path)
}

/// Load configuration synchronously
pub fn load_config_sync(config_path: &str) -> Result<ProxyConfig> {
    let config_path = Path::new(config_path);

    // Determine file format based on extension
    let format = match config_path.extension().and_then(|ext| ext.to_str()) {
        Some("yaml") | Some("yml") => FileFormat::Yaml,
        Some("json") => FileFormat::Json,
        Some("ini") => FileFormat::Ini,
        _ => FileFormat::Toml,
    };

    let settings = Config::builder()
        .add_source(File::new(
            config_path
                .to_str()
                .ok_or_else(|| eyre::eyre!("Invalid UTF-8 path: {}", config_path.display()))?,
            format,
        ))
        .build()
        .with_context(|| format!("Failed to build config from {}", config_path.display()))?;

    let proxy_config: ProxyConfig = settings.try_deserialize().with_context(|| {
        format!(
            "Failed to deserialize config from {}",
            config_path.display()
        )
    })?;

    Ok(proxy_config)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::*;

    #[tokio::test]
    async fn test_load_toml_config() {
        let toml_content = r#"
certificates_dir = "/etc/edge/certs"

[timeouts]
gateway_timeout_secs = 5

[[servers]]
port = 443
encrypted = true

[[servers]]
port = 80

[[applications]]
name = "www"
backend_port = 3000
ports = [443, 80]
hostnames = [
  { hostname = "www.example.com", certificate = "example" },
  { hostname = "example.com", certificate = "example" },
]
"#;

        let mut temp_file = NamedTempFile::with_suffix(".toml").unwrap();
        write!(temp_file, "{}", toml_content).unwrap();

        let config = load_config(temp_file.path().to_str().unwrap())
            .await
            .unwrap();
        assert_eq!(config.servers.len(), 2);
        assert!(config.servers[0].encrypted);
        assert!(!config.servers[1].encrypted);
        assert_eq!(config.applications[0].ports, vec![443, 80]);
        assert_eq!(config.applications[0].hostnames[0].hostname, "www.example.com");
        assert!(config.applications[0].prefer_encrypted);
        assert_eq!(config.timeouts.gateway_timeout_secs, 5);
        assert_eq!(config.timeouts.backend_keep_alive_secs, 300);
        assert_eq!(config.bind_address, "0.0.0.0");
        assert_eq!(config.public_dir, "public");
    }

    #[tokio::test]
    async fn test_load_json_config() {
        let json_content = r#"
{
  "bind_address": "127.0.0.1",
  "servers": [{ "port": 8080 }],
  "applications": [
    {
      "name": "api",
      "backend_port": 4000,
      "prefer_encrypted": false,
      "ports": [8080],
      "hostnames": [{ "hostname": "api.example.com" }]
    }
  ]
}
"#;

        let mut temp_file = NamedTempFile::with_suffix(".json").unwrap();
        write!(temp_file, "{}", json_content).unwrap();

        let config = load_config(temp_file.path().to_str().unwrap())
            .await
            .unwrap();
        assert_eq!(config.bind_address, "127.0.0.1");
        assert_eq!(config.applications.len(), 1);
        assert!(!config.applications[0].prefer_encrypted);
        assert!(config.applications[0].hostnames[0].certificate.is_none());
    }

    #[tokio::test]
    async fn test_missing_servers_is_an_error() {
        let mut temp_file = NamedTempFile::with_suffix(".toml").unwrap();
        write!(temp_file, "public_dir = \"www\"\n").unwrap();

        assert!(
            load_config(temp_file.path().to_str().unwrap())
                .await
                .is_err()
        );
    }
}
