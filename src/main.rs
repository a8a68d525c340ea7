use std::{path::Path, sync::Arc};

use clap::{Parser, ValueEnum};
use color_eyre::{
    Result,
    eyre::{WrapErr, eyre},
};
use vhost_edge::{
    EdgeServer, GracefulShutdown, ShutdownReason,
    config::{ProxyConfig, ProxyConfigValidator, load_config},
    tracing_setup::{self, LogFormat},
};

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    #[clap(subcommand)]
    command: Option<Commands>,

    #[clap(short, long, default_value = "edge.toml")]
    config: String,

    /// Log output format
    #[clap(long, value_enum, default_value_t = LogFormatArg::Json, global = true)]
    log_format: LogFormatArg,

    /// Default log level when RUST_LOG is not set
    #[clap(long, default_value = "info", global = true)]
    log_level: String,
}

#[derive(Parser, Debug)]
enum Commands {
    /// Validate configuration file
    Validate {
        /// Configuration file to validate
        #[clap(short, long, default_value = "edge.toml")]
        config: String,
    },
    /// Initialize a new configuration file
    Init {
        /// Output path for the new config file
        #[clap(short, long, default_value = "edge.toml")]
        config: String,
    },
    /// Start the edge proxy (default)
    Serve {
        /// Configuration file to use
        #[clap(short, long, default_value = "edge.toml")]
        config: String,
    },
}

#[derive(ValueEnum, Debug, Clone, Copy)]
enum LogFormatArg {
    Json,
    Pretty,
}

impl From<LogFormatArg> for LogFormat {
    fn from(arg: LogFormatArg) -> Self {
        match arg {
            LogFormatArg::Json => LogFormat::Json,
            LogFormatArg::Pretty => LogFormat::Pretty,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let Args {
        command,
        config,
        log_format,
        log_level,
    } = Args::parse();

    match command {
        Some(Commands::Validate { config }) => validate_config_command(&config).await,
        Some(Commands::Init { config }) => init_config_command(&config).await,
        Some(Commands::Serve { config }) => serve(&config, log_format.into(), &log_level).await,
        None => serve(&config, log_format.into(), &log_level).await,
    }
}

async fn serve(config_path: &str, log_format: LogFormat, log_level: &str) -> Result<()> {
    tracing_setup::init_tracing(log_format, log_level).wrap_err("Failed to initialize tracing")?;

    tracing::info!("Loading configuration from {config_path}");
    let config = load_config(config_path)
        .await
        .wrap_err_with(|| format!("Failed to load configuration from {config_path}"))?;
    ProxyConfigValidator::validate(&config).wrap_err("Invalid configuration")?;

    tracing::info!(
        servers = config.servers.len(),
        applications = config.applications.len(),
        "Configuration loaded"
    );

    let graceful_shutdown = Arc::new(GracefulShutdown::new());
    let running = EdgeServer::new(config)
        .start(graceful_shutdown.clone())
        .await
        .wrap_err("Failed to start edge server")?;

    let signal_shutdown = graceful_shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = signal_shutdown.run_signal_handler().await {
            tracing::error!("Signal handler error: {e}");
        }
    });

    match running.run().await {
        ShutdownReason::Fatal { port, message } => {
            Err(eyre!("Listener on port {port} failed: {message}"))
        }
        ShutdownReason::Force => {
            tracing::warn!("Shutdown forced before connections drained");
            Ok(())
        }
        ShutdownReason::Graceful => {
            tracing::info!("Graceful shutdown completed");
            Ok(())
        }
    }
}

/// Validate configuration file and exit
async fn validate_config_command(config_path: &str) -> Result<()> {
    println!("🔍 Validating configuration file: {config_path}");

    if !Path::new(config_path).exists() {
        eprintln!("❌ Error: Configuration file '{config_path}' not found");
        std::process::exit(1);
    }

    let config = match load_config(config_path).await {
        Ok(config) => {
            println!("✅ Configuration parsing: OK");
            config
        }
        Err(e) => {
            eprintln!("❌ Configuration parsing failed:");
            eprintln!("   {e:#}");
            std::process::exit(1);
        }
    };

    match ProxyConfigValidator::validate(&config) {
        Ok(()) => {
            println!("✅ Configuration validation: OK");
            println!();
            print_summary(&config);
            println!();
            println!("🎉 Configuration is valid and ready to use!");
            Ok(())
        }
        Err(e) => {
            eprintln!("❌ Configuration validation failed:");
            eprintln!("{e}");
            println!();
            println!("💡 Common fixes:");
            println!("   • Give every encrypted server a certificates_dir");
            println!("   • Claim each hostname from a single application");
            println!("   • Use plain certificate names without path separators");
            std::process::exit(1);
        }
    }
}

fn print_summary(config: &ProxyConfig) {
    println!("📋 Configuration Summary:");
    println!("   • Bind Address: {}", config.bind_address);
    for server in &config.servers {
        let scheme = if server.encrypted { "https" } else { "http" };
        println!("   • Server: {} ({scheme})", server.port);
    }
    for app in &config.applications {
        let hostnames: Vec<&str> = app.hostnames.iter().map(|h| h.hostname.as_str()).collect();
        println!(
            "   • Application '{}': backend {} ports {:?} hostnames [{}]",
            app.name,
            app.backend_port,
            app.ports,
            hostnames.join(", ")
        );
    }
}

/// Initialize a new configuration file
async fn init_config_command(config_path: &str) -> Result<()> {
    let path = Path::new(config_path);
    if path.exists() {
        eprintln!("❌ Error: Configuration file '{config_path}' already exists");
        std::process::exit(1);
    }

    let default_config = r#"# Edge proxy configuration

bind_address = "0.0.0.0"
certificates_dir = "certs"
public_dir = "public"
backend_host = "localhost"

[timeouts]
gateway_timeout_secs = 20
backend_keep_alive_secs = 300
frontend_keep_alive_secs = 20
tls_handshake_timeout_secs = 10

[[servers]]
port = 443
encrypted = true

[[servers]]
port = 80
encrypted = false

# Requests for example.com or port 80 are redirected to https://www.example.com
[[applications]]
name = "www"
backend_port = 3000
prefer_encrypted = true
ports = [443, 80]
hostnames = [
    { hostname = "www.example.com", certificate = "example" },
    { hostname = "example.com", certificate = "example" },
]
"#;

    tokio::fs::write(path, default_config)
        .await
        .wrap_err("Failed to write config file")?;
    println!("✅ Created default configuration at: {config_path}");
    println!("   Run 'vhost-edge serve --config {config_path}' to start the proxy");
    Ok(())
}
