use eyre::{Result, WrapErr};
use tracing_subscriber::{EnvFilter, Registry, layer::SubscriberExt, util::SubscriberInitExt};

/// Log output formats understood by [`init_tracing`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// One JSON object per event, for log shippers
    #[default]
    Json,
    /// Human friendly multi-line output for development
    Pretty,
}

fn env_filter(default_level: &str) -> Result<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(default_level)
            .wrap_err_with(|| format!("Invalid log level: {default_level}")),
    }
}

/// Initialize structured logging; `RUST_LOG` overrides `default_level`
pub fn init_tracing(format: LogFormat, default_level: &str) -> Result<()> {
    let filter = env_filter(default_level)?;
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    match format {
        LogFormat::Json => Registry::default()
            .with(filter)
            .with(
                fmt_layer
                    .json()
                    .with_current_span(false)
                    .with_span_list(true),
            )
            .try_init()
            .wrap_err("Failed to install JSON tracing subscriber")?,
        LogFormat::Pretty => Registry::default()
            .with(filter)
            .with(fmt_layer.pretty().with_ansi(true))
            .try_init()
            .wrap_err("Failed to install console tracing subscriber")?,
    }

    tracing::debug!(?format, "Edge logging initialized");
    Ok(())
}

/// Configure tracing for specific service components
pub fn configure_component_tracing(component: &str, port: u16) -> tracing::Span {
    tracing::info_span!("component", name = component, port)
}

/// Create a request-scoped tracing span
pub fn create_request_span(method: &str, path: &str, request_id: &str, port: u16) -> tracing::Span {
    tracing::info_span!(
        "request",
        request.id = request_id,
        http.method = method,
        http.path = path,
        listener.port = port,
        http.status_code = tracing::field::Empty,
        duration_ms = tracing::field::Empty,
    )
}
