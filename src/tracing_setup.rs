use eyre::{Result, WrapErr};
use tracing_subscriber::{EnvFilter, Registry, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize structured logging with JSON output
pub fn init_tracing() -> Result<()> {
    Registry::default()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(true)
                .with_span_list(false)
                .with_target(true)
                .with_thread_ids(true),
        )
        .try_init()
        .wrap_err("Failed to install tracing subscriber")?;

    tracing::info!("Tollgate structured logging initialized");
    Ok(())
}

/// Initialize console-friendly logging for development
pub fn init_console_tracing() -> Result<()> {
    Registry::default()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .pretty()
                .with_target(true)
                .with_file(true)
                .with_line_number(true),
        )
        .try_init()
        .wrap_err("Failed to install tracing subscriber")?;

    tracing::info!("Tollgate console logging initialized");
    Ok(())
}

/// Initialize tracing from an explicit filter directive
pub fn init_tracing_with_config(level: &str, json_format: bool) -> Result<()> {
    let env_filter =
        EnvFilter::try_new(level).wrap_err_with(|| format!("Invalid log level: {level}"))?;

    let fmt_layer = tracing_subscriber::fmt::layer().with_target(true).with_thread_ids(true);

    let installed = if json_format {
        Registry::default()
            .with(env_filter)
            .with(fmt_layer.json().with_current_span(true).with_span_list(false))
            .try_init()
    } else {
        Registry::default()
            .with(env_filter)
            .with(fmt_layer.pretty().with_ansi(true))
            .try_init()
    };
    installed.wrap_err("Failed to install tracing subscriber")?;

    tracing::info!(level, json = json_format, "Tollgate logging initialized");
    Ok(())
}

/// Span for a background component (route sync, admission sync, ...)
pub fn component_span(component: &str) -> tracing::Span {
    tracing::info_span!("component", name = component)
}

/// Create a request-scoped tracing span
pub fn create_request_span(method: &str, path: &str, correlation_id: &str) -> tracing::Span {
    tracing::info_span!(
        "request",
        http.method = method,
        http.path = path,
        correlation.id = correlation_id,
        client.address = tracing::field::Empty,
        route.id = tracing::field::Empty,
        http.status_code = tracing::field::Empty,
        duration_ms = tracing::field::Empty,
    )
}

/// Create a span around the upstream call
pub fn create_upstream_span(upstream: &str, method: &str, path: &str) -> tracing::Span {
    tracing::info_span!(
        "upstream_request",
        upstream.url = upstream,
        http.method = method,
        http.path = path,
        http.status_code = tracing::field::Empty,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_tracing_with_invalid_level() {
        assert!(init_tracing_with_config("not==valid", true).is_err());
    }

    #[test]
    fn test_create_request_span() {
        let span = create_request_span("GET", "/api/test", "req-123");
        if let Some(metadata) = span.metadata() {
            assert_eq!(metadata.name(), "request");
        }
    }

    #[test]
    fn test_component_span() {
        let span = component_span("route_sync");
        if let Some(metadata) = span.metadata() {
            assert_eq!(metadata.name(), "component");
        }
    }
}
