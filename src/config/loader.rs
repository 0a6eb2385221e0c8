use std::path::Path;

use config::{Config, Environment, File, FileFormat};
use eyre::{Context, Result};

use crate::config::models::GatewayConfig;

/// Load configuration from a file using the config crate.
///
/// Supports YAML, JSON, TOML and INI. Scalar settings can be overridden from the
/// environment with a `TOLLGATE__` prefix and `__` as the nesting separator,
/// e.g. `TOLLGATE__COORDINATION__REDIS_URL`.
pub async fn load_config(config_path: &str) -> Result<GatewayConfig> {
    load_config_sync(config_path)
}

/// Load configuration synchronously
pub fn load_config_sync(config_path: &str) -> Result<GatewayConfig> {
    let config_path = Path::new(config_path);

    let format = match config_path.extension().and_then(|ext| ext.to_str()) {
        Some("yaml") | Some("yml") => FileFormat::Yaml,
        Some("json") => FileFormat::Json,
        Some("toml") => FileFormat::Toml,
        Some("ini") => FileFormat::Ini,
        _ => FileFormat::Yaml,
    };

    let settings = Config::builder()
        .add_source(File::new(
            config_path
                .to_str()
                .ok_or_else(|| eyre::eyre!("Invalid UTF-8 path: {}", config_path.display()))?,
            format,
        ))
        .add_source(
            Environment::with_prefix("TOLLGATE")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .with_context(|| format!("Failed to build config from {}", config_path.display()))?;

    let gateway_config: GatewayConfig = settings.try_deserialize().with_context(|| {
        format!(
            "Failed to deserialize config from {}",
            config_path.display()
        )
    })?;

    Ok(gateway_config)
}

#[cfg(test)]
mod tests {
    use std::{io::Write, time::Duration};

    use tempfile::NamedTempFile;

    use super::*;
    use crate::{
        config::{CoordinationBackend, LoadBalanceStrategy},
        core::{
            admission::{AdmissionMode, ForwardedStrategy},
            rate_limiter::RateLimitKey,
        },
    };

    #[tokio::test]
    async fn test_load_yaml_config() {
        let yaml_content = r#"
listen_addr: "127.0.0.1:3000"
coordination:
  backend: redis
  redis_url: "redis://127.0.0.1:6379"
  operation_timeout: "250ms"
admission:
  mode: allow_list
  entries: ["192.168.*", "10.0.0.0/8"]
  exempt_internal_networks: true
client_address:
  max_hops: 2
  strategy: right_most_trusted
rate_limits:
  per-client:
    capacity: 5
    refill_tokens: 5
    window: "1s"
    key_by:
      type: client_address
default_rate_limits: ["per-client"]
routes:
  - id: api
    predicate:
      path_prefix: "/api"
    upstreams: ["http://backend-a:8080", "http://backend-b:8080"]
    strategy: random
"#;

        let mut temp_file = NamedTempFile::with_suffix(".yaml").unwrap();
        write!(temp_file, "{}", yaml_content).unwrap();

        let config = load_config(temp_file.path().to_str().unwrap())
            .await
            .unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:3000");
        assert_eq!(config.coordination.backend, CoordinationBackend::Redis);
        assert_eq!(config.coordination.operation_timeout, Duration::from_millis(250));
        assert_eq!(config.admission.mode, AdmissionMode::AllowList);
        assert_eq!(config.admission.entries.len(), 2);
        assert_eq!(config.client_address.strategy, ForwardedStrategy::RightMostTrusted);
        assert_eq!(config.client_address.max_hops, 2);
        let policy = &config.rate_limits["per-client"];
        assert_eq!(policy.window, Duration::from_secs(1));
        assert_eq!(policy.key_by, RateLimitKey::ClientAddress);
        assert_eq!(config.default_rate_limits, vec!["per-client".to_string()]);
        assert_eq!(config.routes.len(), 1);
        assert_eq!(config.routes[0].strategy, LoadBalanceStrategy::Random);
        assert!(config.routes[0].enabled);
    }

    #[tokio::test]
    async fn test_load_json_config_with_defaults() {
        let json_content = r#"
{
  "routes": [
    {
      "id": "root",
      "predicate": { "path_prefix": "/", "host": "example.com" },
      "upstreams": ["http://backend:8080"]
    }
  ]
}
"#;

        let mut temp_file = NamedTempFile::with_suffix(".json").unwrap();
        write!(temp_file, "{}", json_content).unwrap();

        let config = load_config(temp_file.path().to_str().unwrap())
            .await
            .unwrap();
        assert_eq!(config.listen_addr, "0.0.0.0:8080");
        assert_eq!(config.coordination.backend, CoordinationBackend::Memory);
        assert_eq!(config.coordination.key_prefix, "tollgate");
        assert_eq!(config.client_address.max_hops, 1);
        assert_eq!(config.client_address.strategy, ForwardedStrategy::LeftMost);
        assert_eq!(config.telemetry.correlation_header, "x-correlation-id");
        assert_eq!(config.routes[0].predicate.host.as_deref(), Some("example.com"));
        assert_eq!(config.routes[0].strategy, LoadBalanceStrategy::RoundRobin);
    }

    #[tokio::test]
    async fn test_load_rejects_bad_duration() {
        let mut temp_file = NamedTempFile::with_suffix(".yaml").unwrap();
        write!(
            temp_file,
            "coordination:\n  operation_timeout: \"eventually\"\n"
        )
        .unwrap();

        assert!(load_config(temp_file.path().to_str().unwrap()).await.is_err());
    }
}
