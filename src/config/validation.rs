use std::{collections::HashSet, net::SocketAddr};

use http::HeaderName;

use crate::{
    config::models::{CoordinationBackend, GatewayConfig},
    core::{admission::CompiledPolicy, route_table::Route},
};

/// Validation result type alias
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Validation error types
#[derive(Debug, thiserror::Error, Clone)]
pub enum ValidationError {
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid field '{field}': {message}")]
    InvalidField { field: String, message: String },

    #[error("Invalid listen address '{address}': {reason}")]
    InvalidListenAddress { address: String, reason: String },

    #[error("Route conflict detected: {message}")]
    RouteConflict { message: String },

    #[error("Validation failed: {message}")]
    ValidationFailed { message: String },
}

/// Gateway configuration validator
pub struct ConfigValidator;

impl ConfigValidator {
    /// Validate the entire gateway configuration, reporting every problem at once
    pub fn validate(config: &GatewayConfig) -> ValidationResult<()> {
        let mut errors = Vec::new();

        if let Err(e) = Self::validate_listen_address(&config.listen_addr) {
            errors.push(e);
        }
        if let Some(admin) = &config.admin_listen_addr {
            if let Err(e) = Self::validate_listen_address(admin) {
                errors.push(e);
            }
        }

        if config.admin_token.as_deref().is_some_and(|token| token.trim().is_empty()) {
            errors.push(ValidationError::InvalidField {
                field: "admin_token".to_string(),
                message: "must not be empty".to_string(),
            });
        }

        errors.extend(Self::validate_coordination(config));

        if let Err(e) = HeaderName::from_bytes(config.telemetry.correlation_header.as_bytes()) {
            errors.push(ValidationError::InvalidField {
                field: "telemetry.correlation_header".to_string(),
                message: e.to_string(),
            });
        }
        if let Some(header) = &config.client_address.forwarded_header {
            if let Err(e) = HeaderName::from_bytes(header.as_bytes()) {
                errors.push(ValidationError::InvalidField {
                    field: "client_address.forwarded_header".to_string(),
                    message: e.to_string(),
                });
            }
        }

        if let Err(e) = CompiledPolicy::compile(config.admission.clone()) {
            errors.push(ValidationError::InvalidField {
                field: "admission.entries".to_string(),
                message: e.to_string(),
            });
        }

        for (name, policy) in &config.rate_limits {
            if let Err(e) = policy.validate() {
                errors.push(ValidationError::InvalidField {
                    field: format!("rate_limits.{name}"),
                    message: e.to_string(),
                });
            }
        }
        for name in &config.default_rate_limits {
            if !config.rate_limits.contains_key(name) {
                errors.push(ValidationError::InvalidField {
                    field: "default_rate_limits".to_string(),
                    message: format!("Unknown rate limit '{name}'"),
                });
            }
        }

        let mut seen = HashSet::new();
        for route in &config.routes {
            if !seen.insert(route.id.as_str()) {
                errors.push(ValidationError::RouteConflict {
                    message: format!("Duplicate route id '{}'", route.id),
                });
            }
            errors.extend(Self::validate_route(route, config));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::ValidationFailed {
                message: Self::format_multiple_errors(errors),
            })
        }
    }

    /// Validate listen address format
    fn validate_listen_address(address: &str) -> ValidationResult<()> {
        if address.parse::<SocketAddr>().is_err() {
            return Err(ValidationError::InvalidListenAddress {
                address: address.to_string(),
                reason: "Must be in format 'IP:PORT' (e.g., '127.0.0.1:3000' or '0.0.0.0:8080')"
                    .to_string(),
            });
        }
        Ok(())
    }

    fn validate_coordination(config: &GatewayConfig) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        let coordination = &config.coordination;

        if coordination.backend == CoordinationBackend::Redis {
            match &coordination.redis_url {
                None => errors.push(ValidationError::MissingField {
                    field: "coordination.redis_url".to_string(),
                }),
                Some(raw) => match url::Url::parse(raw) {
                    Ok(url) if url.scheme() == "redis" || url.scheme() == "rediss" => {}
                    Ok(url) => errors.push(ValidationError::InvalidField {
                        field: "coordination.redis_url".to_string(),
                        message: format!("URL scheme must be 'redis' or 'rediss', got '{}'", url.scheme()),
                    }),
                    Err(e) => errors.push(ValidationError::InvalidField {
                        field: "coordination.redis_url".to_string(),
                        message: format!("Invalid URL format: {e}"),
                    }),
                },
            }
        }
        if coordination.operation_timeout.is_zero() {
            errors.push(ValidationError::InvalidField {
                field: "coordination.operation_timeout".to_string(),
                message: "Must be greater than 0".to_string(),
            });
        }
        if config.route_sync.max_attempts == 0 {
            errors.push(ValidationError::InvalidField {
                field: "route_sync.max_attempts".to_string(),
                message: "Must be greater than 0".to_string(),
            });
        }
        errors
    }

    fn validate_route(route: &Route, config: &GatewayConfig) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if let Err(e) = route.validate() {
            errors.push(ValidationError::InvalidField {
                field: format!("routes.{}", route.id),
                message: e.to_string(),
            });
        }
        for (i, upstream) in route.upstreams.iter().enumerate() {
            if let Err(e) = Self::validate_url(upstream, &format!("route '{}' upstream {}", route.id, i + 1)) {
                errors.push(e);
            }
        }
        if let Some(host) = &route.predicate.host {
            if host.is_empty() || host.contains("://") {
                errors.push(ValidationError::InvalidField {
                    field: format!("route '{}' host", route.id),
                    message: "Host must be a bare hostname (e.g., use 'example.com' not 'http://example.com')".to_string(),
                });
            }
        }
        for header in &route.predicate.headers {
            if HeaderName::from_bytes(header.name.as_bytes()).is_err() {
                errors.push(ValidationError::InvalidField {
                    field: format!("route '{}' headers", route.id),
                    message: format!("Invalid header name '{}'", header.name),
                });
            }
        }
        if let Some(name) = &route.rate_limit {
            if !config.rate_limits.contains_key(name) {
                errors.push(ValidationError::InvalidField {
                    field: format!("route '{}' rate_limit", route.id),
                    message: format!("Unknown rate limit '{name}'"),
                });
            }
        }
        errors
    }

    /// Validate URL format
    fn validate_url(url_str: &str, context: &str) -> ValidationResult<()> {
        match url::Url::parse(url_str) {
            Ok(url) => {
                if url.scheme() != "http" && url.scheme() != "https" {
                    return Err(ValidationError::InvalidField {
                        field: context.to_string(),
                        message: format!(
                            "URL scheme must be 'http' or 'https', got '{}'",
                            url.scheme()
                        ),
                    });
                }

                if url.host().is_none() {
                    return Err(ValidationError::InvalidField {
                        field: context.to_string(),
                        message: "URL must have a valid host".to_string(),
                    });
                }

                Ok(())
            }
            Err(e) => Err(ValidationError::InvalidField {
                field: context.to_string(),
                message: format!("Invalid URL format: {e}"),
            }),
        }
    }

    /// Format multiple validation errors into a single message
    fn format_multiple_errors(errors: Vec<ValidationError>) -> String {
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
    use crate::core::{admission::AdmissionPolicy, rate_limiter::BucketPolicy};

    fn minimal_valid_config() -> GatewayConfig {
        GatewayConfig {
            listen_addr: "127.0.0.1:8080".to_string(),
            routes: vec![Route::new("root", "/", vec!["http://localhost:3000".to_string()])],
            ..GatewayConfig::default()
        }
    }

    #[test]
    fn validate_accepts_minimal_config() {
        assert!(ConfigValidator::validate(&minimal_valid_config()).is_ok());
    }

    #[test]
    fn validate_rejects_bad_listen_address() {
        let mut config = minimal_valid_config();
        config.listen_addr = "localhost".to_string();
        assert!(ConfigValidator::validate(&config).is_err());
    }

    #[test]
    fn validate_requires_redis_url_for_redis_backend() {
        let mut config = minimal_valid_config();
        config.coordination.backend = CoordinationBackend::Redis;
        let err = ConfigValidator::validate(&config).unwrap_err();
        assert!(err.to_string().contains("coordination.redis_url"));

        config.coordination.redis_url = Some("redis://127.0.0.1:6379".to_string());
        assert!(ConfigValidator::validate(&config).is_ok());
    }

    #[test]
    fn validate_rejects_unknown_rate_limit_references() {
        let mut config = minimal_valid_config();
        config.routes[0].rate_limit = Some("missing".to_string());
        config.default_rate_limits = vec!["also-missing".to_string()];
        let err = ConfigValidator::validate(&config).unwrap_err();
        assert!(err.to_string().contains("Found 2 validation errors"));

        config.rate_limits.insert("missing".to_string(), BucketPolicy::per_second(10));
        config.rate_limits.insert("also-missing".to_string(), BucketPolicy::per_minute(100));
        assert!(ConfigValidator::validate(&config).is_ok());
    }

    #[test]
    fn validate_rejects_blank_admin_token() {
        let mut config = minimal_valid_config();
        config.admin_token = Some("  ".to_string());
        let err = ConfigValidator::validate(&config).unwrap_err();
        assert!(err.to_string().contains("admin_token"));

        config.admin_token = Some("s3cret".to_string());
        assert!(ConfigValidator::validate(&config).is_ok());
    }

    #[test]
    fn validate_rejects_zero_capacity_policy() {
        let mut config = minimal_valid_config();
        config.rate_limits.insert("broken".to_string(), BucketPolicy::per_second(0));
        assert!(ConfigValidator::validate(&config).is_err());
    }

    #[test]
    fn validate_rejects_bad_admission_entry() {
        let mut config = minimal_valid_config();
        config.admission = AdmissionPolicy::deny_list(["not-an-address"]);
        assert!(ConfigValidator::validate(&config).is_err());
    }

    #[test]
    fn validate_rejects_duplicate_route_ids_and_bad_upstreams() {
        let mut config = minimal_valid_config();
        config
            .routes
            .push(Route::new("root", "/other", vec!["ftp://files".to_string()]));
        let err = ConfigValidator::validate(&config).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("Duplicate route id 'root'"));
        assert!(message.contains("ftp"));
    }
}
