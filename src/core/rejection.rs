//! Control-plane rejections and their response envelope.
//!
//! Every stage failure is converted into a [`Rejection`] at the pipeline
//! boundary; nothing propagates to the client as an unstructured fault.
use axum::{
    Json,
    http::{HeaderValue, StatusCode, header::RETRY_AFTER},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    core::{admission::AdmissionError, lock::LockError, rate_limiter::RateLimitError, route_table::RouteError},
    metrics,
    ports::http_client::HttpClientError,
};

#[derive(Error, Debug)]
pub enum Rejection {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Forbidden(String),

    /// Missing or wrong management API credentials
    #[error("{0}")]
    Unauthorized(String),

    #[error("{message}")]
    LimitExceeded { message: String, retry_after_secs: u64 },

    #[error("{0}")]
    LockTimeout(String),

    #[error("{0}")]
    NotHolder(String),

    /// The coordination store could not answer; distinct from a policy denial
    #[error("{0}")]
    CoordinationUnavailable(String),

    #[error("Unable to determine the client address")]
    ClientAddressUnresolvable,

    #[error("{0}")]
    UpstreamUnavailable(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Invalid(String),
}

/// JSON body of every rejection response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RejectionBody {
    pub code: String,
    pub message: String,
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_seconds: Option<u64>,
}

impl Rejection {
    /// Machine-readable code clients key their retry strategy on.
    pub fn code(&self) -> &'static str {
        match self {
            Rejection::NotFound(_) => "NOT_FOUND",
            Rejection::Forbidden(_) => "FORBIDDEN",
            Rejection::Unauthorized(_) => "UNAUTHORIZED",
            Rejection::LimitExceeded { .. } => "LIMIT_EXCEEDED",
            Rejection::LockTimeout(_) => "LOCK_TIMEOUT",
            Rejection::NotHolder(_) => "NOT_HOLDER",
            Rejection::CoordinationUnavailable(_) => "COORDINATION_UNAVAILABLE",
            Rejection::ClientAddressUnresolvable => "CLIENT_ADDRESS_UNRESOLVABLE",
            Rejection::UpstreamUnavailable(_) => "UPSTREAM_UNAVAILABLE",
            Rejection::Conflict(_) => "CONFLICT",
            Rejection::Invalid(_) => "INVALID_REQUEST",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Rejection::NotFound(_) => StatusCode::NOT_FOUND,
            Rejection::Forbidden(_) => StatusCode::FORBIDDEN,
            Rejection::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Rejection::LimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            Rejection::LockTimeout(_) | Rejection::NotHolder(_) | Rejection::Conflict(_) => {
                StatusCode::CONFLICT
            }
            Rejection::CoordinationUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Rejection::ClientAddressUnresolvable | Rejection::Invalid(_) => StatusCode::BAD_REQUEST,
            Rejection::UpstreamUnavailable(_) => StatusCode::BAD_GATEWAY,
        }
    }

    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Rejection::LimitExceeded { retry_after_secs, .. } => Some(*retry_after_secs),
            _ => None,
        }
    }

    pub fn body(&self) -> RejectionBody {
        RejectionBody {
            code: self.code().to_string(),
            message: self.to_string(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            retry_after_seconds: self.retry_after_secs(),
        }
    }
}

impl IntoResponse for Rejection {
    fn into_response(self) -> Response {
        metrics::increment_rejection(self.code());
        let retry_after = self.retry_after_secs();
        let mut response = (self.status(), Json(self.body())).into_response();
        if let Some(secs) = retry_after {
            response
                .headers_mut()
                .insert(RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}

impl From<RouteError> for Rejection {
    fn from(e: RouteError) -> Self {
        match e {
            RouteError::NotFound { .. } | RouteError::UnknownRoute { .. } => {
                Rejection::NotFound(e.to_string())
            }
            RouteError::VersionConflict { .. } => Rejection::Conflict(e.to_string()),
            RouteError::Invalid(_) => Rejection::Invalid(e.to_string()),
            RouteError::Coordination(_) => Rejection::CoordinationUnavailable(e.to_string()),
        }
    }
}

impl From<AdmissionError> for Rejection {
    fn from(e: AdmissionError) -> Self {
        match e {
            AdmissionError::Forbidden { .. } => {
                Rejection::Forbidden("Client address is not admitted".to_string())
            }
            AdmissionError::ClientAddressUnresolvable => Rejection::ClientAddressUnresolvable,
            AdmissionError::InvalidPattern { .. } => Rejection::Invalid(e.to_string()),
            AdmissionError::Coordination(_) => Rejection::CoordinationUnavailable(e.to_string()),
        }
    }
}

impl From<RateLimitError> for Rejection {
    fn from(e: RateLimitError) -> Self {
        match e {
            RateLimitError::LimitExceeded { retry_after_secs, .. } => Rejection::LimitExceeded {
                message: "Rate limit exceeded".to_string(),
                retry_after_secs,
            },
            RateLimitError::Unavailable(_) => Rejection::CoordinationUnavailable(e.to_string()),
            RateLimitError::InvalidRequest(_) => Rejection::Invalid(e.to_string()),
        }
    }
}

impl From<LockError> for Rejection {
    fn from(e: LockError) -> Self {
        match e {
            LockError::Timeout { .. } => Rejection::LockTimeout(e.to_string()),
            LockError::NotHolder { .. } => Rejection::NotHolder(e.to_string()),
            LockError::Unavailable(_) => Rejection::CoordinationUnavailable(e.to_string()),
            LockError::InvalidRequest(_) => Rejection::Invalid(e.to_string()),
        }
    }
}

impl From<HttpClientError> for Rejection {
    fn from(e: HttpClientError) -> Self {
        Rejection::UpstreamUnavailable(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use http_body_util::BodyExt;

    use super::*;
    use crate::ports::coordination_store::StoreError;

    #[tokio::test]
    async fn test_limit_exceeded_envelope() {
        let rejection: Rejection = RateLimitError::LimitExceeded {
            key: "ratelimit:api:r".into(),
            retry_after_secs: 3,
        }
        .into();
        let response = rejection.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers().get(RETRY_AFTER).unwrap(), "3");

        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body: RejectionBody = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body.code, "LIMIT_EXCEEDED");
        assert_eq!(body.retry_after_seconds, Some(3));
        assert!(chrono::DateTime::parse_from_rfc3339(&body.timestamp).is_ok());
    }

    #[tokio::test]
    async fn test_forbidden_has_no_retry_hint() {
        let rejection: Rejection = AdmissionError::Forbidden {
            address: "10.0.1.7".parse().unwrap(),
        }
        .into();
        let response = rejection.into_response();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert!(response.headers().get(RETRY_AFTER).is_none());
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["code"], "FORBIDDEN");
        assert!(json.get("retryAfterSeconds").is_none());
    }

    #[test]
    fn test_infrastructure_failures_are_distinct_from_denials() {
        let unavailable: Rejection = RateLimitError::Unavailable(StoreError::Timeout(Duration::from_millis(5))).into();
        assert_eq!(unavailable.code(), "COORDINATION_UNAVAILABLE");
        assert_eq!(unavailable.status(), StatusCode::SERVICE_UNAVAILABLE);

        let lock: Rejection = LockError::Unavailable(StoreError::Unavailable("down".into())).into();
        assert_eq!(lock.code(), "COORDINATION_UNAVAILABLE");

        let timeout: Rejection = LockError::Timeout {
            resource: "r".into(),
            waited: Duration::from_secs(1),
        }
        .into();
        assert_eq!(timeout.code(), "LOCK_TIMEOUT");
        assert_eq!(timeout.status(), StatusCode::CONFLICT);
    }

    #[test]
    fn test_route_and_address_mapping() {
        let not_found: Rejection = RouteError::NotFound { path: "/x".into() }.into();
        assert_eq!(not_found.status(), StatusCode::NOT_FOUND);

        let unresolvable: Rejection = AdmissionError::ClientAddressUnresolvable.into();
        assert_eq!(unresolvable.code(), "CLIENT_ADDRESS_UNRESOLVABLE");
        assert_eq!(unresolvable.status(), StatusCode::BAD_REQUEST);

        let upstream: Rejection = HttpClientError::Timeout(100).into();
        assert_eq!(upstream.status(), StatusCode::BAD_GATEWAY);
    }
}
