//! Correlation ids and per-request latency classification.
//!
//! The [`RequestContext`] is an explicit value threaded through every pipeline
//! stage; nothing is carried in task-local or thread-local storage.
use std::{
    net::IpAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use http::{HeaderMap, HeaderName, HeaderValue, Method, Request, StatusCode};
use uuid::Uuid;

use crate::{core::route_table::Route, metrics, tracing_setup::create_request_span};

pub const DEFAULT_CORRELATION_HEADER: &str = "x-correlation-id";

const MAX_CORRELATION_ID_LEN: usize = 128;

/// State of one request as it moves through the pipeline.
#[derive(Debug)]
pub struct RequestContext {
    pub correlation_id: String,
    pub method: Method,
    pub path: String,
    pub client_address: Option<IpAddr>,
    pub route: Option<Arc<Route>>,
    pub started_at: Instant,
    pub status: Option<StatusCode>,
    pub span: tracing::Span,
}

impl RequestContext {
    pub fn route_id(&self) -> &str {
        self.route.as_ref().map_or("-", |r| r.id.as_str())
    }

    pub fn set_client_address(&mut self, address: IpAddr) {
        self.client_address = Some(address);
        self.span.record("client.address", tracing::field::display(address));
    }

    pub fn set_route(&mut self, route: Arc<Route>) {
        self.span.record("route.id", route.id.as_str());
        self.route = Some(route);
    }
}

/// Result of [`RequestTelemetry::finish`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestSummary {
    pub status: StatusCode,
    pub elapsed: Duration,
    pub slow: bool,
}

pub struct RequestTelemetry {
    correlation_header: HeaderName,
    slow_threshold: Duration,
}

impl Default for RequestTelemetry {
    fn default() -> Self {
        Self::new(
            HeaderName::from_static(DEFAULT_CORRELATION_HEADER),
            Duration::from_secs(1),
        )
    }
}

fn is_valid_correlation_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_CORRELATION_ID_LEN
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'))
}

impl RequestTelemetry {
    pub fn new(correlation_header: HeaderName, slow_threshold: Duration) -> Self {
        Self {
            correlation_header,
            slow_threshold,
        }
    }

    pub fn correlation_header(&self) -> &HeaderName {
        &self.correlation_header
    }

    /// Start tracking a request. A valid inbound correlation id is kept; anything
    /// else is replaced by a fresh UUID.
    pub fn begin<B>(&self, request: &Request<B>) -> RequestContext {
        let correlation_id = request
            .headers()
            .get(&self.correlation_header)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|id| is_valid_correlation_id(id))
            .map_or_else(|| Uuid::new_v4().to_string(), str::to_string);

        let method = request.method().clone();
        let path = request.uri().path().to_string();
        let span = create_request_span(method.as_str(), &path, &correlation_id);

        RequestContext {
            correlation_id,
            method,
            path,
            client_address: None,
            route: None,
            started_at: Instant::now(),
            status: None,
            span,
        }
    }

    /// Write the correlation id onto an outgoing header map (upstream request or response).
    pub fn stamp(&self, context: &RequestContext, headers: &mut HeaderMap) {
        // Ids are either validated inbound values or UUIDs, both valid header values.
        if let Ok(value) = HeaderValue::from_str(&context.correlation_id) {
            headers.insert(self.correlation_header.clone(), value);
        }
    }

    /// Close out a request: echo the correlation id, record latency, classify slow requests.
    pub fn finish(&self, mut context: RequestContext, response_headers: &mut HeaderMap, status: StatusCode) -> RequestSummary {
        self.stamp(&context, response_headers);
        context.status = Some(status);

        let elapsed = context.started_at.elapsed();
        let slow = elapsed >= self.slow_threshold;
        let route = context.route_id().to_string();
        let elapsed_ms = elapsed.as_millis() as u64;

        context.span.record("http.status_code", status.as_u16());
        context.span.record("duration_ms", elapsed_ms);

        metrics::increment_request_total(&route, status.as_u16());
        metrics::record_request_duration(&route, elapsed);

        let _entered = context.span.enter();
        if slow {
            metrics::increment_slow_request(&route);
            tracing::warn!(
                slow = true,
                status = status.as_u16(),
                elapsed_ms,
                threshold_ms = self.slow_threshold.as_millis() as u64,
                route = %route,
                "Slow request completed"
            );
        } else {
            tracing::info!(
                slow = false,
                status = status.as_u16(),
                elapsed_ms,
                route = %route,
                "Request completed"
            );
        }

        RequestSummary {
            status,
            elapsed,
            slow,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(correlation: Option<&str>) -> Request<()> {
        let mut builder = Request::builder().uri("/api/items?x=1");
        if let Some(id) = correlation {
            builder = builder.header(DEFAULT_CORRELATION_HEADER, id);
        }
        builder.body(()).unwrap()
    }

    #[test]
    fn test_valid_inbound_id_is_kept() {
        let telemetry = RequestTelemetry::default();
        let ctx = telemetry.begin(&request(Some("abc-123_x.y")));
        assert_eq!(ctx.correlation_id, "abc-123_x.y");
        assert_eq!(ctx.path, "/api/items");
    }

    #[test]
    fn test_invalid_or_missing_id_is_replaced() {
        let telemetry = RequestTelemetry::default();
        for inbound in [None, Some(""), Some("has space"), Some("semi;colon")] {
            let ctx = telemetry.begin(&request(inbound));
            assert!(Uuid::parse_str(&ctx.correlation_id).is_ok(), "{inbound:?}");
        }
        let too_long = "a".repeat(129);
        let ctx = telemetry.begin(&request(Some(&too_long)));
        assert_ne!(ctx.correlation_id, too_long);
    }

    #[test]
    fn test_finish_echoes_id_and_classifies() {
        let fast = RequestTelemetry::new(HeaderName::from_static("x-request-id"), Duration::from_secs(60));
        let mut req = request(None);
        req.headers_mut().insert("x-request-id", HeaderValue::from_static("req-1"));
        let ctx = fast.begin(&req);
        let mut headers = HeaderMap::new();
        let summary = fast.finish(ctx, &mut headers, StatusCode::OK);
        assert_eq!(headers.get("x-request-id").unwrap(), "req-1");
        assert!(!summary.slow);

        let slow = RequestTelemetry::new(HeaderName::from_static("x-request-id"), Duration::ZERO);
        let ctx = slow.begin(&req);
        let summary = slow.finish(ctx, &mut HeaderMap::new(), StatusCode::OK);
        assert!(summary.slow);
    }
}
