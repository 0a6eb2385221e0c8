use std::{net::SocketAddr, sync::Arc, time::Instant};

use axum::{
    body::Body as AxumBody,
    http::{StatusCode, header},
};
use eyre::{Result, WrapErr};
use hyper::{Request, Response};

use crate::{core::pipeline::GatewayPipeline, metrics};

/// Data-plane entry point: operational endpoints plus the gateway pipeline.
///
/// `/health` and `/status` are answered locally and take precedence over any
/// route with an overlapping prefix.
pub struct HttpHandler {
    pipeline: Arc<GatewayPipeline>,
    instance_id: String,
    started_at: Instant,
}

impl HttpHandler {
    pub fn new(pipeline: Arc<GatewayPipeline>, instance_id: impl Into<String>) -> Self {
        Self {
            pipeline,
            instance_id: instance_id.into(),
            started_at: Instant::now(),
        }
    }

    pub fn pipeline(&self) -> &Arc<GatewayPipeline> {
        &self.pipeline
    }

    pub async fn handle_request(
        &self,
        req: Request<AxumBody>,
        client_addr: Option<SocketAddr>,
    ) -> Response<AxumBody> {
        let local = match req.uri().path() {
            "/health" => Some(self.handle_health_check()),
            "/status" => Some(self.handle_status()),
            _ => None,
        };

        match local {
            Some(Ok(response)) => response,
            Some(Err(e)) => {
                tracing::error!("Failed to build operational response: {:#}", e);
                let mut response = Response::new(AxumBody::empty());
                *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                response
            }
            None => self.pipeline.handle(req, client_addr).await,
        }
    }

    /// Healthy once at least one route is loaded; an empty table refuses all traffic.
    fn handle_health_check(&self) -> Result<Response<AxumBody>> {
        let snapshot = self.pipeline.routes().snapshot();
        let status = if snapshot.is_empty() {
            StatusCode::SERVICE_UNAVAILABLE
        } else {
            StatusCode::OK
        };

        let health_data = serde_json::json!({
            "status": if status == StatusCode::OK { "healthy" } else { "unhealthy" },
            "routes": snapshot.len(),
            "timestamp": chrono::Utc::now().to_rfc3339()
        });

        Response::builder()
            .status(status)
            .header(header::CONTENT_TYPE, "application/json")
            .body(AxumBody::from(health_data.to_string()))
            .wrap_err("Failed to build health check response")
    }

    fn handle_status(&self) -> Result<Response<AxumBody>> {
        let snapshot = self.pipeline.routes().snapshot();
        let uptime = self.started_at.elapsed();

        let status_data = serde_json::json!({
            "service": "tollgate",
            "version": env!("CARGO_PKG_VERSION"),
            "instance_id": &self.instance_id,
            "uptime_secs": uptime.as_secs(),
            "uptime": humantime::format_duration(std::time::Duration::from_secs(uptime.as_secs())).to_string(),
            "routes": {
                "version": snapshot.version(),
                "count": snapshot.len()
            },
            "admission": {
                "version": self.pipeline.admission().version(),
                "mode": self.pipeline.admission().policy().mode
            },
            "rate_limits": {
                "version": self.pipeline.policies().version(),
                "count": self.pipeline.policies().list().len()
            },
            "gauges": metrics::get_current_metrics(),
            "timestamp": chrono::Utc::now().to_rfc3339()
        });

        Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "application/json")
            .body(AxumBody::from(status_data.to_string()))
            .wrap_err("Failed to build status response")
    }
}

impl Clone for HttpHandler {
    fn clone(&self) -> Self {
        Self {
            pipeline: self.pipeline.clone(),
            instance_id: self.instance_id.clone(),
            started_at: self.started_at,
        }
    }
}
