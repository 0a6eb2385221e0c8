use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body as AxumBody;
use eyre::Result;
use hyper::{Request, Response, Version, header, header::HeaderValue};
use hyper_rustls::HttpsConnector;
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::TokioExecutor,
};
use rustls_native_certs::load_native_certs;
use tokio::time::timeout;
use tracing::Instrument;

use crate::{
    ports::http_client::{HttpClient, HttpClientError, HttpClientResult},
    tracing_setup::create_upstream_span,
};

/// Upstream forwarder built on Hyper with Rustls (HTTP/1.1, ALPN may negotiate h2).
///
/// Every call is bounded by the configured upstream timeout. Retries and
/// circuit breaking are deliberately absent: the control plane decides where a
/// request goes, not how hard to try.
pub struct HttpClientAdapter {
    client: Client<HttpsConnector<HttpConnector>, AxumBody>,
    request_timeout: Duration,
}

impl HttpClientAdapter {
    pub fn new(request_timeout: Duration) -> Result<Self> {
        // Install default crypto provider for rustls if not already set
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

        let mut http_connector = HttpConnector::new();
        http_connector.enforce_http(false);

        let mut root_cert_store = rustls::RootCertStore::empty();
        let native_certs = load_native_certs();
        for cert in native_certs.certs {
            if root_cert_store.add(cert).is_err() {
                tracing::warn!("Failed to add native certificate to rustls RootCertStore");
            }
        }
        if !native_certs.errors.is_empty() {
            tracing::warn!(
                "Some native certificates failed to load: {:?}",
                native_certs.errors
            );
        }
        tracing::debug!("Loaded {} native root certificates", root_cert_store.len());

        let tls_config = rustls::ClientConfig::builder()
            .with_root_certificates(root_cert_store)
            .with_no_client_auth();

        let https_connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config(tls_config)
            .https_or_http()
            .enable_http1()
            .wrap_connector(http_connector);

        let client = Client::builder(TokioExecutor::new()).build::<_, AxumBody>(https_connector);

        Ok(Self {
            client,
            request_timeout,
        })
    }

    /// Set the Host header to the upstream authority.
    fn set_host_header(req: &mut Request<AxumBody>) -> HttpClientResult<()> {
        let Some(host) = req.uri().host() else {
            return Err(HttpClientError::InvalidRequest(format!(
                "Outgoing URI has no host: {}",
                req.uri()
            )));
        };
        let value = match req.uri().port_u16() {
            Some(port) => HeaderValue::from_str(&format!("{host}:{port}")),
            None => HeaderValue::from_str(host),
        }
        .map_err(|e| HttpClientError::InvalidRequest(e.to_string()))?;
        req.headers_mut().insert(header::HOST, value);
        Ok(())
    }
}

#[async_trait]
impl HttpClient for HttpClientAdapter {
    async fn send_request(&self, mut req: Request<AxumBody>) -> HttpClientResult<Response<AxumBody>> {
        Self::set_host_header(&mut req)?;
        *req.version_mut() = Version::HTTP_11;

        let upstream = format!(
            "{}://{}",
            req.uri().scheme_str().unwrap_or("http"),
            req.uri().authority().map_or("unknown", |a| a.as_str())
        );
        let method = req.method().clone();
        let uri = req.uri().clone();
        let span = create_upstream_span(&upstream, method.as_str(), uri.path());

        let client = self.client.clone();
        let limit = self.request_timeout;
        async move {
            match timeout(limit, client.request(req)).await {
                Ok(Ok(response)) => {
                    tracing::Span::current().record("http.status_code", response.status().as_u16());
                    let (mut parts, body) = response.into_parts();
                    // Axum re-frames the body downstream.
                    parts.headers.remove(header::TRANSFER_ENCODING);
                    Ok(Response::from_parts(parts, AxumBody::new(body)))
                }
                Ok(Err(e)) => {
                    tracing::error!("Upstream request {} {} failed: {}", method, uri, e);
                    Err(HttpClientError::ConnectionError(format!(
                        "Request to {method} {uri} failed: {e}"
                    )))
                }
                Err(_) => {
                    tracing::error!("Upstream request {} {} timed out after {:?}", method, uri, limit);
                    Err(HttpClientError::Timeout(limit.as_millis() as u64))
                }
            }
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_http_client_creation() {
        assert!(HttpClientAdapter::new(Duration::from_secs(5)).is_ok());
    }

    #[test]
    fn test_host_header_includes_port() {
        let mut req = Request::builder()
            .uri("http://backend.internal:8080/x")
            .body(AxumBody::empty())
            .unwrap();
        HttpClientAdapter::set_host_header(&mut req).unwrap();
        assert_eq!(req.headers().get(header::HOST).unwrap(), "backend.internal:8080");
    }

    #[test]
    fn test_relative_uri_is_rejected() {
        let mut req = Request::builder().uri("/x").body(AxumBody::empty()).unwrap();
        assert!(matches!(
            HttpClientAdapter::set_host_header(&mut req),
            Err(HttpClientError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_unreachable_upstream_is_connection_error() {
        let client = HttpClientAdapter::new(Duration::from_secs(2)).unwrap();
        let req = Request::builder()
            .uri("http://127.0.0.1:1/")
            .body(AxumBody::empty())
            .unwrap();
        assert!(client.send_request(req).await.is_err());
    }
}
