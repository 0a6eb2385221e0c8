use async_trait::async_trait;
use axum::body::Body as AxumBody;
use hyper::{Request, Response};
use thiserror::Error;

/// Custom error type for upstream forwarding
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum HttpClientError {
    /// Error when connection to the upstream fails
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// Error when request times out
    #[error("Timeout error after {0} ms")]
    Timeout(u64),

    /// Error when request is invalid
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

/// Result type alias for HTTP client operations
pub type HttpClientResult<T> = Result<T, HttpClientError>;

/// HttpClient defines the port for forwarding a request to an upstream target.
///
/// The request URI is already rewritten to point at the selected upstream; the
/// control plane only decides *where* to send and *whether* to send at all.
#[async_trait]
pub trait HttpClient: Send + Sync + 'static {
    /// Forward a request and return the upstream response
    async fn send_request(&self, req: Request<AxumBody>) -> HttpClientResult<Response<AxumBody>>;
}
