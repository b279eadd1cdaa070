//! Proxy error taxonomy and its HTTP mapping
//!
//! Errors that reach the client get a bare status with a one-line body; the
//! detail stays in the log. Upstream HTTP error *statuses* are not errors
//! here — they stream back to the client unchanged.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use tracing::warn;

use crate::credentials::CredentialError;

/// Failures while forwarding a request.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// The credential provider could not produce a usable key pair.
    #[error("credential refresh failed: {0}")]
    Credential(#[from] CredentialError),

    /// A rewritten header or Authorization value was not representable.
    /// Unreachable for well-formed inbound requests.
    #[error("request could not be re-signed: {0}")]
    Signing(String),

    /// The upstream connection failed before a status line arrived.
    #[error("upstream request failed: {0}")]
    Upstream(#[from] reqwest::Error),
}

impl ProxyError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::Credential(_) => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::Signing(_) => StatusCode::BAD_GATEWAY,
            ProxyError::Upstream(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        warn!("{self}");
        let body = match &self {
            ProxyError::Credential(_) => "credential refresh failed",
            ProxyError::Signing(_) => "request could not be re-signed",
            ProxyError::Upstream(_) => "upstream request failed",
        };
        (self.status_code(), body).into_response()
    }
}
