//! Proxy error types and response handling

use axum::{
    body::Body,
    http::{header, Response, StatusCode},
    response::IntoResponse,
};

/// Errors that terminate a proxied request with a client-visible status.
///
/// Per-rule expression failures and per-attempt transport failures never
/// surface here; the former are skipped, the latter converted into retries.
#[derive(Debug)]
pub(crate) enum ProxyError {
    /// No route path-prefix matched the request.
    RouteNotFound,
    /// Every candidate upstream was unhealthy, unselectable, or failed.
    NoHealthyUpstream,
    /// The request body exceeded the configured limit or could not be read.
    BodyRead(String),
    /// Safety net for response assembly failures.
    Internal(String),
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response<Body> {
        let (status, body) = match self {
            ProxyError::RouteNotFound => (
                StatusCode::NOT_FOUND,
                r#"{"error":"Route not found"}"#.to_string(),
            ),
            ProxyError::NoHealthyUpstream => (
                StatusCode::SERVICE_UNAVAILABLE,
                r#"{"error":"Service Unavailable"}"#.to_string(),
            ),
            ProxyError::BodyRead(msg) => {
                tracing::warn!("request body read failed: {}", msg);
                (
                    StatusCode::BAD_REQUEST,
                    r#"{"error":"Bad Request"}"#.to_string(),
                )
            }
            ProxyError::Internal(msg) => {
                tracing::error!("internal proxy error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    r#"{"error":"Internal Server Error"}"#.to_string(),
                )
            }
        };

        Response::builder()
            .status(status)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body))
            .unwrap_or_else(|_| Response::new(Body::from("Internal error building error response")))
    }
}
