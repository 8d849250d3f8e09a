//! Error taxonomy for the admission and retry engine.
//!
//! [`CoreError`] enumerates every way a request can end up with a
//! locally-produced response instead of a clean upstream pass-through;
//! [`AppError`] is the catch-all axum error type for anything else
//! (configuration, I/O, unexpected panics converted to errors).

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Recoverable-by-design outcomes the admission engine surfaces directly to
/// the caller once its retry budget is exhausted. Every variant maps to a
/// specific status code and JSON body.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("local admission timeout after {attempts} attempt(s), wait_required={wait_required_s}s")]
    LocalAdmissionTimeout {
        wait_required_s: f64,
        attempts: u32,
        active_connections: usize,
        rate_per_connection: f64,
    },

    #[error("upstream transport failure: {0}")]
    UpstreamTransportFailure(String),
}

impl IntoResponse for CoreError {
    fn into_response(self) -> Response {
        match &self {
            CoreError::LocalAdmissionTimeout {
                wait_required_s,
                attempts,
                active_connections,
                rate_per_connection,
            } => {
                tracing::debug!(
                    wait_required_s,
                    attempts,
                    active_connections,
                    rate_per_connection,
                    "local admission timeout"
                );
                let retry_after = wait_required_s.ceil().max(0.0) as u64;
                let mut response = (
                    StatusCode::TOO_MANY_REQUESTS,
                    Json(json!({
                        "detail": "rate_limited_local",
                        "wait_required_s": wait_required_s,
                        "attempts": attempts,
                    })),
                )
                    .into_response();
                let headers = response.headers_mut();
                headers.insert("Retry-After", retry_after.into());
                headers.insert(
                    "X-Wait-Required",
                    format!("{wait_required_s}").parse().expect("numeric header value"),
                );
                headers.insert(
                    "X-Active-Connections",
                    active_connections.to_string().parse().expect("numeric header value"),
                );
                headers.insert(
                    "X-Rate-Per-Connection",
                    format!("{rate_per_connection}").parse().expect("numeric header value"),
                );
                response
            }
            CoreError::UpstreamTransportFailure(detail) => {
                tracing::warn!(error = %detail, "upstream unreachable");
                (
                    StatusCode::BAD_GATEWAY,
                    Json(json!({ "detail": "upstream_unreachable" })),
                )
                    .into_response()
            }
        }
    }
}

/// Wraps [`anyhow::Error`] for anything outside the admission engine's own
/// taxonomy — config/startup failures surfaced as 500s if they ever reach a
/// handler.
#[derive(Debug)]
pub struct AppError(anyhow::Error);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        tracing::error!(error = %self.0, "internal error");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "detail": "internal_error" })),
        )
            .into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(e: E) -> Self {
        Self(e.into())
    }
}

/// Panic handler for [`tower_http::catch_panic::CatchPanicLayer`]: converts a
/// caught panic into the same 500 `{"detail": "internal_error"}` response an
/// [`AppError`] produces, instead of dropping the connection.
pub fn handle_panic(payload: Box<dyn std::any::Any + Send + 'static>) -> Response {
    let detail = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    AppError::from(anyhow::anyhow!(detail)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    #[tokio::test]
    async fn local_admission_timeout_sets_retry_after_and_status() {
        let err = CoreError::LocalAdmissionTimeout {
            wait_required_s: 2.4,
            attempts: 3,
            active_connections: 2,
            rate_per_connection: 5.0,
        };
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers().get("Retry-After").unwrap(), "3");
        assert!(response.headers().get("X-Wait-Required").is_some());

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["detail"], "rate_limited_local");
    }

    #[tokio::test]
    async fn upstream_transport_failure_is_bad_gateway() {
        let err = CoreError::UpstreamTransportFailure("connect refused".into());
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["detail"], "upstream_unreachable");
    }
}
