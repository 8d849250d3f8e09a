//! The catch-all proxy route: every method, every path, handed straight to
//! the admission engine.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{ConnectInfo, State},
    http::{HeaderMap, Method, Uri},
    response::{IntoResponse, Response},
    routing::any,
    Router,
};

use crate::admission::{self, CoreContext};

pub fn router(ctx: Arc<CoreContext>) -> Router {
    Router::new()
        .route("/{*path}", any(proxy))
        .route("/", any(proxy))
        .with_state(ctx)
}

async fn proxy(
    State(ctx): State<Arc<CoreContext>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let path_and_query = uri
        .path_and_query()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| uri.path().to_string());

    admission::handle(&ctx, method, path_and_query, headers, body, addr.ip())
        .await
        .into_response()
}
