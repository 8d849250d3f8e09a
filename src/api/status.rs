//! `GET /__status` — diagnostic snapshot of the fairness registry.

use std::sync::Arc;

use axum::{extract::State, response::IntoResponse, Json};
use serde_json::json;

use crate::admission::CoreContext;

/// Returns `{n_callers, callers: {id: [rate, tokens]}}` — one entry per
/// tracked connection.
pub async fn status(State(ctx): State<Arc<CoreContext>>) -> impl IntoResponse {
    let snapshot = ctx.registry.status_snapshot();
    let callers: serde_json::Map<String, serde_json::Value> = snapshot
        .into_iter()
        .map(|(id, rate, tokens)| (id, json!([rate, tokens])))
        .collect();

    Json(json!({
        "n_callers": callers.len(),
        "callers": callers,
    }))
}
