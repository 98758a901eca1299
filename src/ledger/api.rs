//! Call log API endpoints.

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::Deserialize;

use crate::state::RelayState;

/// Calls returned when no limit is given.
const DEFAULT_CALL_LIMIT: usize = 5;

/// Largest page the endpoint will serve.
const MAX_CALL_LIMIT: usize = 100;

#[derive(Debug, Deserialize)]
pub struct CallsQuery {
    pub limit: Option<usize>,
}

/// Most recent calls, newest first.
///
/// GET /calls?limit=5
pub async fn list_calls(
    State(state): State<RelayState>,
    Query(query): Query<CallsQuery>,
) -> impl IntoResponse {
    let limit = query.limit.unwrap_or(DEFAULT_CALL_LIMIT).min(MAX_CALL_LIMIT);

    match state.ledger.list_calls(Some(limit)).await {
        Ok(calls) => {
            tracing::debug!(count = calls.len(), "Retrieved call logs");
            Json(calls).into_response()
        }
        Err(e) => {
            tracing::error!(error = %e, "Error fetching call logs");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({ "error": "Call log unavailable" })),
            )
                .into_response()
        }
    }
}
