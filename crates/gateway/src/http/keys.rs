use std::time::Instant;

use airlock_contracts::rfc3339_now;
use axum::Json;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use serde::Serialize;
use tracing::Instrument;

use super::{ApiError, AppState, finish_request, gate, status_of};

const ROUTE: &str = "/keys/{key_id}";

#[derive(Debug, Serialize)]
pub(super) struct KeyAccessResponse {
    timestamp: String,
}

/// Access check for a stored key. The key material itself never leaves
/// the gateway; a 200 only states that the caller may use it.
pub(super) async fn access_key(
    State(state): State<AppState>,
    Path(key_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<KeyAccessResponse>, ApiError> {
    let span = tracing::info_span!(
        "key.access",
        key_id = %key_id,
        policy_id = tracing::field::Empty,
        latency_ms = tracing::field::Empty,
        outcome = tracing::field::Empty,
    );

    async move {
        let started = Instant::now();
        let result = gate::authorize(&state, ROUTE, &headers, &key_id)
            .await
            .map(|grant| {
                tracing::info!(
                    policy_id = %grant.policy_id,
                    algo = %grant.binding.algo,
                    "key access granted"
                );
                Json(KeyAccessResponse {
                    timestamp: rfc3339_now(),
                })
            });
        finish_request(ROUTE, "GET", started, status_of(&result, StatusCode::OK));
        result
    }
    .instrument(span)
    .await
}
