use std::time::Instant;

use airlock_contracts::{Problem, SystemEvent};
use axum::Json;
use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use tracing::Instrument;

use super::{AppState, ProblemKind, dispatch, finish_request, problem};

const ROUTE: &str = "/events";

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(super) struct PublishEventRequest {
    name: String,
    #[serde(default)]
    payload: serde_json::Value,
    #[serde(default)]
    meta: serde_json::Value,
}

/// Publishes a caller-supplied event on the notification bus and echoes it.
pub(super) async fn publish_event(
    State(state): State<AppState>,
    req: Result<Json<PublishEventRequest>, JsonRejection>,
) -> Response {
    let span = tracing::info_span!(
        "event.publish",
        event_name = tracing::field::Empty,
        latency_ms = tracing::field::Empty,
        outcome = tracing::field::Empty,
    );

    async move {
        let started = Instant::now();

        if !state.config.events_api_enabled {
            finish_request(ROUTE, "POST", started, StatusCode::NOT_FOUND);
            return (StatusCode::NOT_FOUND, Json(Vec::<Problem>::new())).into_response();
        }

        let event = req
            .map_err(|_| "invalid JSON body".to_string())
            .and_then(|Json(req)| {
                let name = req.name.trim();
                if name.is_empty() {
                    return Err("event name must not be empty".to_string());
                }
                Ok(SystemEvent::new(name, req.payload, req.meta))
            });

        match event {
            Ok(event) => {
                tracing::Span::current().record("event_name", event.name());
                dispatch(&state, &event);
                finish_request(ROUTE, "POST", started, StatusCode::CREATED);
                (StatusCode::CREATED, Json(event)).into_response()
            }
            Err(detail) => {
                let err = problem(
                    &state,
                    ProblemKind::InvalidRequest,
                    detail,
                    serde_json::Value::Null,
                );
                finish_request(ROUTE, "POST", started, err.0);
                err.into_response()
            }
        }
    }
    .instrument(span)
    .await
}
