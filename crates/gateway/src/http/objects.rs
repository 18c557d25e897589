use std::time::Instant;

use airlock_contracts::encoding::{decode_base64, encode_base64};
use airlock_contracts::{ClaimsDeclaration, ObjectEnvelope, SystemEvent, events, rfc3339_now};
use airlock_envelope::EnvelopeError;
use axum::Json;
use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::http::{HeaderMap, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::Instrument;

use super::{ApiError, AppState, ProblemKind, dispatch, finish_request, gate, problem, status_of};

const CREATE_ROUTE: &str = "/objects";
const UNLOCK_ROUTE: &str = "/objects/unlock";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub(super) struct CreateObjectRequest {
    claims: serde_json::Value,
    #[serde(default)]
    payload: Option<String>,
    #[serde(default)]
    payload_base64: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct ObjectMetadata {
    policy_id: String,
    format: String,
    algo: String,
    created_at: String,
}

#[derive(Debug, Serialize)]
pub(super) struct CreateObjectResponse {
    #[serde(rename = "keyURI")]
    key_uri: String,
    /// The `x-airlock-claims` value a caller presents on access.
    claims: String,
    object: ObjectEnvelope,
    metadata: ObjectMetadata,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(super) struct UnlockObjectRequest {
    object: ObjectEnvelope,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct UnlockObjectResponse {
    payload_base64: String,
    timestamp: String,
}

fn invalid(state: &AppState, detail: impl Into<String>) -> ApiError {
    problem(
        state,
        ProblemKind::InvalidRequest,
        detail,
        serde_json::Value::Null,
    )
}

fn envelope_problem(state: &AppState, err: &EnvelopeError, key_id: Option<&str>) -> ApiError {
    let payload = serde_json::json!({ "keyId": key_id });
    match err {
        EnvelopeError::Integrity => problem(
            state,
            ProblemKind::Integrity,
            "the object does not authenticate under its key",
            payload,
        ),
        EnvelopeError::UnsupportedFormat(algo) => problem(
            state,
            ProblemKind::InvalidRequest,
            format!("unsupported object algorithm {}", algo),
            payload,
        ),
        EnvelopeError::KeyNotFound(key_id) => problem(
            state,
            ProblemKind::KeyNotFound,
            format!("no key is stored under {}", key_id),
            payload,
        ),
        EnvelopeError::Persistence(_) => problem(
            state,
            ProblemKind::StoreUnavailable,
            "the key store could not be reached",
            payload,
        ),
        EnvelopeError::Encryption(_) => {
            tracing::error!(error = %err, "envelope operation failed");
            problem(
                state,
                ProblemKind::Internal,
                "the object could not be processed",
                payload,
            )
        }
    }
}

fn payload_bytes(state: &AppState, req: &CreateObjectRequest) -> Result<Vec<u8>, ApiError> {
    let bytes = match (&req.payload, &req.payload_base64) {
        (Some(text), None) => text.as_bytes().to_vec(),
        (None, Some(encoded)) => decode_base64(encoded)
            .map_err(|_| invalid(state, "payloadBase64 is not valid base64"))?,
        _ => {
            return Err(invalid(
                state,
                "exactly one of payload or payloadBase64 is required",
            ));
        }
    };

    if bytes.is_empty() {
        return Err(invalid(state, "payload must not be empty"));
    }
    if bytes.len() > state.config.max_payload_bytes {
        return Err(problem(
            state,
            ProblemKind::PayloadTooLarge,
            format!(
                "payload is {} bytes; the limit is {}",
                bytes.len(),
                state.config.max_payload_bytes
            ),
            serde_json::Value::Null,
        ));
    }
    Ok(bytes)
}

/// Issues a policy for the declared claims and seals the payload under a
/// fresh key bound to that policy.
pub(super) async fn create_object(
    State(state): State<AppState>,
    req: Result<Json<CreateObjectRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<CreateObjectResponse>), ApiError> {
    let span = tracing::info_span!(
        "object.create",
        policy_id = tracing::field::Empty,
        key_id = tracing::field::Empty,
        latency_ms = tracing::field::Empty,
        outcome = tracing::field::Empty,
    );

    async move {
        let started = Instant::now();
        let result = seal_object(&state, req).await;
        finish_request(
            CREATE_ROUTE,
            "POST",
            started,
            status_of(&result, StatusCode::CREATED),
        );
        result.map(|body| (StatusCode::CREATED, Json(body)))
    }
    .instrument(span)
    .await
}

async fn seal_object(
    state: &AppState,
    req: Result<Json<CreateObjectRequest>, JsonRejection>,
) -> Result<CreateObjectResponse, ApiError> {
    let Json(req) = req.map_err(|rejection| {
        if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
            problem(
                state,
                ProblemKind::PayloadTooLarge,
                "request body exceeds the configured limit",
                serde_json::Value::Null,
            )
        } else {
            invalid(state, "invalid JSON body")
        }
    })?;
    let payload = payload_bytes(state, &req)?;

    let declaration = ClaimsDeclaration::new(req.claims);
    state.engine.precheck(&declaration).map_err(|err| {
        problem(
            state,
            ProblemKind::ClaimsRejected,
            err.to_string(),
            serde_json::json!({ "claimTypes": declaration.claim_types() }),
        )
    })?;

    let issued = state.ledger.issue(&declaration).await.map_err(|err| {
        if err.is_persistence() {
            problem(
                state,
                ProblemKind::StoreUnavailable,
                "the policy ledger could not be reached",
                serde_json::Value::Null,
            )
        } else {
            tracing::error!(error = %err, "policy issuance failed");
            problem(
                state,
                ProblemKind::Internal,
                "the policy could not be issued",
                serde_json::Value::Null,
            )
        }
    })?;
    tracing::Span::current().record("policy_id", issued.policy_id.as_str());

    let object = state
        .envelopes
        .seal_for_policy(&payload, &issued.policy_id)
        .await
        .map_err(|err| envelope_problem(state, &err, None))?;
    tracing::Span::current().record("key_id", object.key_id.as_str());

    crate::metrics::inc_objects_sealed();
    dispatch(
        state,
        &SystemEvent::new(
            events::OBJECT_CREATED,
            serde_json::json!({
                "policyId": issued.policy_id,
                "keyId": object.key_id,
                "format": object.format_version,
                "bytes": payload.len(),
            }),
            serde_json::Value::Null,
        ),
    );

    Ok(CreateObjectResponse {
        key_uri: state.config.key_uri(&object.key_id),
        claims: declaration.to_base64_json(),
        metadata: ObjectMetadata {
            policy_id: issued.policy_id,
            format: object.format_version.clone(),
            algo: object.algo.clone(),
            created_at: issued.created_at,
        },
        object,
    })
}

/// Admits the request for the envelope's key, decrypts it, then evaluates
/// the claims before releasing the payload.
pub(super) async fn unlock_object(
    State(state): State<AppState>,
    headers: HeaderMap,
    req: Result<Json<UnlockObjectRequest>, JsonRejection>,
) -> Result<Json<UnlockObjectResponse>, ApiError> {
    let span = tracing::info_span!(
        "object.unlock",
        policy_id = tracing::field::Empty,
        key_id = tracing::field::Empty,
        latency_ms = tracing::field::Empty,
        outcome = tracing::field::Empty,
    );

    async move {
        let started = Instant::now();
        let result = open_object(&state, &headers, req).await;
        finish_request(
            UNLOCK_ROUTE,
            "POST",
            started,
            status_of(&result, StatusCode::OK),
        );
        result.map(Json)
    }
    .instrument(span)
    .await
}

async fn open_object(
    state: &AppState,
    headers: &HeaderMap,
    req: Result<Json<UnlockObjectRequest>, JsonRejection>,
) -> Result<UnlockObjectResponse, ApiError> {
    let Json(UnlockObjectRequest { object }) =
        req.map_err(|_| invalid(state, "body must be {\"object\": ObjectEnvelope}"))?;
    tracing::Span::current().record("key_id", object.key_id.as_str());

    if object.format_version != state.envelopes.format_version() {
        return Err(invalid(
            state,
            format!("unsupported object format {}", object.format_version),
        ));
    }

    // Integrity is checked before claims so a forged envelope spends no use.
    let decision = async {
        let admission = gate::admit(state, headers, &object.key_id).await?;
        let payload = state
            .envelopes
            .open(&object)
            .await
            .map_err(|err| envelope_problem(state, &err, Some(object.key_id.as_str())))?;
        gate::grant(state, admission).await?;
        Ok::<_, ApiError>(payload)
    }
    .await;
    gate::record_decision(UNLOCK_ROUTE, &decision);
    let payload = decision?;

    Ok(UnlockObjectResponse {
        payload_base64: encode_base64(payload),
        timestamp: rfc3339_now(),
    })
}
