use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use airlock_contracts::{Problem, SystemEvent, events};
use airlock_envelope::EnvelopeService;
use airlock_events::NotificationBus;
use airlock_ledger::{
    CryptoPool, MemoryRecordStore, PgRecordStore, PolicyKeys, PolicyLedger, RecordStore,
    UsageLedger,
};
use airlock_policy::{ClaimEvaluationEngine, PredicateRegistry};
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;

use crate::config::{GatewayConfig, PolicyKeySource, StartupError, StoreBackend};

mod events_api;
mod gate;
mod keys;
mod objects;

pub const POLICY_HEADER: &str = "x-airlock-policy";
pub const CLAIMS_HEADER: &str = "x-airlock-claims";
pub const FORMAT_HEADER: &str = "x-airlock-format";

#[derive(Clone)]
pub struct AppState {
    config: GatewayConfig,
    store: Arc<dyn RecordStore>,
    ledger: PolicyLedger,
    engine: ClaimEvaluationEngine,
    envelopes: EnvelopeService,
    bus: Arc<NotificationBus>,
}

impl AppState {
    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn store(&self) -> Arc<dyn RecordStore> {
        self.store.clone()
    }

    pub fn bus(&self) -> Arc<NotificationBus> {
        self.bus.clone()
    }
}

type ApiError = (StatusCode, Json<Vec<Problem>>);

pub async fn router(config: GatewayConfig) -> Result<Router, StartupError> {
    let state = build_state(config).await?;
    Ok(router_with_state(state))
}

pub fn router_with_state(state: AppState) -> Router {
    // Base64 inflates payloads by a third; leave room for claims and framing.
    let body_limit = state
        .config
        .max_payload_bytes
        .saturating_mul(2)
        .saturating_add(64 * 1024);

    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/objects", post(objects::create_object))
        .route("/objects/unlock", post(objects::unlock_object))
        .route("/keys/{key_id}", get(keys::access_key))
        .route("/events", post(events_api::publish_event))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}

pub async fn build_state(config: GatewayConfig) -> Result<AppState, StartupError> {
    let store: Arc<dyn RecordStore> = match config.store {
        StoreBackend::Memory => Arc::new(MemoryRecordStore::new()),
        StoreBackend::Postgres => {
            let db_url = config.db_url.as_deref().ok_or_else(|| StartupError {
                code: "ERR_MISSING_CONFIG",
                message: "postgres store requires AIRLOCK_DB_URL".to_string(),
            })?;
            let store = PgRecordStore::connect_and_migrate(db_url, config.store_timeout())
                .await
                .map_err(|err| StartupError {
                    code: "ERR_STORE_UNAVAILABLE",
                    message: format!("failed to initialize record store: {}", err),
                })?;
            Arc::new(store)
        }
    };

    build_state_with_store(config, store)
}

/// Wires every service over an already connected record store.
pub fn build_state_with_store(
    config: GatewayConfig,
    store: Arc<dyn RecordStore>,
) -> Result<AppState, StartupError> {
    let keys = match &config.policy_keys {
        PolicyKeySource::SigningSeedHex(seed) => {
            PolicyKeys::from_seed_hex(seed).map_err(|err| StartupError {
                code: "ERR_INVALID_SIGNING_KEY",
                message: err.to_string(),
            })?
        }
        PolicyKeySource::VerifyingKeyHex(public) => {
            PolicyKeys::verify_only_hex(public).map_err(|err| StartupError {
                code: "ERR_INVALID_VERIFYING_KEY",
                message: err.to_string(),
            })?
        }
        PolicyKeySource::Ephemeral => {
            tracing::warn!(
                "no policy key configured; generated an ephemeral signing key, \
                 policies will not verify after restart"
            );
            PolicyKeys::generate()
        }
    };

    let pool = CryptoPool::new(config.crypto_workers);
    let ledger = PolicyLedger::new(store.clone(), pool.clone(), keys, config.store_timeout());
    if !ledger.can_issue() {
        tracing::warn!("gateway runs verify-only; object creation is disabled");
    }

    let usage = Arc::new(UsageLedger::new(store.clone(), config.store_timeout()));
    let engine = ClaimEvaluationEngine::new(Arc::new(PredicateRegistry::with_builtins(usage)));

    let envelopes = EnvelopeService::new(
        store.clone(),
        pool,
        config.store_timeout(),
        config.format_version.clone(),
    );

    let bus = Arc::new(NotificationBus::new());
    register_audit_listeners(&bus);

    tracing::info!(
        store = ?config.store,
        key_fingerprint = %ledger.key_fingerprint(),
        format_version = %config.format_version,
        crypto_workers = config.crypto_workers,
        "airlock gateway state ready"
    );

    Ok(AppState {
        config,
        store,
        ledger,
        engine,
        envelopes,
        bus,
    })
}

/// Audit trail of lifecycle and denial events through `tracing`.
fn register_audit_listeners(bus: &NotificationBus) {
    bus.add_event_listener(events::APP_INITIALIZED, |event| {
        tracing::info!(event_id = %event.header.id, payload = %event.payload, "app initialized");
        Ok(())
    });
    bus.add_event_listener(events::OBJECT_CREATED, |event| {
        tracing::info!(
            event_id = %event.header.id,
            policy_id = event.payload["policyId"].as_str().unwrap_or_default(),
            key_id = event.payload["keyId"].as_str().unwrap_or_default(),
            "object created"
        );
        Ok(())
    });
    for name in [
        events::POLICY_SIGNATURE_VALIDATION_FAILURE,
        events::POLICY_CLAIMS_VALIDATION_FAILURE,
        events::REQUEST_REJECTED,
    ] {
        bus.add_event_listener(name, |event| {
            tracing::warn!(
                event_id = %event.header.id,
                event_name = event.name(),
                payload = %event.payload,
                "request denied"
            );
            Ok(())
        });
    }
    bus.add_event_listener(events::INTERNAL_ERROR, |event| {
        tracing::error!(event_id = %event.header.id, payload = %event.payload, "internal error");
        Ok(())
    });
}

pub fn dispatch(state: &AppState, event: &SystemEvent) {
    let report = state.bus.dispatch_event(event);
    crate::metrics::observe_event_dispatch(event.name(), &report);
}

async fn healthz() -> &'static str {
    "ok"
}

#[derive(Debug, Serialize)]
struct ReadyzResponse {
    status: &'static str,
    checks: BTreeMap<&'static str, bool>,
}

async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let mut checks = BTreeMap::new();

    let store_ready = airlock_ledger::store::timed(state.config.store_timeout(), state.store.ping())
        .await
        .is_ok();
    checks.insert("store", store_ready);
    checks.insert("event_bus", !state.bus.is_closed());

    let all_ready = checks.values().all(|ok| *ok);
    let status = if all_ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(ReadyzResponse {
            status: if all_ready { "ready" } else { "not_ready" },
            checks,
        }),
    )
}

async fn metrics() -> impl IntoResponse {
    match crate::metrics::render() {
        Ok((body, content_type)) => {
            let mut headers = HeaderMap::new();
            if let Ok(value) = HeaderValue::from_str(content_type.as_str()) {
                headers.insert(header::CONTENT_TYPE, value);
            }
            (headers, body).into_response()
        }
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProblemKind {
    InvalidRequest,
    ClaimsRejected,
    PolicyValidation,
    ClaimVerification,
    KeyNotFound,
    PayloadTooLarge,
    Integrity,
    StoreUnavailable,
    Internal,
}

impl ProblemKind {
    fn status(self) -> StatusCode {
        match self {
            ProblemKind::InvalidRequest | ProblemKind::ClaimsRejected => StatusCode::BAD_REQUEST,
            ProblemKind::PolicyValidation => StatusCode::FORBIDDEN,
            ProblemKind::ClaimVerification => StatusCode::UNAUTHORIZED,
            ProblemKind::KeyNotFound => StatusCode::NOT_FOUND,
            ProblemKind::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            ProblemKind::Integrity => StatusCode::UNPROCESSABLE_ENTITY,
            ProblemKind::StoreUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ProblemKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn slug(self) -> &'static str {
        match self {
            ProblemKind::InvalidRequest => "invalid-request",
            ProblemKind::ClaimsRejected => "claims-validation",
            ProblemKind::PolicyValidation => "policy-validation",
            ProblemKind::ClaimVerification => "policy-claim-verification",
            ProblemKind::KeyNotFound => "key-not-found",
            ProblemKind::PayloadTooLarge => "payload-too-large",
            ProblemKind::Integrity => "object-integrity",
            ProblemKind::StoreUnavailable => "store-unavailable",
            ProblemKind::Internal => "internal-error",
        }
    }

    fn title(self) -> &'static str {
        match self {
            ProblemKind::InvalidRequest => "The request cannot be processed",
            ProblemKind::ClaimsRejected => "The Airlock claims declaration is not valid",
            ProblemKind::PolicyValidation => "The Airlock policy cannot be validated",
            ProblemKind::ClaimVerification => "The Airlock policy claims cannot be verified",
            ProblemKind::KeyNotFound => "The requested key does not exist",
            ProblemKind::PayloadTooLarge => "The object payload is too large",
            ProblemKind::Integrity => "The object failed its integrity check",
            ProblemKind::StoreUnavailable => "The Airlock store is unavailable",
            ProblemKind::Internal => "The Airlock gateway failed to process the request",
        }
    }

    fn event_name(self) -> &'static str {
        match self {
            ProblemKind::PolicyValidation => events::POLICY_SIGNATURE_VALIDATION_FAILURE,
            ProblemKind::ClaimsRejected | ProblemKind::ClaimVerification => {
                events::POLICY_CLAIMS_VALIDATION_FAILURE
            }
            ProblemKind::StoreUnavailable | ProblemKind::Internal => events::INTERNAL_ERROR,
            ProblemKind::InvalidRequest
            | ProblemKind::KeyNotFound
            | ProblemKind::PayloadTooLarge
            | ProblemKind::Integrity => events::REQUEST_REJECTED,
        }
    }
}

/// Publishes the denial event and renders the problem that points at it.
fn problem(
    state: &AppState,
    kind: ProblemKind,
    detail: impl Into<String>,
    payload: serde_json::Value,
) -> ApiError {
    problem_with_claims(state, kind, detail, payload, None)
}

fn problem_with_claims(
    state: &AppState,
    kind: ProblemKind,
    detail: impl Into<String>,
    payload: serde_json::Value,
    unsatisfied_claims: Option<Vec<String>>,
) -> ApiError {
    let detail = detail.into();
    let mut payload = match payload {
        serde_json::Value::Object(map) => serde_json::Value::Object(map),
        serde_json::Value::Null => serde_json::json!({}),
        other => serde_json::json!({ "context": other }),
    };
    payload["detail"] = serde_json::Value::String(detail.clone());
    payload["status"] = serde_json::Value::from(kind.status().as_u16());

    let event = SystemEvent::new(kind.event_name(), payload, serde_json::Value::Null);
    dispatch(state, &event);

    (
        kind.status(),
        Json(vec![Problem {
            problem_type: state.config.problem_type(kind.slug()),
            title: kind.title().to_string(),
            detail,
            instance: event.instance_uri(),
            unsatisfied_claims,
        }]),
    )
}

fn finish_request(route: &str, method: &str, started: Instant, status: StatusCode) {
    let latency_ms = started.elapsed().as_millis() as u64;
    tracing::Span::current().record("latency_ms", latency_ms);
    tracing::Span::current().record(
        "outcome",
        if status.is_success() { "success" } else { "error" },
    );
    crate::metrics::observe_http_request(route, method, status.as_u16(), started.elapsed());
}

fn status_of<T>(result: &Result<T, ApiError>, ok: StatusCode) -> StatusCode {
    match result {
        Ok(_) => ok,
        Err((status, _)) => *status,
    }
}
