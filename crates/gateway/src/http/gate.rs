use airlock_contracts::{ClaimFailure, ClaimsDeclaration};
use airlock_envelope::KeyBinding;
use airlock_ledger::VerificationReason;
use axum::http::HeaderMap;

use super::{
    ApiError, AppState, CLAIMS_HEADER, FORMAT_HEADER, POLICY_HEADER, ProblemKind, problem,
    problem_with_claims,
};

#[derive(Debug, Clone)]
pub(super) struct PolicyHeaders {
    pub(super) policy_id: String,
    pub(super) claims: ClaimsDeclaration,
}

#[derive(Debug, Clone)]
pub(super) struct AccessGrant {
    pub(super) policy_id: String,
    pub(super) binding: KeyBinding,
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

pub(super) fn read_policy_headers(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<PolicyHeaders, ApiError> {
    let rejected = |detail: String| {
        problem(
            state,
            ProblemKind::InvalidRequest,
            detail,
            serde_json::Value::Null,
        )
    };

    let policy_id = header_str(headers, POLICY_HEADER)
        .ok_or_else(|| rejected(format!("missing {} header", POLICY_HEADER)))?
        .to_string();

    let encoded = header_str(headers, CLAIMS_HEADER)
        .ok_or_else(|| rejected(format!("missing {} header", CLAIMS_HEADER)))?;
    let claims =
        ClaimsDeclaration::from_base64_json(encoded).map_err(|err| rejected(err.to_string()))?;

    if let Some(format) = header_str(headers, FORMAT_HEADER)
        && format != state.envelopes.format_version()
    {
        return Err(rejected(format!(
            "unsupported object format {}; this gateway serves {}",
            format,
            state.envelopes.format_version()
        )));
    }

    Ok(PolicyHeaders { policy_id, claims })
}

/// A request that passed every gate except claim evaluation.
#[derive(Debug)]
pub(super) struct Admission {
    policy_id: String,
    claims: ClaimsDeclaration,
    key_id: String,
    binding: KeyBinding,
}

/// Authenticity, key existence, then authorization. Every step that fails
/// publishes its denial event and stops; only a full pass consumes uses.
pub(super) async fn authorize(
    state: &AppState,
    route: &'static str,
    headers: &HeaderMap,
    key_id: &str,
) -> Result<AccessGrant, ApiError> {
    let decision = match admit(state, headers, key_id).await {
        Ok(admission) => grant(state, admission).await,
        Err(err) => Err(err),
    };
    record_decision(route, &decision);
    decision
}

pub(super) fn record_decision<T>(route: &'static str, decision: &Result<T, ApiError>) {
    crate::metrics::observe_access_decision(
        route,
        match decision {
            Ok(_) => "granted",
            Err((status, _)) => status.as_str(),
        },
    );
}

/// Headers, authenticity, key existence and key binding. Runs no claim
/// predicate, so nothing is consumed here.
pub(super) async fn admit(
    state: &AppState,
    headers: &HeaderMap,
    key_id: &str,
) -> Result<Admission, ApiError> {
    let PolicyHeaders { policy_id, claims } = read_policy_headers(state, headers)?;
    tracing::Span::current().record("policy_id", policy_id.as_str());

    let verification = state.ledger.verify(&policy_id, &claims).await;
    if !verification.is_valid {
        let payload = serde_json::json!({
            "policyId": policy_id,
            "keyId": key_id,
            "reason": verification.reason.as_str(),
        });
        return Err(match verification.reason {
            VerificationReason::StoreUnavailable => problem(
                state,
                ProblemKind::StoreUnavailable,
                "the policy ledger could not be reached",
                payload,
            ),
            _ => problem(
                state,
                ProblemKind::PolicyValidation,
                "the presented policy and claims do not match a trusted signature",
                payload,
            ),
        });
    }

    let binding = match state.envelopes.key_binding(key_id).await {
        Ok(Some(binding)) => binding,
        Ok(None) => {
            return Err(problem(
                state,
                ProblemKind::KeyNotFound,
                format!("no key is stored under {}", key_id),
                serde_json::json!({ "policyId": policy_id, "keyId": key_id }),
            ));
        }
        Err(err) => {
            tracing::warn!(key_id, error = %err, "key lookup failed");
            return Err(problem(
                state,
                ProblemKind::StoreUnavailable,
                "the key store could not be reached",
                serde_json::json!({ "policyId": policy_id, "keyId": key_id }),
            ));
        }
    };

    if let Some(bound) = binding.policy_id.as_deref()
        && bound != policy_id
    {
        return Err(problem(
            state,
            ProblemKind::PolicyValidation,
            "the presented policy does not govern this key",
            serde_json::json!({
                "policyId": policy_id,
                "keyId": key_id,
                "reason": "policy_key_mismatch",
            }),
        ));
    }

    Ok(Admission {
        policy_id,
        claims,
        key_id: key_id.to_string(),
        binding,
    })
}

/// Evaluates the admitted claims; a pass may consume uses.
pub(super) async fn grant(state: &AppState, admission: Admission) -> Result<AccessGrant, ApiError> {
    let Admission {
        policy_id,
        claims,
        key_id,
        binding,
    } = admission;

    let evaluation = state.engine.evaluate(&policy_id, &claims).await;
    if !evaluation.is_valid {
        let detail = match evaluation.failure {
            Some(ClaimFailure::UnknownException) => {
                "a claim could not be evaluated; access is denied".to_string()
            }
            _ => evaluation
                .message
                .clone()
                .unwrap_or_else(|| "claims are not satisfied".to_string()),
        };
        return Err(problem_with_claims(
            state,
            ProblemKind::ClaimVerification,
            detail,
            serde_json::json!({
                "policyId": policy_id,
                "keyId": key_id,
                "failure": evaluation.failure.map(|f| f.as_str()),
                "message": &evaluation.message,
                "unsatisfiedClaims": &evaluation.unsatisfied_claims,
            }),
            Some(evaluation.unsatisfied_claims.clone()),
        ));
    }

    Ok(AccessGrant { policy_id, binding })
}
