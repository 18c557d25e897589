use std::collections::HashSet;
use std::sync::Arc;

use airlock_contracts::{ClaimEvaluationResult, ClaimFailure, ClaimsDeclaration};

use crate::registry::{ClaimPredicate, PolicyContext, PredicateRegistry};
use crate::schema::{self, ClaimEntry, ClaimSpec, ValidationOutcome};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrecheckError {
    Schema(ValidationOutcome),
    Unsupported(Vec<String>),
    Repeated(Vec<String>),
}

impl std::fmt::Display for PrecheckError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PrecheckError::Schema(outcome) => {
                write!(f, "SCHEMA_VIOLATION: {}", outcome.summary())
            }
            PrecheckError::Unsupported(names) => write!(
                f,
                "UNSUPPORTED_CLAIM_TYPE: ({}) is not implemented",
                names.join(", ")
            ),
            PrecheckError::Repeated(names) => write!(
                f,
                "SCHEMA_VIOLATION: ({}) may be declared only once",
                names.join(", ")
            ),
        }
    }
}

impl std::error::Error for PrecheckError {}

enum Step {
    Passed,
    Unsatisfied,
    Unsupported(String),
    Exception { claim_type: String, detail: String },
}

/// Evaluates declared claims in order against registered predicates.
#[derive(Debug, Clone)]
pub struct ClaimEvaluationEngine {
    registry: Arc<PredicateRegistry>,
}

impl ClaimEvaluationEngine {
    pub fn new(registry: Arc<PredicateRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &PredicateRegistry {
        &self.registry
    }

    /// Schema validation plus name resolution, without running any
    /// predicate. Used before a policy is issued.
    pub fn precheck(&self, declaration: &ClaimsDeclaration) -> Result<(), PrecheckError> {
        let entries = schema::parse_entries(declaration).map_err(PrecheckError::Schema)?;

        let unsupported = entries
            .iter()
            .flat_map(|entry| entry.claim_types())
            .filter(|name| !self.registry.contains(name))
            .map(str::to_string)
            .collect::<Vec<_>>();
        if !unsupported.is_empty() {
            return Err(PrecheckError::Unsupported(unsupported));
        }

        let repeated = self.repeated_side_effects(&entries);
        if !repeated.is_empty() {
            return Err(PrecheckError::Repeated(repeated));
        }
        Ok(())
    }

    pub async fn evaluate(
        &self,
        policy_id: &str,
        declaration: &ClaimsDeclaration,
    ) -> ClaimEvaluationResult {
        let entries = match schema::parse_entries(declaration) {
            Ok(entries) => entries,
            Err(outcome) => {
                tracing::info!(
                    policy_id,
                    violations = outcome.violations.len(),
                    "claims declaration failed schema validation"
                );
                return ClaimEvaluationResult {
                    is_valid: false,
                    has_exception: false,
                    message: Some(format!("SCHEMA_VIOLATION: {}", outcome.summary())),
                    failure: Some(ClaimFailure::SchemaViolation),
                    unsatisfied_claims: Vec::new(),
                    last_evaluated_index: 0,
                };
            }
        };

        // Side-effecting claims run last, once every read-only claim passed.
        let mut deferred = Vec::new();
        for (idx, entry) in entries.iter().enumerate() {
            for (spec, group) in claims_of(entry) {
                let predicate = match self.registry.resolve(&spec.name) {
                    Ok(predicate) => predicate,
                    Err(_) => {
                        tracing::warn!(policy_id, claim_type = %spec.name, "unsupported claim type declared");
                        return denied(&entries, idx, Step::Unsupported(spec.name.clone()));
                    }
                };
                if predicate.has_side_effects() {
                    deferred.push((idx, spec, group, predicate));
                    continue;
                }
                let step = check_claim(policy_id, spec, group, predicate).await;
                if !matches!(step, Step::Passed) {
                    return denied(&entries, idx, step);
                }
            }
        }

        for (idx, spec, group, predicate) in deferred {
            let step = check_claim(policy_id, spec, group, predicate).await;
            if !matches!(step, Step::Passed) {
                return denied(&entries, idx, step);
            }
        }

        ClaimEvaluationResult {
            is_valid: true,
            has_exception: false,
            message: None,
            failure: None,
            unsatisfied_claims: Vec::new(),
            last_evaluated_index: entries.len(),
        }
    }

    /// Side-effecting claim types declared more than once, top level and
    /// group members alike.
    fn repeated_side_effects(&self, entries: &[ClaimEntry]) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut repeated: Vec<String> = Vec::new();
        for name in entries.iter().flat_map(|entry| entry.claim_types()) {
            let side_effecting = self
                .registry
                .resolve(name)
                .is_ok_and(|predicate| predicate.has_side_effects());
            if side_effecting && !seen.insert(name) && !repeated.iter().any(|r| r == name) {
                repeated.push(name.to_string());
            }
        }
        repeated
    }
}

fn claims_of(entry: &ClaimEntry) -> Vec<(&ClaimSpec, Option<&str>)> {
    match entry {
        ClaimEntry::Leaf(spec) => vec![(spec, None)],
        ClaimEntry::Group { name, members } => members
            .iter()
            .map(|member| (member, Some(name.as_str())))
            .collect(),
    }
}

async fn check_claim(
    policy_id: &str,
    spec: &ClaimSpec,
    group: Option<&str>,
    predicate: Arc<dyn ClaimPredicate>,
) -> Step {
    let ctx = PolicyContext {
        policy_id: policy_id.to_string(),
        claim_type: spec.name.clone(),
        group: group.map(str::to_string),
        params: spec.params.clone(),
    };

    // Own task so a panicking predicate surfaces as a JoinError.
    let outcome = tokio::spawn(async move { predicate.check(&ctx).await }).await;

    match outcome {
        Ok(Ok(true)) => Step::Passed,
        Ok(Ok(false)) => Step::Unsatisfied,
        Ok(Err(err)) => {
            tracing::error!(policy_id, claim_type = %spec.name, error = %err, "claim predicate failed");
            Step::Exception {
                claim_type: spec.name.clone(),
                detail: err.to_string(),
            }
        }
        Err(join_err) => {
            tracing::error!(policy_id, claim_type = %spec.name, error = %join_err, "claim predicate aborted");
            Step::Exception {
                claim_type: spec.name.clone(),
                detail: "predicate aborted".to_string(),
            }
        }
    }
}

fn denied(entries: &[ClaimEntry], idx: usize, step: Step) -> ClaimEvaluationResult {
    let unsatisfied_claims = entries[idx..]
        .iter()
        .map(|entry| entry.name().to_string())
        .collect::<Vec<_>>();

    let (has_exception, message, failure) = match step {
        Step::Unsatisfied | Step::Passed => (false, None, ClaimFailure::Unsatisfied),
        Step::Unsupported(name) => (
            true,
            Some(format!("UNSUPPORTED_CLAIM_TYPE: ({}) is not implemented", name)),
            ClaimFailure::UnsupportedClaimType,
        ),
        Step::Exception { claim_type, detail } => (
            true,
            Some(format!(
                "UNKNOWN_EXCEPTION: ({}) validation failed: {}",
                claim_type, detail
            )),
            ClaimFailure::UnknownException,
        ),
    };

    ClaimEvaluationResult {
        is_valid: false,
        has_exception,
        message,
        failure: Some(failure),
        unsatisfied_claims,
        last_evaluated_index: idx,
    }
}
