use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

pub mod canonical;
pub mod claims;
pub mod encoding;

pub use claims::{ClaimsDeclaration, DecodeClaimsError};

pub const ALGO_AES_256_GCM: &str = "AES-256-GCM";
pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;
pub const KEY_LEN: usize = 32;

/// Event names dispatched on the notification bus.
pub mod events {
    pub const APP_INITIALIZED: &str = "evt.system.app_initialized";
    pub const OBJECT_CREATED: &str = "evt.object.created";
    pub const POLICY_SIGNATURE_VALIDATION_FAILURE: &str =
        "evt.policy.signature.validation_failure";
    pub const POLICY_CLAIMS_VALIDATION_FAILURE: &str = "evt.policy.claims.validation_failure";
    pub const REQUEST_REJECTED: &str = "evt.request.rejected";
    pub const INTERNAL_ERROR: &str = "evt.system.internal_error";
}

pub fn rfc3339_now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClaimFailure {
    SchemaViolation,
    Unsatisfied,
    UnsupportedClaimType,
    UnknownException,
}

impl ClaimFailure {
    pub fn as_str(self) -> &'static str {
        match self {
            ClaimFailure::SchemaViolation => "SCHEMA_VIOLATION",
            ClaimFailure::Unsatisfied => "UNSATISFIED",
            ClaimFailure::UnsupportedClaimType => "UNSUPPORTED_CLAIM_TYPE",
            ClaimFailure::UnknownException => "UNKNOWN_EXCEPTION",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimEvaluationResult {
    pub is_valid: bool,
    pub has_exception: bool,
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<ClaimFailure>,
    pub unsatisfied_claims: Vec<String>,
    pub last_evaluated_index: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectEnvelope {
    pub key_id: String,
    #[serde(with = "encoding::base64_bytes")]
    pub ciphertext: Vec<u8>,
    #[serde(with = "encoding::base64_array")]
    pub iv: [u8; NONCE_LEN],
    #[serde(with = "encoding::base64_array")]
    pub auth_tag: [u8; TAG_LEN],
    pub algo: String,
    pub format_version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventHeader {
    pub id: String,
    pub timestamp: String,
    pub name: String,
    pub meta: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemEvent {
    pub header: EventHeader,
    pub payload: serde_json::Value,
}

impl SystemEvent {
    pub fn new(
        name: impl Into<String>,
        payload: serde_json::Value,
        meta: serde_json::Value,
    ) -> Self {
        let meta = if meta.is_null() {
            serde_json::json!({})
        } else {
            meta
        };

        Self {
            header: EventHeader {
                id: Ulid::new().to_string(),
                timestamp: rfc3339_now(),
                name: name.into(),
                meta,
            },
            payload,
        }
    }

    pub fn name(&self) -> &str {
        self.header.name.as_str()
    }

    pub fn instance_uri(&self) -> String {
        format!("/events/{}", self.header.id)
    }
}

/// Problem-details object (RFC 7807 shaped); always sent inside a JSON array.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Problem {
    #[serde(rename = "type")]
    pub problem_type: String,
    pub title: String,
    pub detail: String,
    pub instance: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unsatisfied_claims: Option<Vec<String>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope() -> ObjectEnvelope {
        ObjectEnvelope {
            key_id: "01J00000000000000000000000".to_string(),
            ciphertext: vec![1, 2, 3],
            iv: [7u8; NONCE_LEN],
            auth_tag: [9u8; TAG_LEN],
            algo: ALGO_AES_256_GCM.to_string(),
            format_version: "1".to_string(),
        }
    }

    #[test]
    fn envelope_wire_form_uses_camel_case_and_base64() {
        let value = serde_json::to_value(envelope()).expect("envelope must serialize");
        assert_eq!(value["keyId"], "01J00000000000000000000000");
        assert_eq!(value["ciphertext"], "AQID");
        assert_eq!(value["algo"], "AES-256-GCM");
        assert_eq!(value["formatVersion"], "1");
        assert!(value.get("authTag").is_some_and(|v| v.is_string()));
        assert!(value.get("key").is_none());
    }

    #[test]
    fn envelope_rejects_wrong_nonce_length() {
        let mut value = serde_json::to_value(envelope()).expect("envelope must serialize");
        value["iv"] = serde_json::Value::String(encoding::encode_base64([0u8; 8]));
        let err = serde_json::from_value::<ObjectEnvelope>(value).unwrap_err();
        assert!(err.to_string().contains("expected 12 bytes"));
    }

    #[test]
    fn system_event_defaults_meta_and_builds_instance_uri() {
        let event = SystemEvent::new(
            events::POLICY_CLAIMS_VALIDATION_FAILURE,
            serde_json::json!({"policy": "p"}),
            serde_json::Value::Null,
        );
        assert_eq!(event.name(), "evt.policy.claims.validation_failure");
        assert_eq!(event.header.meta, serde_json::json!({}));
        assert_eq!(event.instance_uri(), format!("/events/{}", event.header.id));
        assert!(event.header.timestamp.ends_with('Z'));
    }

    #[test]
    fn problem_serializes_type_and_optional_claims() {
        let problem = Problem {
            problem_type: "/probs/policy-claim-verification".to_string(),
            title: "t".to_string(),
            detail: "d".to_string(),
            instance: "/events/x".to_string(),
            unsatisfied_claims: Some(vec!["max_uses".to_string()]),
        };
        let value = serde_json::to_value(&problem).expect("problem must serialize");
        assert_eq!(value["type"], "/probs/policy-claim-verification");
        assert_eq!(value["unsatisfiedClaims"], serde_json::json!(["max_uses"]));

        let bare = Problem {
            unsatisfied_claims: None,
            ..problem
        };
        let value = serde_json::to_value(&bare).expect("problem must serialize");
        assert!(value.get("unsatisfiedClaims").is_none());
    }
}
