use std::sync::Arc;
use std::time::Duration;

use airlock_contracts::encoding::{decode_base64, encode_base64};
use airlock_contracts::{ClaimsDeclaration, rfc3339_now};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::RngCore;
use rand::rngs::OsRng;
use ulid::Ulid;

use crate::LedgerError;
use crate::pool::CryptoPool;
use crate::store::{RecordStore, timed};

pub const POLICIES: &str = "policies";

/// Key material the ledger was started with. A verify-only ledger cannot
/// issue policies.
#[derive(Clone)]
pub enum PolicyKeys {
    Signing(SigningKey),
    VerifyOnly(VerifyingKey),
}

impl PolicyKeys {
    /// 32-byte Ed25519 seed, hex encoded.
    pub fn from_seed_hex(seed_hex: &str) -> Result<Self, LedgerError> {
        let bytes = hex::decode(seed_hex.trim())
            .map_err(|_| LedgerError::InvalidKey("signing key must be hex".to_string()))?;
        let seed: [u8; 32] = bytes.try_into().map_err(|_| {
            LedgerError::InvalidKey("signing key must be 32 bytes".to_string())
        })?;
        Ok(PolicyKeys::Signing(SigningKey::from_bytes(&seed)))
    }

    pub fn verify_only_hex(public_hex: &str) -> Result<Self, LedgerError> {
        let bytes = hex::decode(public_hex.trim())
            .map_err(|_| LedgerError::InvalidKey("verifying key must be hex".to_string()))?;
        let public: [u8; 32] = bytes.try_into().map_err(|_| {
            LedgerError::InvalidKey("verifying key must be 32 bytes".to_string())
        })?;
        let key = VerifyingKey::from_bytes(&public)
            .map_err(|_| LedgerError::InvalidKey("verifying key is not a curve point".to_string()))?;
        Ok(PolicyKeys::VerifyOnly(key))
    }

    pub fn generate() -> Self {
        let mut seed = [0u8; 32];
        OsRng.fill_bytes(&mut seed);
        PolicyKeys::Signing(SigningKey::from_bytes(&seed))
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        match self {
            PolicyKeys::Signing(key) => key.verifying_key(),
            PolicyKeys::VerifyOnly(key) => *key,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationReason {
    Verified,
    SignatureMismatch,
    MalformedSignature,
    NotFound,
    StoreUnavailable,
}

impl VerificationReason {
    pub fn as_str(self) -> &'static str {
        match self {
            VerificationReason::Verified => "verified",
            VerificationReason::SignatureMismatch => "signature_mismatch",
            VerificationReason::MalformedSignature => "malformed_signature",
            VerificationReason::NotFound => "not_found",
            VerificationReason::StoreUnavailable => "store_unavailable",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyVerification {
    pub is_valid: bool,
    pub stored_signature: Option<String>,
    pub reason: VerificationReason,
}

impl PolicyVerification {
    fn rejected(reason: VerificationReason, stored_signature: Option<String>) -> Self {
        Self {
            is_valid: false,
            stored_signature,
            reason,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedPolicy {
    pub policy_id: String,
    pub signature: String,
    pub created_at: String,
}

#[derive(Clone)]
pub struct PolicyLedger {
    store: Arc<dyn RecordStore>,
    pool: CryptoPool,
    signing_key: Option<Arc<SigningKey>>,
    verifying_key: VerifyingKey,
    store_timeout: Duration,
}

impl PolicyLedger {
    pub fn new(
        store: Arc<dyn RecordStore>,
        pool: CryptoPool,
        keys: PolicyKeys,
        store_timeout: Duration,
    ) -> Self {
        let verifying_key = keys.verifying_key();
        let signing_key = match keys {
            PolicyKeys::Signing(key) => Some(Arc::new(key)),
            PolicyKeys::VerifyOnly(_) => None,
        };

        Self {
            store,
            pool,
            signing_key,
            verifying_key,
            store_timeout,
        }
    }

    pub fn key_fingerprint(&self) -> String {
        hex::encode(self.verifying_key.to_bytes())
    }

    pub fn can_issue(&self) -> bool {
        self.signing_key.is_some()
    }

    /// Signs the claims in their declared order and persists the policy
    /// under a fresh id.
    pub async fn issue(&self, declaration: &ClaimsDeclaration) -> Result<IssuedPolicy, LedgerError> {
        let Some(signing_key) = self.signing_key.clone() else {
            return Err(LedgerError::Signing(
                "ledger was started without a signing key".to_string(),
            ));
        };

        let canonical = declaration.canonical_string();
        let message = declaration.signing_bytes();
        let signature = self
            .pool
            .run(move || signing_key.sign(&message).to_bytes())
            .await
            .map_err(|err| LedgerError::Signing(err.to_string()))?;

        let policy_id = Ulid::new().to_string();
        let signature = encode_base64(signature);
        let created_at = rfc3339_now();
        let body = serde_json::json!({
            "signature": signature,
            "claims": canonical,
            "digest": declaration.digest(),
            "verifying_key": self.key_fingerprint(),
            "created_at": created_at,
        });

        timed(
            self.store_timeout,
            self.store.insert(POLICIES, &policy_id, body),
        )
        .await?;

        tracing::info!(policy_id = %policy_id, "policy issued");
        Ok(IssuedPolicy {
            policy_id,
            signature,
            created_at,
        })
    }

    /// Checks the presented claims against the stored signature. Never
    /// fails; every negative outcome carries a reason.
    pub async fn verify(&self, policy_id: &str, declaration: &ClaimsDeclaration) -> PolicyVerification {
        let record = match timed(
            self.store_timeout,
            self.store.select_by_id(POLICIES, policy_id),
        )
        .await
        {
            Ok(Some(record)) => record,
            Ok(None) => return PolicyVerification::rejected(VerificationReason::NotFound, None),
            Err(err) => {
                tracing::warn!(policy_id, error = %err, "policy lookup failed");
                return PolicyVerification::rejected(VerificationReason::StoreUnavailable, None);
            }
        };

        let Some(stored_signature) = record
            .body
            .get("signature")
            .and_then(|v| v.as_str())
            .map(str::to_string)
        else {
            return PolicyVerification::rejected(VerificationReason::MalformedSignature, None);
        };

        let signature = match decode_base64(&stored_signature)
            .ok()
            .and_then(|bytes| Signature::from_slice(&bytes).ok())
        {
            Some(signature) => signature,
            None => {
                return PolicyVerification::rejected(
                    VerificationReason::MalformedSignature,
                    Some(stored_signature),
                );
            }
        };

        if let Some(stored_key) = record.body.get("verifying_key").and_then(|v| v.as_str())
            && stored_key != self.key_fingerprint()
        {
            tracing::warn!(policy_id, "policy was issued under a different key");
        }

        // Digest first: a mismatch is rejected without a pool round trip.
        if let Some(digest) = record.body.get("digest").and_then(|v| v.as_str())
            && digest != declaration.digest()
        {
            tracing::info!(policy_id, "presented claims do not match the stored digest");
            return PolicyVerification::rejected(
                VerificationReason::SignatureMismatch,
                Some(stored_signature),
            );
        }

        let verifying_key = self.verifying_key;
        let message = declaration.signing_bytes();
        let verified = self
            .pool
            .run(move || verifying_key.verify_strict(&message, &signature).is_ok())
            .await;

        match verified {
            Ok(true) => PolicyVerification {
                is_valid: true,
                stored_signature: Some(stored_signature),
                reason: VerificationReason::Verified,
            },
            Ok(false) => PolicyVerification::rejected(
                VerificationReason::SignatureMismatch,
                Some(stored_signature),
            ),
            Err(err) => {
                tracing::error!(policy_id, error = %err, "signature verification did not run");
                PolicyVerification::rejected(
                    VerificationReason::SignatureMismatch,
                    Some(stored_signature),
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryRecordStore, Record};

    /// Never answers within any test budget.
    struct StalledStore;

    #[async_trait::async_trait]
    impl RecordStore for StalledStore {
        async fn insert(&self, _: &str, _: &str, _: serde_json::Value) -> Result<Record, LedgerError> {
            stall().await
        }

        async fn select_by_id(&self, _: &str, _: &str) -> Result<Option<Record>, LedgerError> {
            stall().await
        }

        async fn select_by_filter(
            &self,
            _: &str,
            _: &str,
            _: &serde_json::Value,
        ) -> Result<Vec<Record>, LedgerError> {
            stall().await
        }

        async fn compare_and_swap(
            &self,
            _: &str,
            _: &str,
            _: i64,
            _: serde_json::Value,
        ) -> Result<Option<Record>, LedgerError> {
            stall().await
        }

        async fn ping(&self) -> Result<(), LedgerError> {
            stall().await
        }
    }

    async fn stall<T>() -> Result<T, LedgerError> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Err(LedgerError::Corrupt("stalled store answered".to_string()))
    }

    fn ledger_with(store: Arc<dyn RecordStore>, keys: PolicyKeys) -> PolicyLedger {
        PolicyLedger::new(store, CryptoPool::new(2), keys, Duration::from_secs(2))
    }

    fn fixed_keys() -> PolicyKeys {
        PolicyKeys::from_seed_hex(&"07".repeat(32)).expect("fixture seed is valid")
    }

    fn decl(value: serde_json::Value) -> ClaimsDeclaration {
        ClaimsDeclaration::new(value)
    }

    #[tokio::test]
    async fn issued_policies_verify_only_in_declared_order() {
        let store = Arc::new(MemoryRecordStore::new());
        let ledger = ledger_with(store.clone(), fixed_keys());

        let written: ClaimsDeclaration = serde_json::from_str(
            r#"{"not_after":{"timestamp":"2999-01-01T00:00:00Z"},"max_uses":{"limit":3}}"#,
        )
        .expect("fixture must parse");
        let issued = ledger.issue(&written).await.expect("issue succeeds");

        let verification = ledger.verify(&issued.policy_id, &written).await;
        assert!(verification.is_valid);
        assert_eq!(verification.reason, VerificationReason::Verified);
        assert_eq!(verification.stored_signature, Some(issued.signature.clone()));

        let reordered = decl(serde_json::json!({
            "max_uses": {"limit": 3},
            "not_after": {"timestamp": "2999-01-01T00:00:00Z"},
        }));
        let verification = ledger.verify(&issued.policy_id, &reordered).await;
        assert!(!verification.is_valid);
        assert_eq!(verification.reason, VerificationReason::SignatureMismatch);

        let stored = store
            .select_by_id(POLICIES, &issued.policy_id)
            .await
            .expect("select succeeds")
            .expect("policy stored");
        assert_eq!(
            stored.body["claims"],
            r#"{"max_uses":{"limit":3},"not_after":{"timestamp":"2999-01-01T00:00:00Z"}}"#
        );
        assert_eq!(stored.body["digest"], written.digest());
        assert_eq!(stored.body["verifying_key"], ledger.key_fingerprint());
    }

    #[tokio::test]
    async fn signature_alone_rejects_reordered_claims() {
        let store = Arc::new(MemoryRecordStore::new());
        let ledger = ledger_with(store.clone(), fixed_keys());
        let written: ClaimsDeclaration =
            serde_json::from_str(r#"{"b":{},"a":{}}"#).expect("fixture must parse");
        let issued = ledger.issue(&written).await.expect("issue succeeds");

        // Records written without a digest fall back to the signature.
        let record = store
            .select_by_id(POLICIES, &issued.policy_id)
            .await
            .expect("select succeeds")
            .expect("policy stored");
        let mut body = record.body.clone();
        body.as_object_mut()
            .expect("policy body is an object")
            .remove("digest");
        store
            .compare_and_swap(POLICIES, &issued.policy_id, record.version, body)
            .await
            .expect("cas succeeds")
            .expect("version matched");

        assert!(ledger.verify(&issued.policy_id, &written).await.is_valid);
        let reordered: ClaimsDeclaration =
            serde_json::from_str(r#"{"a":{},"b":{}}"#).expect("fixture must parse");
        let verification = ledger.verify(&issued.policy_id, &reordered).await;
        assert_eq!(verification.reason, VerificationReason::SignatureMismatch);
    }

    #[tokio::test]
    async fn stalled_store_is_reported_as_unavailable() {
        let ledger = PolicyLedger::new(
            Arc::new(StalledStore),
            CryptoPool::new(1),
            fixed_keys(),
            Duration::from_millis(20),
        );
        let claims = decl(serde_json::json!({"max_uses": {"limit": 1}}));

        let err = ledger.issue(&claims).await.unwrap_err();
        assert!(matches!(err, LedgerError::Timeout));
        assert!(err.is_persistence());

        let verification = ledger.verify("01ANYPOLICY", &claims).await;
        assert!(!verification.is_valid);
        assert_eq!(verification.reason, VerificationReason::StoreUnavailable);
        assert_eq!(verification.stored_signature, None);
    }

    #[tokio::test]
    async fn altered_claims_fail_verification() {
        let ledger = ledger_with(Arc::new(MemoryRecordStore::new()), fixed_keys());
        let issued = ledger
            .issue(&decl(serde_json::json!({"max_uses": {"limit": 1}})))
            .await
            .expect("issue succeeds");

        let verification = ledger
            .verify(
                &issued.policy_id,
                &decl(serde_json::json!({"max_uses": {"limit": 100}})),
            )
            .await;
        assert!(!verification.is_valid);
        assert_eq!(verification.reason, VerificationReason::SignatureMismatch);
    }

    #[tokio::test]
    async fn tampered_or_missing_signatures_are_rejected() {
        let store = Arc::new(MemoryRecordStore::new());
        let ledger = ledger_with(store.clone(), fixed_keys());
        let claims = decl(serde_json::json!({"max_uses": {"limit": 1}}));
        let issued = ledger.issue(&claims).await.expect("issue succeeds");

        let record = store
            .select_by_id(POLICIES, &issued.policy_id)
            .await
            .expect("select succeeds")
            .expect("policy stored");
        let mut body = record.body.clone();
        body["signature"] = serde_json::json!(encode_base64([0u8; 64]));
        store
            .compare_and_swap(POLICIES, &issued.policy_id, record.version, body.clone())
            .await
            .expect("cas succeeds")
            .expect("version matched");
        let verification = ledger.verify(&issued.policy_id, &claims).await;
        assert_eq!(verification.reason, VerificationReason::SignatureMismatch);

        body["signature"] = serde_json::json!("not base64!");
        store
            .compare_and_swap(POLICIES, &issued.policy_id, record.version + 1, body)
            .await
            .expect("cas succeeds")
            .expect("version matched");
        let verification = ledger.verify(&issued.policy_id, &claims).await;
        assert_eq!(verification.reason, VerificationReason::MalformedSignature);

        let verification = ledger.verify("01UNKNOWNPOLICY", &claims).await;
        assert_eq!(verification.reason, VerificationReason::NotFound);
        assert_eq!(verification.stored_signature, None);
    }

    #[tokio::test]
    async fn verify_only_ledgers_refuse_to_issue() {
        let signing = fixed_keys();
        let public_hex = hex::encode(signing.verifying_key().to_bytes());
        let store: Arc<dyn RecordStore> = Arc::new(MemoryRecordStore::new());

        let issuer = ledger_with(store.clone(), signing);
        let verifier = ledger_with(
            store,
            PolicyKeys::verify_only_hex(&public_hex).expect("public key parses"),
        );
        assert!(!verifier.can_issue());

        let claims = decl(serde_json::json!({"not_before": {"timestamp": "2020-01-01T00:00:00Z"}}));
        let err = verifier.issue(&claims).await.unwrap_err();
        assert!(matches!(err, LedgerError::Signing(_)));

        let issued = issuer.issue(&claims).await.expect("issue succeeds");
        assert!(verifier.verify(&issued.policy_id, &claims).await.is_valid);
    }

    #[test]
    fn key_parsing_rejects_bad_material() {
        assert!(matches!(
            PolicyKeys::from_seed_hex("zz"),
            Err(LedgerError::InvalidKey(_))
        ));
        assert!(matches!(
            PolicyKeys::from_seed_hex(&"07".repeat(16)),
            Err(LedgerError::InvalidKey(_))
        ));
        assert!(matches!(
            PolicyKeys::verify_only_hex(&"00".repeat(31)),
            Err(LedgerError::InvalidKey(_))
        ));
    }
}
