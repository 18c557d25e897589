use std::sync::Arc;
use std::time::Duration;

use airlock_contracts::encoding::{decode_base64, encode_base64};
use airlock_contracts::{ALGO_AES_256_GCM, KEY_LEN, NONCE_LEN, ObjectEnvelope, TAG_LEN, rfc3339_now};
use airlock_ledger::store::timed;
use airlock_ledger::{CryptoPool, LedgerError, RecordStore};
use rand::RngCore;
use rand::rngs::OsRng;
use ring::aead::{self, Aad, LessSafeKey, Nonce, UnboundKey};
use ulid::Ulid;

pub const KEYS: &str = "keys";

#[derive(Debug)]
pub enum EnvelopeError {
    Encryption(String),
    Integrity,
    KeyNotFound(String),
    UnsupportedFormat(String),
    Persistence(LedgerError),
}

impl std::fmt::Display for EnvelopeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EnvelopeError::Encryption(msg) => write!(f, "encryption failed: {}", msg),
            EnvelopeError::Integrity => write!(f, "ciphertext failed authentication"),
            EnvelopeError::KeyNotFound(key_id) => write!(f, "no key stored for {}", key_id),
            EnvelopeError::UnsupportedFormat(algo) => write!(f, "unsupported algorithm: {}", algo),
            EnvelopeError::Persistence(err) => write!(f, "key persistence failed: {}", err),
        }
    }
}

impl std::error::Error for EnvelopeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EnvelopeError::Persistence(err) => Some(err),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyBinding {
    pub key_id: String,
    pub algo: String,
    pub policy_id: Option<String>,
}

struct Sealed {
    key: [u8; KEY_LEN],
    nonce: [u8; NONCE_LEN],
    ciphertext: Vec<u8>,
    tag: [u8; TAG_LEN],
}

/// Logs a key id whose insert was in flight when the sealing future went
/// away. The store may hold a key no caller ever learned about.
struct OrphanGuard {
    key_id: Option<String>,
}

impl OrphanGuard {
    fn armed(key_id: &str) -> Self {
        Self {
            key_id: Some(key_id.to_string()),
        }
    }

    fn disarm(&mut self) {
        self.key_id = None;
    }
}

impl Drop for OrphanGuard {
    fn drop(&mut self) {
        if let Some(key_id) = self.key_id.take() {
            tracing::warn!(key_id = %key_id, "seal abandoned during key persistence; key may be orphaned");
        }
    }
}

/// Per-object envelope encryption: one fresh AES-256-GCM key per payload,
/// stored by id; the key never travels with the envelope.
#[derive(Clone)]
pub struct EnvelopeService {
    store: Arc<dyn RecordStore>,
    pool: CryptoPool,
    store_timeout: Duration,
    format_version: String,
}

impl EnvelopeService {
    pub fn new(
        store: Arc<dyn RecordStore>,
        pool: CryptoPool,
        store_timeout: Duration,
        format_version: impl Into<String>,
    ) -> Self {
        Self {
            store,
            pool,
            store_timeout,
            format_version: format_version.into(),
        }
    }

    pub fn format_version(&self) -> &str {
        self.format_version.as_str()
    }

    pub async fn seal(&self, payload: &[u8]) -> Result<ObjectEnvelope, EnvelopeError> {
        self.seal_inner(payload, None).await
    }

    /// Seals `payload` and records which policy governs its key.
    pub async fn seal_for_policy(
        &self,
        payload: &[u8],
        policy_id: &str,
    ) -> Result<ObjectEnvelope, EnvelopeError> {
        self.seal_inner(payload, Some(policy_id)).await
    }

    async fn seal_inner(
        &self,
        payload: &[u8],
        policy_id: Option<&str>,
    ) -> Result<ObjectEnvelope, EnvelopeError> {
        if payload.is_empty() {
            return Err(EnvelopeError::Encryption("payload is empty".to_string()));
        }

        let plaintext = payload.to_vec();
        let sealed = self
            .pool
            .run(move || seal_bytes(plaintext))
            .await
            .map_err(|err| EnvelopeError::Encryption(err.to_string()))??;

        let key_id = Ulid::new().to_string();
        let mut body = serde_json::json!({
            "key": encode_base64(sealed.key),
            "algo": ALGO_AES_256_GCM,
            "created_at": rfc3339_now(),
        });
        if let Some(policy_id) = policy_id {
            body["policy_id"] = serde_json::Value::String(policy_id.to_string());
        }

        let mut guard = OrphanGuard::armed(&key_id);
        let stored = timed(self.store_timeout, self.store.insert(KEYS, &key_id, body)).await;
        guard.disarm();
        stored.map_err(EnvelopeError::Persistence)?;

        tracing::debug!(key_id = %key_id, bytes = payload.len(), "object sealed");
        Ok(ObjectEnvelope {
            key_id,
            ciphertext: sealed.ciphertext,
            iv: sealed.nonce,
            auth_tag: sealed.tag,
            algo: ALGO_AES_256_GCM.to_string(),
            format_version: self.format_version.clone(),
        })
    }

    pub async fn open(&self, envelope: &ObjectEnvelope) -> Result<Vec<u8>, EnvelopeError> {
        if envelope.algo != ALGO_AES_256_GCM {
            return Err(EnvelopeError::UnsupportedFormat(envelope.algo.clone()));
        }

        let key = self.load_key(&envelope.key_id).await?;

        let nonce = envelope.iv;
        let mut in_out = Vec::with_capacity(envelope.ciphertext.len() + TAG_LEN);
        in_out.extend_from_slice(&envelope.ciphertext);
        in_out.extend_from_slice(&envelope.auth_tag);

        self.pool
            .run(move || open_bytes(&key, nonce, in_out))
            .await
            .map_err(|err| EnvelopeError::Encryption(err.to_string()))?
    }

    /// Key metadata without the key material; `None` for unknown ids.
    pub async fn key_binding(&self, key_id: &str) -> Result<Option<KeyBinding>, EnvelopeError> {
        let record = timed(self.store_timeout, self.store.select_by_id(KEYS, key_id))
            .await
            .map_err(EnvelopeError::Persistence)?;

        Ok(record.map(|record| KeyBinding {
            key_id: record.id,
            algo: record
                .body
                .get("algo")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            policy_id: record
                .body
                .get("policy_id")
                .and_then(|v| v.as_str())
                .map(str::to_string),
        }))
    }

    async fn load_key(&self, key_id: &str) -> Result<[u8; KEY_LEN], EnvelopeError> {
        let record = timed(self.store_timeout, self.store.select_by_id(KEYS, key_id))
            .await
            .map_err(EnvelopeError::Persistence)?
            .ok_or_else(|| EnvelopeError::KeyNotFound(key_id.to_string()))?;

        record
            .body
            .get("key")
            .and_then(|v| v.as_str())
            .and_then(|encoded| decode_base64(encoded).ok())
            .and_then(|bytes| <[u8; KEY_LEN]>::try_from(bytes).ok())
            .ok_or_else(|| {
                EnvelopeError::Persistence(LedgerError::Corrupt(format!(
                    "key record {} has no usable key",
                    key_id
                )))
            })
    }
}

fn make_cipher(key: &[u8; KEY_LEN]) -> Result<LessSafeKey, EnvelopeError> {
    let unbound = UnboundKey::new(&aead::AES_256_GCM, key)
        .map_err(|_| EnvelopeError::Encryption("cannot load AES-256-GCM key".to_string()))?;
    Ok(LessSafeKey::new(unbound))
}

fn seal_bytes(plaintext: Vec<u8>) -> Result<Sealed, EnvelopeError> {
    let mut key = [0u8; KEY_LEN];
    OsRng.fill_bytes(&mut key);
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);

    let cipher = make_cipher(&key)?;
    let mut in_out = plaintext;
    let tag = cipher
        .seal_in_place_separate_tag(Nonce::assume_unique_for_key(nonce), Aad::empty(), &mut in_out)
        .map_err(|_| EnvelopeError::Encryption("AES-256-GCM seal failed".to_string()))?;

    let mut auth_tag = [0u8; TAG_LEN];
    auth_tag.copy_from_slice(tag.as_ref());
    Ok(Sealed {
        key,
        nonce,
        ciphertext: in_out,
        tag: auth_tag,
    })
}

fn open_bytes(
    key: &[u8; KEY_LEN],
    nonce: [u8; NONCE_LEN],
    mut in_out: Vec<u8>,
) -> Result<Vec<u8>, EnvelopeError> {
    let cipher = make_cipher(key)?;
    let plain = cipher
        .open_in_place(Nonce::assume_unique_for_key(nonce), Aad::empty(), &mut in_out)
        .map_err(|_| EnvelopeError::Integrity)?;
    Ok(plain.to_vec())
}

#[cfg(test)]
mod tests {
    use airlock_ledger::MemoryRecordStore;

    use super::*;

    fn service() -> EnvelopeService {
        EnvelopeService::new(
            Arc::new(MemoryRecordStore::new()),
            CryptoPool::new(2),
            Duration::from_secs(2),
            "1",
        )
    }

    #[tokio::test]
    async fn sealed_payloads_open_to_original_bytes() {
        let svc = service();
        let envelope = svc.seal(b"launch codes").await.expect("seal succeeds");

        assert_eq!(envelope.algo, ALGO_AES_256_GCM);
        assert_eq!(envelope.format_version, "1");
        assert_ne!(envelope.ciphertext, b"launch codes".to_vec());
        assert!(
            svc.key_binding(&envelope.key_id)
                .await
                .expect("lookup succeeds")
                .is_some()
        );

        let opened = svc.open(&envelope).await.expect("open succeeds");
        assert_eq!(opened, b"launch codes".to_vec());
    }

    #[tokio::test]
    async fn single_bit_flips_fail_integrity() {
        let svc = service();
        let envelope = svc.seal(b"payload").await.expect("seal succeeds");

        let mut flipped = envelope.clone();
        flipped.ciphertext[0] ^= 0x01;
        assert!(matches!(
            svc.open(&flipped).await,
            Err(EnvelopeError::Integrity)
        ));

        let mut flipped = envelope.clone();
        flipped.auth_tag[TAG_LEN - 1] ^= 0x80;
        assert!(matches!(
            svc.open(&flipped).await,
            Err(EnvelopeError::Integrity)
        ));

        let mut flipped = envelope;
        flipped.iv[0] ^= 0x01;
        assert!(matches!(
            svc.open(&flipped).await,
            Err(EnvelopeError::Integrity)
        ));
    }

    #[tokio::test]
    async fn sealing_twice_yields_distinct_keys_and_ciphertexts() {
        let svc = service();
        let first = svc.seal(b"same bytes").await.expect("seal succeeds");
        let second = svc.seal(b"same bytes").await.expect("seal succeeds");

        assert_ne!(first.key_id, second.key_id);
        assert_ne!(first.ciphertext, second.ciphertext);
        assert_ne!(first.iv, second.iv);
    }

    #[tokio::test]
    async fn rejects_empty_payloads_unknown_keys_and_foreign_formats() {
        let svc = service();
        assert!(matches!(
            svc.seal(b"").await,
            Err(EnvelopeError::Encryption(_))
        ));

        let envelope = svc.seal(b"x").await.expect("seal succeeds");

        let mut unknown = envelope.clone();
        unknown.key_id = Ulid::new().to_string();
        assert!(matches!(
            svc.open(&unknown).await,
            Err(EnvelopeError::KeyNotFound(_))
        ));
        assert!(
            svc.key_binding(&unknown.key_id)
                .await
                .expect("lookup succeeds")
                .is_none()
        );

        let mut foreign = envelope;
        foreign.algo = "ChaCha20-Poly1305".to_string();
        assert!(matches!(
            svc.open(&foreign).await,
            Err(EnvelopeError::UnsupportedFormat(_))
        ));
    }

    #[tokio::test]
    async fn policy_bound_keys_report_their_policy() {
        let svc = service();
        let bound = svc
            .seal_for_policy(b"bound", "01POLICY")
            .await
            .expect("seal succeeds");
        let unbound = svc.seal(b"free").await.expect("seal succeeds");

        let binding = svc
            .key_binding(&bound.key_id)
            .await
            .expect("lookup succeeds")
            .expect("key exists");
        assert_eq!(binding.policy_id.as_deref(), Some("01POLICY"));
        assert_eq!(binding.algo, ALGO_AES_256_GCM);

        let binding = svc
            .key_binding(&unbound.key_id)
            .await
            .expect("lookup succeeds")
            .expect("key exists");
        assert_eq!(binding.policy_id, None);
    }

    #[tokio::test]
    async fn stored_key_records_never_leak_into_envelopes() {
        let store = Arc::new(MemoryRecordStore::new());
        let svc = EnvelopeService::new(store.clone(), CryptoPool::new(1), Duration::from_secs(2), "1");
        let envelope = svc.seal(b"secret").await.expect("seal succeeds");

        let record = store
            .select_by_id(KEYS, &envelope.key_id)
            .await
            .expect("select succeeds")
            .expect("key stored");
        assert_eq!(record.body["algo"], ALGO_AES_256_GCM);

        let wire = serde_json::to_value(&envelope).expect("envelope serializes");
        let stored_key = record.body["key"].as_str().expect("key is a string");
        assert!(!wire.to_string().contains(stored_key));
    }
}
