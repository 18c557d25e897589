use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::canonical;
use crate::encoding;

/// An access-claims declaration as presented by a caller.
///
/// The raw JSON is kept as written (object member order included) so the
/// schema validator can report shape problems instead of failing to decode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClaimsDeclaration(Value);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeClaimsError {
    Base64,
    Json,
}

impl std::fmt::Display for DecodeClaimsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeClaimsError::Base64 => write!(f, "claims header is not valid base64"),
            DecodeClaimsError::Json => write!(f, "claims header is not valid JSON"),
        }
    }
}

impl std::error::Error for DecodeClaimsError {}

impl ClaimsDeclaration {
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    /// Decodes the `x-airlock-claims` header form: base64 over JSON text.
    pub fn from_base64_json(encoded: &str) -> Result<Self, DecodeClaimsError> {
        let bytes = encoding::decode_base64(encoded).map_err(|_| DecodeClaimsError::Base64)?;
        let value =
            serde_json::from_slice::<Value>(&bytes).map_err(|_| DecodeClaimsError::Json)?;
        Ok(Self(value))
    }

    pub fn to_base64_json(&self) -> String {
        encoding::encode_base64(serde_json::to_vec(&self.0).unwrap_or_default())
    }

    pub fn as_object(&self) -> Option<&Map<String, Value>> {
        self.0.as_object()
    }

    /// Top-level claim-type names in declaration order.
    pub fn claim_types(&self) -> Vec<String> {
        self.as_object()
            .map(|map| map.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn canonical_string(&self) -> String {
        canonical::canonical_json_string(&self.0)
    }

    /// Path of every object member, depth first, in written order.
    pub fn declared_order(&self) -> Vec<Vec<String>> {
        let mut order = Vec::new();
        collect_paths(&self.0, &mut Vec::new(), &mut order);
        order
    }

    /// Bytes a policy signature covers: the canonical claims together with
    /// their declared order.
    pub fn signing_bytes(&self) -> Vec<u8> {
        canonical::canonical_json_bytes(&serde_json::json!({
            "claims": &self.0,
            "order": self.declared_order(),
        }))
    }

    /// Lowercase hex SHA-256 of [`Self::signing_bytes`].
    pub fn digest(&self) -> String {
        canonical::sha256_hex(&self.signing_bytes())
    }
}

fn collect_paths(value: &Value, prefix: &mut Vec<String>, out: &mut Vec<Vec<String>>) {
    let Some(map) = value.as_object() else {
        return;
    };
    for (key, member) in map {
        prefix.push(key.clone());
        out.push(prefix.clone());
        collect_paths(member, prefix, out);
        prefix.pop();
    }
}

impl From<Value> for ClaimsDeclaration {
    fn from(value: Value) -> Self {
        Self(value)
    }
}
