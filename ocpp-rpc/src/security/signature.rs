//! Payload signing and verification
//!
//! Signatures live in an optional `"signatures"` array on the payload. The
//! signed bytes are the compact JSON of the payload with the `"signatures"`
//! property removed, so a payload can carry several independent
//! signatures. `serde_json::Map` keeps keys sorted, which makes that
//! serialization canonical.

use std::collections::HashSet;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use ed25519_dalek::Verifier;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::keys::{KeyRing, SigningKeyPair};
use super::SignatureError;

/// Payload property holding the signature list
pub const SIGNATURES_FIELD: &str = "signatures";

/// The only algorithm currently produced and accepted
pub const ED25519: &str = "Ed25519";

/// One signature object inside a payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Signature {
    pub key_id: String,
    pub algorithm: String,
    /// Base64 encoded signature bytes
    pub value: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl Signature {
    pub fn bytes(&self) -> Result<Vec<u8>, SignatureError> {
        BASE64
            .decode(&self.value)
            .map_err(|_| SignatureError::InvalidEncoding(self.key_id.clone()))
    }
}

/// Which actions a rule applies to
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ActionFilter {
    #[default]
    Nothing,
    All,
    Only(HashSet<String>),
}

impl ActionFilter {
    pub fn only<I, S>(actions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ActionFilter::Only(actions.into_iter().map(Into::into).collect())
    }

    pub fn matches(&self, action: &str) -> bool {
        match self {
            ActionFilter::Nothing => false,
            ActionFilter::All => true,
            ActionFilter::Only(actions) => actions.contains(action),
        }
    }
}

/// Per-deployment signing rules
#[derive(Debug, Clone, Default)]
pub struct SignaturePolicy {
    signing_keys: Vec<Arc<SigningKeyPair>>,
    sign: ActionFilter,
    require: ActionFilter,
    trusted: KeyRing,
}

impl SignaturePolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sign outgoing payloads with this key (all actions unless narrowed)
    pub fn with_signing_key(mut self, key: SigningKeyPair) -> Self {
        self.signing_keys.push(Arc::new(key));
        if self.sign == ActionFilter::Nothing {
            self.sign = ActionFilter::All;
        }
        self
    }

    /// Only sign outgoing payloads of these actions
    pub fn sign_only<I, S>(mut self, actions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.sign = ActionFilter::only(actions);
        self
    }

    /// Incoming payloads of these actions must carry a valid signature
    pub fn require_for<I, S>(mut self, actions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.require = ActionFilter::only(actions);
        self
    }

    pub fn require_all(mut self) -> Self {
        self.require = ActionFilter::All;
        self
    }

    pub fn trust(mut self, key_id: impl Into<String>, key: ed25519_dalek::VerifyingKey) -> Self {
        self.trusted.insert(key_id, key);
        self
    }

    pub fn trust_key_pair(mut self, pair: &SigningKeyPair) -> Self {
        self.trusted.trust(pair);
        self
    }
}

/// Applies a [`SignaturePolicy`] to outgoing and incoming payloads
#[derive(Debug, Clone, Default)]
pub struct SignatureEngine {
    policy: SignaturePolicy,
}

impl SignatureEngine {
    pub fn new(policy: SignaturePolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &SignaturePolicy {
        &self.policy
    }

    pub fn signs(&self, action: &str) -> bool {
        !self.policy.signing_keys.is_empty() && self.policy.sign.matches(action)
    }

    /// Attach signatures to an outgoing payload when the policy asks for it
    pub fn sign(&self, action: &str, payload: Value) -> Result<Value, SignatureError> {
        if !self.signs(action) {
            return Ok(payload);
        }
        sign_payload(payload, &self.policy.signing_keys)
    }

    /// Check every signature on an incoming payload
    ///
    /// Returns the number of verified signatures. A payload without
    /// signatures passes unless the policy requires signing for `action`.
    pub fn verify(&self, action: &str, payload: &Value) -> Result<usize, SignatureError> {
        let signatures = signatures_of(payload)?;

        if signatures.is_empty() {
            if self.policy.require.matches(action) {
                return Err(SignatureError::Missing(action.to_string()));
            }
            return Ok(0);
        }

        let data = signed_bytes(payload)?;
        for signature in &signatures {
            verify_one(signature, &data, &self.policy.trusted)?;
        }

        debug!("Verified {} signature(s) on {}", signatures.len(), action);
        Ok(signatures.len())
    }
}

/// Sign `payload` with every key, keeping signatures already present
pub fn sign_payload(
    mut payload: Value,
    keys: &[Arc<SigningKeyPair>],
) -> Result<Value, SignatureError> {
    let mut signatures = signatures_of(&payload)?;
    let data = signed_bytes(&payload)?;
    let now = Utc::now();

    for key in keys {
        signatures.push(Signature {
            key_id: key.key_id().to_string(),
            algorithm: ED25519.to_string(),
            value: BASE64.encode(key.sign(&data)),
            description: key.description().map(str::to_string),
            timestamp: Some(now),
        });
    }

    let object = payload
        .as_object_mut()
        .ok_or(SignatureError::PayloadNotObject)?;
    let list = serde_json::to_value(&signatures)
        .map_err(|e| SignatureError::Malformed(e.to_string()))?;
    object.insert(SIGNATURES_FIELD.to_string(), list);

    Ok(payload)
}

/// Signatures carried by a payload, empty if it has none
pub fn signatures_of(payload: &Value) -> Result<Vec<Signature>, SignatureError> {
    let object = payload
        .as_object()
        .ok_or(SignatureError::PayloadNotObject)?;

    match object.get(SIGNATURES_FIELD) {
        None => Ok(Vec::new()),
        Some(list) => Vec::<Signature>::deserialize(list)
            .map_err(|e| SignatureError::Malformed(e.to_string())),
    }
}

/// Canonical bytes covered by signatures
pub fn signed_bytes(payload: &Value) -> Result<Vec<u8>, SignatureError> {
    let bytes = match payload {
        Value::Object(map) => {
            let mut unsigned = map.clone();
            unsigned.remove(SIGNATURES_FIELD);
            serde_json::to_vec(&unsigned)
        }
        other => serde_json::to_vec(other),
    };
    bytes.map_err(|e| SignatureError::Malformed(e.to_string()))
}

fn verify_one(signature: &Signature, data: &[u8], trusted: &KeyRing) -> Result<(), SignatureError> {
    if signature.algorithm != ED25519 {
        return Err(SignatureError::UnsupportedAlgorithm(signature.algorithm.clone()));
    }

    let key = trusted
        .get(&signature.key_id)
        .ok_or_else(|| SignatureError::UnknownKey(signature.key_id.clone()))?;

    let bytes = signature.bytes()?;
    let bytes: [u8; 64] = bytes
        .try_into()
        .map_err(|_| SignatureError::InvalidEncoding(signature.key_id.clone()))?;
    let sig = ed25519_dalek::Signature::from_bytes(&bytes);

    key.verify(data, &sig)
        .map_err(|_| SignatureError::Invalid(signature.key_id.clone()))
}
