//! Optional message signatures
//!
//! - `keys`: Ed25519 signing keys and the trusted key ring
//! - `signature`: signature objects, policy, and the sign/verify engine
//!
//! Signing runs after the payload is built and before the envelope is
//! encoded; verification runs after decoding and before dispatch.

pub mod keys;
pub mod signature;

use thiserror::Error;

pub use keys::{key_id_for, KeyRing, SigningKeyPair};
pub use signature::{
    ActionFilter, Signature, SignatureEngine, SignaturePolicy, ED25519, SIGNATURES_FIELD,
};

/// Signing or verification failure
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignatureError {
    #[error("Payload must be a JSON object to carry signatures")]
    PayloadNotObject,

    #[error("Malformed signature list: {0}")]
    Malformed(String),

    #[error("{0} requires a signed payload")]
    Missing(String),

    #[error("Unknown signing key: {0}")]
    UnknownKey(String),

    #[error("Unsupported signature algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("Signature by {0} is not valid base64 Ed25519")]
    InvalidEncoding(String),

    #[error("Signature by {0} does not match the payload")]
    Invalid(String),
}
