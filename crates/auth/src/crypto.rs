//! Cryptographic primitives used by the social event chain and by token
//! generation: Ed25519 sign/verify, SHA-256, and the canonical JSON encoding
//! that both the chain's `event_hash` and its signatures are computed over.
//!
//! Canonical JSON is a wire contract (spec §9): object keys sorted
//! ASCII-lexicographically, no insignificant whitespace, UTF-8, integers as
//! plain decimals. `serde_json::Value`'s `BTreeMap`-backed object ordering
//! (enabled by the `preserve_order` feature being *off*) combined with the
//! compact `to_vec` writer gives us exactly this for free.

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("invalid public key")]
    InvalidPublicKey,
    #[error("invalid signature encoding")]
    InvalidSignature,
    #[error("signature verification failed")]
    VerificationFailed,
    #[error("canonicalization failed: {0}")]
    Canonicalize(#[from] serde_json::Error),
}

/// Serialize `value` as compact, key-sorted JSON bytes.
///
/// `serde_json::Value::Object` is backed by a `BTreeMap` in this workspace's
/// configuration (no `preserve_order` feature), so recursively-nested objects
/// are already key-sorted; `to_vec` emits them with no extra whitespace.
pub fn canonical_json(value: &Value) -> Result<Vec<u8>, CryptoError> {
    Ok(serde_json::to_vec(value)?)
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    hex_encode(&digest)
}

pub fn sha256_hex_of_str(s: &str) -> String {
    sha256_hex(s.as_bytes())
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(s, "{b:02x}");
    }
    s
}

/// Decode a base64url-no-pad-encoded Ed25519 public key (as carried in a
/// social event's `user_id`).
pub fn decode_public_key(user_id_b64: &str) -> Result<VerifyingKey, CryptoError> {
    let bytes = URL_SAFE_NO_PAD.decode(user_id_b64)?;
    let array: [u8; 32] = bytes.try_into().map_err(|_| CryptoError::InvalidPublicKey)?;
    VerifyingKey::from_bytes(&array).map_err(|_| CryptoError::InvalidPublicKey)
}

/// Verify `sig_b64` (standard base64) against `message` using the public key
/// encoded in `user_id_b64`.
pub fn verify_signature(
    user_id_b64: &str,
    message: &[u8],
    sig_b64: &str,
) -> Result<(), CryptoError> {
    let key = decode_public_key(user_id_b64)?;
    let sig_bytes = base64::engine::general_purpose::STANDARD
        .decode(sig_b64)
        .or_else(|_| URL_SAFE_NO_PAD.decode(sig_b64))?;
    let sig_array: [u8; 64] = sig_bytes
        .try_into()
        .map_err(|_| CryptoError::InvalidSignature)?;
    let signature = Signature::from_bytes(&sig_array);
    key.verify(message, &signature)
        .map_err(|_| CryptoError::VerificationFailed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::Signer;
    use rand::rngs::OsRng;

    #[test]
    fn canonical_json_sorts_keys() {
        let value = serde_json::json!({"b": 1, "a": 2, "c": {"z": 1, "y": 2}});
        let bytes = canonical_json(&value).unwrap();
        let s = String::from_utf8(bytes).unwrap();
        assert_eq!(s, r#"{"a":2,"b":1,"c":{"y":2,"z":1}}"#);
    }

    #[test]
    fn sha256_hex_matches_known_vector() {
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn sign_and_verify_round_trips() {
        let mut csprng = OsRng;
        let signing_key = ed25519_dalek::SigningKey::generate(&mut csprng);
        let verifying_key = signing_key.verifying_key();
        let user_id = URL_SAFE_NO_PAD.encode(verifying_key.to_bytes());
        let message = b"hello world";
        let signature = signing_key.sign(message);
        let sig_b64 = base64::engine::general_purpose::STANDARD.encode(signature.to_bytes());
        verify_signature(&user_id, message, &sig_b64).unwrap();
    }

    #[test]
    fn verify_rejects_tampered_message() {
        let mut csprng = OsRng;
        let signing_key = ed25519_dalek::SigningKey::generate(&mut csprng);
        let verifying_key = signing_key.verifying_key();
        let user_id = URL_SAFE_NO_PAD.encode(verifying_key.to_bytes());
        let signature = signing_key.sign(b"hello world");
        let sig_b64 = base64::engine::general_purpose::STANDARD.encode(signature.to_bytes());
        assert!(verify_signature(&user_id, b"goodbye world", &sig_b64).is_err());
    }
}
