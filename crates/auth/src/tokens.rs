//! High-entropy opaque bearer token generation.
//!
//! Session and resume tokens are random bytes through the OS CSPRNG,
//! URL-safe-no-pad base64 encoded, prefixed for readability in logs and
//! traces (`st_`/`rt_`) — the tokens themselves are never logged in full,
//! only the derived `session_id` (see `session_id_for`).

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use rand::RngCore;

use crate::crypto::sha256_hex;

fn random_token(prefix: &str) -> String {
    let mut bytes = [0u8; 24];
    rand::rng().fill_bytes(&mut bytes);
    format!("{prefix}{}", URL_SAFE_NO_PAD.encode(bytes))
}

pub fn new_session_token() -> String {
    random_token("st_")
}

pub fn new_resume_token() -> String {
    random_token("rt_")
}

/// The non-reversible identifier clients see in place of a session token:
/// the SHA-256 hex of the token. Exposed in `session.list` responses; never
/// the token itself.
pub fn session_id_for(session_token: &str) -> String {
    sha256_hex(session_token.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_are_prefixed_and_unique() {
        let a = new_session_token();
        let b = new_session_token();
        assert!(a.starts_with("st_"));
        assert!(b.starts_with("st_"));
        assert_ne!(a, b);
    }

    #[test]
    fn session_id_is_deterministic_and_not_the_token() {
        let token = "st_abc123";
        let id1 = session_id_for(token);
        let id2 = session_id_for(token);
        assert_eq!(id1, id2);
        assert_ne!(id1, token);
        assert_eq!(id1.len(), 64);
    }
}
