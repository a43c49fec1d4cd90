//! Token hashing and session token issuance.
//!
//! Hosts authenticate with a bootstrap token provisioned by the operator
//! and exchange it for a short-lived session token at registration. Only
//! SHA-256 hashes are ever stored; comparison is constant time.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use sha2::{Digest, Sha256};

const TOKEN_BYTES: usize = 32;

/// Hash a token for storage, returned as lowercase hex.
pub fn hash_token(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    format!("{digest:x}")
}

/// Compare a presented token against a stored hash without leaking timing.
/// A missing stored hash never matches.
pub fn verify_token(token: &str, stored_hash: Option<&str>) -> bool {
    let Some(stored) = stored_hash else {
        return false;
    };
    constant_time_eq(hash_token(token).as_bytes(), stored.as_bytes())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Issue a fresh session token (256 bits of randomness) and its expiry.
/// The plaintext goes back to the caller exactly once; callers store only
/// the hash.
pub fn new_session_token(valid_for_hours: i64) -> (String, DateTime<Utc>) {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::rng().fill(&mut bytes);
    let token = format!("sess_{}", URL_SAFE_NO_PAD.encode(bytes));
    (token, Utc::now() + Duration::hours(valid_for_hours))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_stable_and_hex() {
        let h = hash_token("secret");
        assert_eq!(h, hash_token("secret"));
        assert_eq!(h.len(), 64);
        assert!(h.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn verify_accepts_matching_token_only() {
        let stored = hash_token("correct");
        assert!(verify_token("correct", Some(&stored)));
        assert!(!verify_token("wrong", Some(&stored)));
        assert!(!verify_token("correct", None));
    }

    #[test]
    fn session_tokens_are_unique_and_prefixed() {
        let (a, exp_a) = new_session_token(1);
        let (b, _) = new_session_token(1);
        assert_ne!(a, b);
        assert!(a.starts_with("sess_"));
        assert!(exp_a > Utc::now());
    }
}
