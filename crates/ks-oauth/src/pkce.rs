//! PKCE (Proof Key for Code Exchange) utilities for OAuth 2.0
//!
//! Implements PKCE as defined in RFC 7636 with the S256 challenge method.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use rand::{thread_rng, Rng};
use sha2::{Digest, Sha256};

/// PKCE challenge containing code verifier and derived challenge
#[derive(Debug, Clone)]
pub struct PkceChallenge {
    /// Code verifier: base64url encoding of 32 random bytes
    pub code_verifier: String,

    /// Code challenge: BASE64URL(SHA256(code_verifier))
    pub code_challenge: String,
}

/// Generate a PKCE verifier/challenge pair for one flow attempt.
///
/// The verifier is the URL-safe base64 encoding (no padding) of 32 bytes
/// from a cryptographically secure source; the challenge is the URL-safe
/// base64 encoding of the SHA-256 digest of the verifier string.
pub fn generate_pkce_challenge() -> PkceChallenge {
    let mut verifier_bytes = [0u8; 32];
    thread_rng().fill(&mut verifier_bytes[..]);
    let code_verifier = URL_SAFE_NO_PAD.encode(verifier_bytes);

    let mut hasher = Sha256::new();
    hasher.update(code_verifier.as_bytes());
    let code_challenge = URL_SAFE_NO_PAD.encode(hasher.finalize());

    PkceChallenge {
        code_verifier,
        code_challenge,
    }
}

/// Generate a random state token for CSRF binding.
///
/// Lowercase hex of 16 cryptographically random bytes. Generated fresh
/// per flow attempt and compared against the `state` query parameter the
/// provider sends back.
pub fn generate_state() -> String {
    let mut bytes = [0u8; 16];
    thread_rng().fill(&mut bytes[..]);
    hex::encode(bytes)
}
