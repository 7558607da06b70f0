//! PKCE (Proof Key for Code Exchange, RFC 7636) with the S256 method.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use sha2::{Digest, Sha256};

use super::random_token;

/// Challenge method sent with every authorization request.
pub const CHALLENGE_METHOD: &str = "S256";

/// PKCE code verifier and its derived challenge.
#[derive(Clone, PartialEq, Eq)]
pub struct PkcePair {
    verifier: String,
    challenge: String,
}

impl PkcePair {
    /// Generates a fresh pair from 32 random bytes (a 43-character verifier).
    #[must_use]
    pub fn generate() -> Self {
        let verifier = random_token(32);
        let challenge = derive_challenge(&verifier);
        Self {
            verifier,
            challenge,
        }
    }

    /// Returns the verifier sent to the token endpoint.
    #[must_use]
    pub fn verifier(&self) -> &str {
        &self.verifier
    }

    /// Returns the challenge sent to the authorization endpoint.
    #[must_use]
    pub fn challenge(&self) -> &str {
        &self.challenge
    }

    /// Returns true if the verifier still hashes to the recorded challenge.
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        super::constant_time_eq(&derive_challenge(&self.verifier), &self.challenge)
    }
}

impl std::fmt::Debug for PkcePair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PkcePair")
            .field("verifier", &"<redacted>")
            .field("challenge", &self.challenge)
            .finish()
    }
}

/// `BASE64URL(SHA256(verifier))` without padding.
fn derive_challenge(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}
