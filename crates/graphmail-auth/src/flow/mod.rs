//! Authorization Code Flow requests and callback correlation.

mod pkce;

pub use pkce::{CHALLENGE_METHOD, PkcePair};

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use url::Url;

use crate::config::AuthConfig;
use crate::error::{AuthError, Result};

/// How long, in seconds, an authorization request may be exchanged after it
/// was created.
pub const REQUEST_MAX_AGE_SECS: i64 = 600;

/// One in-flight login attempt.
///
/// The `state` value correlates the browser redirect with this request and
/// the optional PKCE pair binds the code to this client instance.
#[derive(Debug, Clone)]
pub struct AuthorizationRequest {
    /// Random anti-CSRF correlation value.
    pub state: String,
    /// PKCE verifier/challenge, when enabled.
    pub pkce: Option<PkcePair>,
    /// Redirect URI registered with the provider.
    pub redirect_uri: Url,
    /// When the attempt started.
    pub created_at: DateTime<Utc>,
}

impl AuthorizationRequest {
    /// Starts a new attempt with a fresh state value.
    #[must_use]
    pub fn new(redirect_uri: Url, use_pkce: bool) -> Self {
        Self {
            state: random_token(32),
            pkce: use_pkce.then(PkcePair::generate),
            redirect_uri,
            created_at: Utc::now(),
        }
    }

    /// Returns true if the request is too old to be exchanged at `now`.
    #[must_use]
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        now - self.created_at > Duration::seconds(REQUEST_MAX_AGE_SECS)
    }

    /// Builds the provider authorization URL the user must visit.
    #[must_use]
    pub fn authorization_url(&self, config: &AuthConfig) -> Url {
        let mut url = config.provider.auth_url.clone();

        {
            let mut pairs = url.query_pairs_mut();
            pairs
                .append_pair("client_id", &config.client_id)
                .append_pair("response_type", "code")
                .append_pair("redirect_uri", self.redirect_uri.as_str());

            let scope = config.scope_string();
            if !scope.is_empty() {
                pairs.append_pair("scope", &scope);
            }

            pairs.append_pair("state", &self.state);

            if let Some(pkce) = &self.pkce {
                pairs
                    .append_pair("code_challenge", pkce.challenge())
                    .append_pair("code_challenge_method", CHALLENGE_METHOD);
            }

            for (key, value) in &config.provider.extra_auth_params {
                pairs.append_pair(key, value);
            }
        }

        url
    }
}

/// Authorization code delivered by the browser redirect.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthorizationCode {
    /// The one-time code.
    pub code: String,
    /// State value echoed by the provider.
    pub state: String,
}

impl std::fmt::Debug for AuthorizationCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthorizationCode")
            .field("code", &"<redacted>")
            .field("state", &self.state)
            .finish()
    }
}

/// Checks that a received code belongs to `request` before it is exchanged.
///
/// # Errors
///
/// Returns [`AuthError::InvalidGrant`] on state mismatch, an inconsistent PKCE
/// pair, or a stale request.
pub fn verify_correlation(
    code: &AuthorizationCode,
    request: &AuthorizationRequest,
    now: DateTime<Utc>,
) -> Result<()> {
    if !constant_time_eq(&code.state, &request.state) {
        return Err(AuthError::InvalidGrant(
            "state does not match the outstanding authorization request".into(),
        ));
    }
    if request.pkce.as_ref().is_some_and(|pkce| !pkce.is_consistent()) {
        return Err(AuthError::InvalidGrant("PKCE verifier mismatch".into()));
    }
    if request.is_stale(now) {
        return Err(AuthError::InvalidGrant("authorization request expired".into()));
    }
    Ok(())
}

/// Returns `len` random bytes encoded as unpadded base64url.
pub(crate) fn random_token(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Compares two strings without short-circuiting on the first difference.
pub(crate) fn constant_time_eq(a: &str, b: &str) -> bool {
    let (a, b) = (a.as_bytes(), b.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
