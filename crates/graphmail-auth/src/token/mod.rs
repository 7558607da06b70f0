//! Token set types and expiry bookkeeping.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{AuthError, Result};

fn default_token_type() -> String {
    "Bearer".to_string()
}

/// Credentials issued by the identity provider for one account.
///
/// `expires_at` is always computed from the provider's `expires_in` and the
/// time the response was received. This is also the on-disk record format.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenSet {
    /// Account the tokens were issued for.
    pub account: String,
    /// Access token string.
    pub access_token: String,
    /// Refresh token, if the provider issued one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Token type (usually "Bearer").
    #[serde(default = "default_token_type")]
    pub token_type: String,
    /// Absolute expiry of the access token.
    pub expires_at: DateTime<Utc>,
    /// Granted scopes.
    #[serde(default)]
    pub scope: BTreeSet<String>,
}

impl TokenSet {
    /// Builds a token set from a token endpoint response received at `issued_at`.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::InvalidResponse`] if the response omits `expires_in`,
    /// gives a lifetime that overflows the expiry timestamp, or carries an
    /// empty access token.
    pub fn from_response(
        response: TokenResponse,
        issued_at: DateTime<Utc>,
        account: impl Into<String>,
    ) -> Result<Self> {
        if response.access_token.is_empty() {
            return Err(AuthError::InvalidResponse("empty access_token".into()));
        }
        let expires_in = response
            .expires_in
            .ok_or_else(|| AuthError::InvalidResponse("missing expires_in".into()))?;
        let expires_at = i64::try_from(expires_in)
            .ok()
            .and_then(Duration::try_seconds)
            .and_then(|lifetime| issued_at.checked_add_signed(lifetime))
            .ok_or_else(|| {
                AuthError::InvalidResponse(format!("expires_in out of range: {expires_in}"))
            })?;

        Ok(Self {
            account: account.into(),
            access_token: response.access_token,
            refresh_token: response.refresh_token.filter(|t| !t.is_empty()),
            token_type: response.token_type.unwrap_or_else(default_token_type),
            expires_at,
            scope: parse_scope(response.scope.as_deref().unwrap_or_default()),
        })
    }

    /// Returns true if the access token is past its expiry at `now`.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Returns true if the access token expires within `margin` of `now`.
    #[must_use]
    pub fn needs_refresh(&self, now: DateTime<Utc>, margin: Duration) -> bool {
        now.checked_add_signed(margin)
            .is_none_or(|deadline| deadline >= self.expires_at)
    }

    /// Merges a refreshed token set into this one.
    ///
    /// Providers that do not rotate refresh tokens omit them from refresh
    /// responses, in which case the current refresh token is kept. The same
    /// applies to an empty scope.
    #[must_use]
    pub fn renewed(&self, mut fresh: Self) -> Self {
        if fresh.refresh_token.is_none() {
            fresh.refresh_token.clone_from(&self.refresh_token);
        }
        if fresh.scope.is_empty() {
            fresh.scope.clone_from(&self.scope);
        }
        fresh.account.clone_from(&self.account);
        fresh
    }

    /// Returns the granted scopes as a space-delimited string.
    #[must_use]
    pub fn scope_string(&self) -> String {
        self.scope.iter().map(String::as_str).collect::<Vec<_>>().join(" ")
    }
}

impl fmt::Debug for TokenSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenSet")
            .field("account", &self.account)
            .field("access_token", &"<redacted>")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "<redacted>"))
            .field("token_type", &self.token_type)
            .field("expires_at", &self.expires_at)
            .field("scope", &self.scope)
            .finish()
    }
}

/// Splits a space-delimited scope string into a set.
#[must_use]
pub fn parse_scope(scope: &str) -> BTreeSet<String> {
    scope.split_whitespace().map(ToString::to_string).collect()
}

/// Token response from the token endpoint.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TokenResponse {
    /// Access token.
    pub access_token: String,
    /// Token type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,
    /// Lifetime of the access token in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<u64>,
    /// Refresh token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Granted scope.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

/// Error response from the token endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorResponse {
    /// Error code.
    pub error: String,
    /// Error description.
    #[serde(default)]
    pub error_description: String,
}

impl ErrorResponse {
    /// Converts to an [`AuthError`], singling out `invalid_grant`.
    #[must_use]
    pub fn into_error(self) -> AuthError {
        if self.error == "invalid_grant" {
            AuthError::InvalidGrant(self.error_description)
        } else {
            AuthError::provider(self.error, self.error_description)
        }
    }
}
