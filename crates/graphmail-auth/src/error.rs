//! Error types for authentication and token lifecycle operations.

/// Result type alias for authentication operations.
pub type Result<T> = std::result::Result<T, AuthError>;

/// Authentication error taxonomy.
///
/// Transport and provider failures are translated into these kinds at the
/// token-exchange boundary. The type is `Clone` so that a single refresh
/// outcome can be handed to every caller waiting on it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    /// The authorization code or refresh token was rejected.
    #[error("Invalid grant: {0}")]
    InvalidGrant(String),

    /// Network failure, timeout, or a 5xx/429 response from the provider.
    #[error("Transient error: {0}")]
    Transient(String),

    /// The local callback port could not be bound.
    #[error("Callback port {port} is unavailable: {reason}")]
    PortUnavailable {
        /// Port from the registered redirect URI.
        port: u16,
        /// Bind failure reported by the OS.
        reason: String,
    },

    /// The user did not complete consent in time.
    #[error("Login timed out after {0} seconds")]
    TimedOut(u64),

    /// The login attempt was aborted.
    #[error("Login cancelled")]
    Cancelled,

    /// Another login attempt is still outstanding.
    #[error("A login attempt is already in progress")]
    LoginAlreadyInProgress,

    /// No credential can be produced without a new interactive login.
    #[error("Re-authentication required: run the login flow again")]
    ReauthenticationRequired,

    /// The user declined consent at the identity provider.
    #[error("Consent denied: {error} - {description}")]
    ConsentDenied {
        /// Error code from the redirect (e.g. `access_denied`).
        error: String,
        /// Human-readable description.
        description: String,
    },

    /// Any other `OAuth2` error returned by the token endpoint.
    #[error("OAuth2 error: {error} - {description}")]
    Provider {
        /// Error code (e.g. `invalid_client`).
        error: String,
        /// Human-readable description.
        description: String,
    },

    /// The token endpoint answered with something that is not a token response.
    #[error("Invalid token response: {0}")]
    InvalidResponse(String),

    /// The credential store could not be written.
    #[error("Credential storage error: {0}")]
    Storage(String),

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl AuthError {
    /// Creates a provider error from an `OAuth2` error code and description.
    #[must_use]
    pub fn provider(error: impl Into<String>, description: impl Into<String>) -> Self {
        Self::Provider {
            error: error.into(),
            description: description.into(),
        }
    }

    /// Returns true if the operation may succeed when retried.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Returns true if the caller has to start a new interactive login.
    #[must_use]
    pub const fn requires_login(&self) -> bool {
        matches!(
            self,
            Self::ReauthenticationRequired | Self::InvalidGrant(_) | Self::ConsentDenied { .. }
        )
    }
}

impl From<url::ParseError> for AuthError {
    fn from(err: url::ParseError) -> Self {
        Self::InvalidConfig(format!("invalid URL: {err}"))
    }
}
