//! Authentication configuration.
//!
//! The values here are supplied by the embedding application; this crate
//! never reads the environment itself.

use std::path::PathBuf;
use std::time::Duration;

use url::Url;

use crate::error::{AuthError, Result};
use crate::provider::Provider;
use crate::retry::RetryPolicy;

/// Redirect URI registered with the identity provider by default.
pub const DEFAULT_REDIRECT_URI: &str = "http://localhost:3333/auth/callback";

/// Account identifier used when none is configured.
pub const DEFAULT_ACCOUNT: &str = "default";

/// File name of the credential record under the home directory.
pub const DEFAULT_TOKEN_FILE: &str = ".outlook-mcp-tokens.json";

/// Returns the default credential record path (`~/.outlook-mcp-tokens.json`).
#[must_use]
pub fn default_token_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(DEFAULT_TOKEN_FILE)
}

/// Everything the login flow and token lifecycle need to know.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// Client ID from the provider's app registration.
    pub client_id: String,
    /// Client secret (absent for public clients).
    pub client_secret: Option<String>,
    /// Provider endpoints.
    pub provider: Provider,
    /// Requested scopes; provider defaults when empty.
    pub scopes: Vec<String>,
    /// Redirect URI; its port is the local callback port.
    pub redirect_uri: Url,
    /// Identifier of the single account this session manages.
    pub account: String,
    /// Location of the persisted credential record.
    pub token_path: PathBuf,
    /// Whether to send a PKCE challenge.
    pub use_pkce: bool,
    /// How long to wait for the browser redirect.
    pub login_timeout: Duration,
    /// Tokens expiring within this margin are refreshed before use.
    pub expiry_margin: Duration,
    /// Timeout for each token endpoint request.
    pub http_timeout: Duration,
    /// Retry policy for transient token endpoint failures.
    pub retry: RetryPolicy,
}

impl AuthConfig {
    /// Creates a configuration with defaults for everything but the client.
    ///
    /// # Panics
    ///
    /// Never: [`DEFAULT_REDIRECT_URI`] is a valid URL.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn new(client_id: impl Into<String>, provider: Provider) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: None,
            provider,
            scopes: Vec::new(),
            redirect_uri: Url::parse(DEFAULT_REDIRECT_URI).expect("default redirect URI is valid"),
            account: DEFAULT_ACCOUNT.to_string(),
            token_path: default_token_path(),
            use_pkce: true,
            login_timeout: Duration::from_secs(300),
            expiry_margin: Duration::from_secs(120),
            http_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
        }
    }

    /// Sets the client secret.
    #[must_use]
    pub fn with_client_secret(mut self, secret: impl Into<String>) -> Self {
        self.client_secret = Some(secret.into());
        self
    }

    /// Sets the requested scopes.
    #[must_use]
    pub fn with_scopes(mut self, scopes: Vec<String>) -> Self {
        self.scopes = scopes;
        self
    }

    /// Sets the redirect URI.
    ///
    /// # Errors
    ///
    /// Returns an error if the URI does not parse.
    pub fn with_redirect_uri(mut self, uri: impl AsRef<str>) -> Result<Self> {
        self.redirect_uri = Url::parse(uri.as_ref())?;
        Ok(self)
    }

    /// Sets the account identifier.
    #[must_use]
    pub fn with_account(mut self, account: impl Into<String>) -> Self {
        self.account = account.into();
        self
    }

    /// Sets the credential record path.
    #[must_use]
    pub fn with_token_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.token_path = path.into();
        self
    }

    /// Enables or disables PKCE.
    #[must_use]
    pub const fn with_pkce(mut self, enabled: bool) -> Self {
        self.use_pkce = enabled;
        self
    }

    /// Sets the login timeout.
    #[must_use]
    pub const fn with_login_timeout(mut self, timeout: Duration) -> Self {
        self.login_timeout = timeout;
        self
    }

    /// Sets the expiry safety margin.
    #[must_use]
    pub const fn with_expiry_margin(mut self, margin: Duration) -> Self {
        self.expiry_margin = margin;
        self
    }

    /// Sets the token endpoint request timeout.
    #[must_use]
    pub const fn with_http_timeout(mut self, timeout: Duration) -> Self {
        self.http_timeout = timeout;
        self
    }

    /// Sets the retry policy.
    #[must_use]
    pub const fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Scopes actually requested: the configured ones or the provider defaults.
    #[must_use]
    pub fn effective_scopes(&self) -> &[String] {
        if self.scopes.is_empty() {
            &self.provider.default_scopes
        } else {
            &self.scopes
        }
    }

    /// Requested scopes as a space-delimited string.
    #[must_use]
    pub fn scope_string(&self) -> String {
        self.effective_scopes().join(" ")
    }

    /// Port the callback listener binds, taken from the redirect URI.
    #[must_use]
    pub fn callback_port(&self) -> Option<u16> {
        self.redirect_uri.port_or_known_default()
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::InvalidConfig`] describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.client_id.trim().is_empty() {
            return Err(AuthError::InvalidConfig("client_id is empty".into()));
        }
        if self.account.trim().is_empty() {
            return Err(AuthError::InvalidConfig("account is empty".into()));
        }
        self.provider.validate()?;

        if self.redirect_uri.scheme() != "http" {
            return Err(AuthError::InvalidConfig(format!(
                "redirect URI must use http on the loopback interface, got {}",
                self.redirect_uri
            )));
        }
        if !matches!(
            self.redirect_uri.host_str(),
            Some("localhost" | "127.0.0.1" | "[::1]")
        ) {
            return Err(AuthError::InvalidConfig(format!(
                "redirect URI must point at localhost, got {}",
                self.redirect_uri
            )));
        }
        if self.redirect_uri.port().is_none() {
            return Err(AuthError::InvalidConfig(
                "redirect URI must name an explicit port".into(),
            ));
        }

        for (label, value) in [
            ("login_timeout", self.login_timeout),
            ("http_timeout", self.http_timeout),
        ] {
            if value.is_zero() {
                return Err(AuthError::InvalidConfig(format!("{label} must be non-zero")));
            }
        }
        Ok(())
    }
}
