//! Identity provider endpoint configurations.

use crate::error::{AuthError, Result};
use url::Url;

/// Scopes requested from Microsoft Graph when none are configured.
pub const DEFAULT_GRAPH_SCOPES: &[&str] = &[
    "offline_access",
    "User.Read",
    "Mail.Read",
    "Mail.Send",
    "Calendars.Read",
    "Calendars.ReadWrite",
];

/// Identity provider configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Provider {
    /// Provider name (e.g., "Microsoft").
    pub name: String,
    /// Authorization endpoint URL.
    pub auth_url: Url,
    /// Token endpoint URL.
    pub token_url: Url,
    /// Default scopes.
    pub default_scopes: Vec<String>,
    /// Extra query parameters appended to every authorization URL.
    pub extra_auth_params: Vec<(String, String)>,
}

impl Provider {
    /// Creates a new provider configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if URLs are invalid.
    pub fn new(
        name: impl Into<String>,
        auth_url: impl AsRef<str>,
        token_url: impl AsRef<str>,
    ) -> Result<Self> {
        Ok(Self {
            name: name.into(),
            auth_url: Url::parse(auth_url.as_ref())?,
            token_url: Url::parse(token_url.as_ref())?,
            default_scopes: Vec::new(),
            extra_auth_params: Vec::new(),
        })
    }

    /// Sets the default scopes.
    #[must_use]
    pub fn with_default_scopes(mut self, scopes: Vec<String>) -> Self {
        self.default_scopes = scopes;
        self
    }

    /// Adds a query parameter to every authorization URL.
    #[must_use]
    pub fn with_auth_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_auth_params.push((key.into(), value.into()));
        self
    }

    /// Microsoft identity platform (v2.0 endpoints) for the given tenant.
    ///
    /// `tenant` is usually `common`, `consumers`, `organizations` or a
    /// directory ID. Scopes default to [`DEFAULT_GRAPH_SCOPES`].
    ///
    /// # Errors
    ///
    /// Returns an error if the tenant produces an invalid URL.
    pub fn microsoft(tenant: &str) -> Result<Self> {
        if tenant.is_empty() || tenant.contains('/') {
            return Err(AuthError::InvalidConfig(format!("invalid tenant: {tenant:?}")));
        }
        Ok(Self::new(
            "Microsoft",
            format!("https://login.microsoftonline.com/{tenant}/oauth2/v2.0/authorize"),
            format!("https://login.microsoftonline.com/{tenant}/oauth2/v2.0/token"),
        )?
        .with_default_scopes(DEFAULT_GRAPH_SCOPES.iter().map(ToString::to_string).collect())
        .with_auth_param("response_mode", "query"))
    }

    /// Validates that required URLs are usable.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is invalid.
    pub fn validate(&self) -> Result<()> {
        for (label, url) in [("auth_url", &self.auth_url), ("token_url", &self.token_url)] {
            if !matches!(url.scheme(), "https" | "http") {
                return Err(AuthError::InvalidConfig(format!(
                    "{label} must be an http(s) URL, got {url}"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_microsoft_provider() {
        let provider = Provider::microsoft("common").unwrap();
        assert_eq!(provider.name, "Microsoft");
        assert_eq!(
            provider.token_url.as_str(),
            "https://login.microsoftonline.com/common/oauth2/v2.0/token"
        );
        assert_eq!(provider.default_scopes.len(), DEFAULT_GRAPH_SCOPES.len());
        assert!(provider.default_scopes.contains(&"offline_access".to_string()));
        assert_eq!(
            provider.extra_auth_params,
            vec![("response_mode".to_string(), "query".to_string())]
        );
        provider.validate().unwrap();
    }

    #[test]
    fn test_microsoft_rejects_bad_tenant() {
        assert!(Provider::microsoft("").is_err());
        assert!(Provider::microsoft("a/b").is_err());
    }

    #[test]
    fn test_custom_provider() {
        let provider = Provider::new(
            "Custom",
            "https://auth.example.com/authorize",
            "https://auth.example.com/token",
        )
        .unwrap()
        .with_default_scopes(vec!["mail".to_string()]);

        assert_eq!(provider.name, "Custom");
        assert!(provider.extra_auth_params.is_empty());
        provider.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_non_http_scheme() {
        let provider = Provider::new(
            "Odd",
            "ftp://auth.example.com/authorize",
            "https://auth.example.com/token",
        )
        .unwrap();
        assert!(matches!(
            provider.validate(),
            Err(AuthError::InvalidConfig(_))
        ));
    }
}
