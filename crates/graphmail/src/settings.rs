//! Command-line and environment configuration.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Args;
use graphmail_auth::{AuthConfig, Provider};

/// Path of the callback endpoint below `MS_AUTH_SERVER_URL`.
const CALLBACK_PATH: &str = "/auth/callback";

/// Connection settings, read from flags or the `MS_*` environment variables.
#[derive(Debug, Clone, Args)]
pub struct Settings {
    /// Application (client) ID of the app registration.
    #[arg(long, env = "MS_CLIENT_ID")]
    pub client_id: String,

    /// Client secret, for confidential app registrations.
    #[arg(long, env = "MS_CLIENT_SECRET", hide_env_values = true)]
    pub client_secret: Option<String>,

    /// Directory tenant: `common`, `organizations`, `consumers` or a tenant ID.
    #[arg(long, env = "MS_TENANT", default_value = "common")]
    pub tenant: String,

    /// Base URL of the local callback server; must match the registered
    /// redirect URI without the `/auth/callback` path.
    #[arg(long, env = "MS_AUTH_SERVER_URL", default_value = "http://localhost:3333")]
    pub auth_server_url: String,

    /// Scopes to request, separated by spaces or commas, or a JSON array.
    #[arg(long, env = "MS_SCOPES")]
    pub scopes: Option<String>,

    /// Credential record location (default `~/.outlook-mcp-tokens.json`).
    #[arg(long, env = "MS_TOKEN_STORE_PATH")]
    pub token_store_path: Option<PathBuf>,

    /// Account identifier the credential record belongs to.
    #[arg(long, env = "MS_ACCOUNT", default_value = "default")]
    pub account: String,

    /// Seconds to wait for the browser sign-in.
    #[arg(long, default_value_t = 300)]
    pub login_timeout: u64,
}

impl Settings {
    /// Builds and validates the library configuration.
    pub fn to_config(&self) -> Result<AuthConfig> {
        let provider = Provider::microsoft(&self.tenant)?;
        let redirect_uri = format!(
            "{}{CALLBACK_PATH}",
            self.auth_server_url.trim_end_matches('/')
        );

        let mut config = AuthConfig::new(&self.client_id, provider)
            .with_redirect_uri(&redirect_uri)
            .with_context(|| format!("invalid MS_AUTH_SERVER_URL: {}", self.auth_server_url))?
            .with_account(&self.account)
            .with_login_timeout(Duration::from_secs(self.login_timeout));

        if let Some(secret) = self.client_secret.as_deref().filter(|s| !s.is_empty()) {
            config = config.with_client_secret(secret);
        }
        if let Some(scopes) = &self.scopes {
            config = config.with_scopes(parse_scopes(scopes)?);
        }
        if let Some(path) = &self.token_store_path {
            config = config.with_token_path(path);
        }

        config.validate()?;
        Ok(config)
    }
}

/// Accepts `a b c`, `a,b,c` or `["a","b","c"]`.
fn parse_scopes(raw: &str) -> Result<Vec<String>> {
    let raw = raw.trim();
    let scopes: Vec<String> = if raw.starts_with('[') {
        serde_json::from_str(raw).context("MS_SCOPES is not a JSON array of strings")?
    } else {
        raw.split(|c: char| c == ',' || c.is_whitespace())
            .filter(|s| !s.is_empty())
            .map(ToString::to_string)
            .collect()
    };
    if scopes.is_empty() {
        bail!("MS_SCOPES is empty");
    }
    Ok(scopes)
}
