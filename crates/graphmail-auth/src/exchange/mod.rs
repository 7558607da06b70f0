//! Token endpoint requests.
//!
//! The exchanger performs exactly one request per call; retrying is up to the
//! caller. Every transport or provider failure is translated into an
//! [`AuthError`] here so that nothing from `reqwest` leaks past this module.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use reqwest::{Client, StatusCode};
use tracing::debug;
use url::Url;

use crate::config::AuthConfig;
use crate::error::{AuthError, Result};
use crate::flow::{AuthorizationCode, AuthorizationRequest, verify_correlation};
use crate::token::{ErrorResponse, TokenResponse, TokenSet};

/// Trades authorization codes and refresh tokens for token sets.
pub trait TokenExchanger: Send + Sync + 'static {
    /// Exchanges an authorization code received for `request`.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::InvalidGrant`] if the code does not belong to
    /// `request` or the provider rejects it, [`AuthError::Transient`] for
    /// transport failures and 5xx/429 responses, or another [`AuthError`] for
    /// any other provider error.
    fn exchange_code(
        &self,
        code: &AuthorizationCode,
        request: &AuthorizationRequest,
    ) -> impl Future<Output = Result<TokenSet>> + Send;

    /// Exchanges a refresh token for a renewed token set.
    ///
    /// The returned set may lack a refresh token when the provider does not
    /// rotate them.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::InvalidGrant`] if the refresh token was revoked or
    /// expired, and otherwise the same errors as
    /// [`exchange_code`](Self::exchange_code).
    fn refresh(&self, refresh_token: &str) -> impl Future<Output = Result<TokenSet>> + Send;
}

impl<T: TokenExchanger> TokenExchanger for Arc<T> {
    fn exchange_code(
        &self,
        code: &AuthorizationCode,
        request: &AuthorizationRequest,
    ) -> impl Future<Output = Result<TokenSet>> + Send {
        (**self).exchange_code(code, request)
    }

    fn refresh(&self, refresh_token: &str) -> impl Future<Output = Result<TokenSet>> + Send {
        (**self).refresh(refresh_token)
    }
}

/// Token exchanger talking to the provider's token endpoint over HTTPS.
#[derive(Clone)]
pub struct HttpExchanger {
    http: Client,
    token_url: Url,
    client_id: String,
    client_secret: Option<String>,
    scope: String,
    account: String,
}

impl HttpExchanger {
    /// Creates an exchanger for the provider and client in `config`.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::InvalidConfig`] if the HTTP client cannot be built.
    pub fn new(config: &AuthConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(config.http_timeout)
            .build()
            .map_err(|e| AuthError::InvalidConfig(format!("HTTP client: {e}")))?;

        Ok(Self {
            http,
            token_url: config.provider.token_url.clone(),
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            scope: config.scope_string(),
            account: config.account.clone(),
        })
    }

    async fn request_token(&self, grant_type: &str, params: &[(&str, &str)]) -> Result<TokenSet> {
        let mut form: Vec<(&str, &str)> = Vec::with_capacity(params.len() + 4);
        form.push(("grant_type", grant_type));
        form.extend_from_slice(params);
        form.push(("client_id", self.client_id.as_str()));
        if let Some(secret) = &self.client_secret {
            form.push(("client_secret", secret.as_str()));
        }
        if !self.scope.is_empty() {
            form.push(("scope", self.scope.as_str()));
        }

        debug!(grant_type, url = %self.token_url, "Requesting token");

        let response = self
            .http
            .post(self.token_url.clone())
            .form(&form)
            .send()
            .await
            .map_err(|e| AuthError::Transient(describe_transport(&e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| AuthError::Transient(describe_transport(&e)))?;
        let received_at = Utc::now();

        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            return Err(AuthError::Transient(format!(
                "token endpoint returned {status}"
            )));
        }

        if !status.is_success() {
            return Err(serde_json::from_str::<ErrorResponse>(&body).map_or_else(
                |_| AuthError::provider(format!("http_{}", status.as_u16()), truncate(&body)),
                ErrorResponse::into_error,
            ));
        }

        let token_response: TokenResponse = serde_json::from_str(&body)
            .map_err(|e| AuthError::InvalidResponse(e.to_string()))?;
        TokenSet::from_response(token_response, received_at, self.account.clone())
    }
}

impl TokenExchanger for HttpExchanger {
    async fn exchange_code(
        &self,
        code: &AuthorizationCode,
        request: &AuthorizationRequest,
    ) -> Result<TokenSet> {
        verify_correlation(code, request, Utc::now())?;

        let mut params = vec![
            ("code", code.code.as_str()),
            ("redirect_uri", request.redirect_uri.as_str()),
        ];
        if let Some(pkce) = &request.pkce {
            params.push(("code_verifier", pkce.verifier()));
        }

        self.request_token("authorization_code", &params).await
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenSet> {
        self.request_token("refresh_token", &[("refresh_token", refresh_token)])
            .await
    }
}

impl fmt::Debug for HttpExchanger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpExchanger")
            .field("token_url", &self.token_url.as_str())
            .field("client_id", &self.client_id)
            .field("client_secret", &self.client_secret.as_ref().map(|_| "<redacted>"))
            .field("scope", &self.scope)
            .field("account", &self.account)
            .finish_non_exhaustive()
    }
}

/// Describes a transport failure without echoing the request URL's query.
fn describe_transport(err: &reqwest::Error) -> String {
    let kind = if err.is_timeout() {
        "timeout"
    } else if err.is_connect() {
        "connection failed"
    } else {
        "request failed"
    };
    format!("{kind}: {err}")
}

fn truncate(body: &str) -> String {
    const MAX: usize = 200;
    match body.char_indices().nth(MAX) {
        Some((idx, _)) => format!("{}...", &body[..idx]),
        None => body.to_string(),
    }
}
