//! Authorized JSON client for the Microsoft Graph API.
//!
//! Every request asks the [`AuthSession`] for a valid access token, so callers
//! never handle tokens themselves.

use reqwest::{Client, Method, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};
use url::Url;

use crate::error::AuthError;
use crate::exchange::TokenExchanger;
use crate::session::AuthSession;
use crate::store::CredentialStore;

/// Graph API v1.0 base URL.
pub const GRAPH_BASE_URL: &str = "https://graph.microsoft.com/v1.0/";

/// Errors from Graph API requests.
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    /// No valid access token could be obtained.
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// The API rejected the access token (HTTP 401). A new login is needed.
    #[error("Unauthorized: the access token was rejected")]
    Unauthorized,

    /// Any other non-success response.
    #[error("Graph API returned {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body.
        body: String,
    },

    /// Transport failure.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The response body was not the expected JSON.
    #[error("Failed to decode response: {0}")]
    Decode(#[from] serde_json::Error),

    /// The base URL cannot take path segments.
    #[error("Invalid base URL: {0}")]
    InvalidBaseUrl(String),
}

/// Signed-in user, as returned by `GET /me`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    /// Directory object ID.
    pub id: String,
    /// Display name.
    #[serde(default)]
    pub display_name: Option<String>,
    /// Primary SMTP address.
    #[serde(default)]
    pub mail: Option<String>,
    /// Sign-in name.
    #[serde(default)]
    pub user_principal_name: Option<String>,
}

/// Graph API client bound to an authentication session.
#[derive(Debug, Clone)]
pub struct GraphClient<S, E> {
    session: AuthSession<S, E>,
    http: Client,
    base_url: Url,
}

impl<S: CredentialStore, E: TokenExchanger> GraphClient<S, E> {
    /// Creates a client for the public Graph endpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(session: AuthSession<S, E>) -> Result<Self, GraphError> {
        let http = Client::builder()
            .timeout(session.config().http_timeout)
            .build()?;
        let base_url =
            Url::parse(GRAPH_BASE_URL).map_err(|e| GraphError::InvalidBaseUrl(e.to_string()))?;
        Ok(Self {
            session,
            http,
            base_url,
        })
    }

    /// Points the client at another base URL (national clouds, tests).
    #[must_use]
    pub fn with_base_url(mut self, base_url: Url) -> Self {
        self.base_url = base_url;
        self
    }

    /// Returns the underlying session.
    #[must_use]
    pub const fn session(&self) -> &AuthSession<S, E> {
        &self.session
    }

    /// Fetches the signed-in user's profile.
    ///
    /// # Errors
    ///
    /// See [`request`](Self::request).
    pub async fn me(&self) -> Result<UserProfile, GraphError> {
        self.get("me", &[]).await
    }

    /// Sends a GET request and decodes the JSON response.
    ///
    /// # Errors
    ///
    /// See [`request`](Self::request).
    pub async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T, GraphError> {
        self.request(Method::GET, path, query, None).await
    }

    /// Sends a POST request with a JSON body and decodes the JSON response.
    ///
    /// # Errors
    ///
    /// See [`request`](Self::request).
    pub async fn post<T: DeserializeOwned>(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<T, GraphError> {
        self.request(Method::POST, path, &[], Some(body)).await
    }

    /// Sends a request to `path` (relative to the base URL, segments separated
    /// by `/` and percent-encoded individually).
    ///
    /// An empty success body decodes as JSON `null`.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::Auth`] if no valid token is available,
    /// [`GraphError::Unauthorized`] on HTTP 401, [`GraphError::Status`] for
    /// other error statuses, and [`GraphError::Http`] or
    /// [`GraphError::Decode`] for transport and decoding failures.
    pub async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
        body: Option<&serde_json::Value>,
    ) -> Result<T, GraphError> {
        let url = self.url_for(path, query)?;
        let token = self.session.get_valid_token().await?;

        debug!(%method, %url, "Graph API request");
        let mut request = self.http.request(method, url).bearer_auth(token);
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request.send().await?;

        let status = response.status();
        let text = response.text().await?;

        if status == StatusCode::UNAUTHORIZED {
            warn!("Graph API rejected the access token");
            return Err(GraphError::Unauthorized);
        }
        if !status.is_success() {
            return Err(GraphError::Status {
                status: status.as_u16(),
                body: text,
            });
        }

        let text = if text.trim().is_empty() { "null" } else { text.as_str() };
        Ok(serde_json::from_str(text)?)
    }

    fn url_for(&self, path: &str, query: &[(&str, &str)]) -> Result<Url, GraphError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| GraphError::InvalidBaseUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(path.split('/').filter(|segment| !segment.is_empty()));

        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query);
        }
        Ok(url)
    }
}
