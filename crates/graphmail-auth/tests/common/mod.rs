//! Shared fixtures for the integration tests.

#![allow(dead_code, clippy::unwrap_used)]

use std::collections::VecDeque;
use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::Utc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use url::Url;

use graphmail_auth::flow::verify_correlation;
use graphmail_auth::token::parse_scope;
use graphmail_auth::{
    AuthConfig, AuthError, AuthorizationCode, AuthorizationRequest, Provider, Result,
    RetryPolicy, TokenExchanger, TokenSet,
};

/// Scripted token exchanger that counts its calls.
///
/// Queued results are returned first; once a queue is empty, code exchanges
/// yield `from-code`/`rt-1` and refreshes yield `refreshed` without a new
/// refresh token.
#[derive(Default)]
pub struct FakeExchanger {
    exchange_calls: AtomicUsize,
    refresh_calls: AtomicUsize,
    exchange_results: Mutex<VecDeque<Result<TokenSet>>>,
    refresh_results: Mutex<VecDeque<Result<TokenSet>>>,
    refresh_delay: Duration,
}

impl FakeExchanger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_refresh_delay(mut self, delay: Duration) -> Self {
        self.refresh_delay = delay;
        self
    }

    pub fn push_exchange(&self, result: Result<TokenSet>) {
        self.exchange_results.lock().unwrap().push_back(result);
    }

    pub fn push_refresh(&self, result: Result<TokenSet>) {
        self.refresh_results.lock().unwrap().push_back(result);
    }

    pub fn exchange_calls(&self) -> usize {
        self.exchange_calls.load(Ordering::SeqCst)
    }

    pub fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }
}

impl TokenExchanger for FakeExchanger {
    async fn exchange_code(
        &self,
        code: &AuthorizationCode,
        request: &AuthorizationRequest,
    ) -> Result<TokenSet> {
        self.exchange_calls.fetch_add(1, Ordering::SeqCst);
        verify_correlation(code, request, Utc::now())?;
        let queued = self.exchange_results.lock().unwrap().pop_front();
        queued.unwrap_or_else(|| Ok(token_set("from-code", Some("rt-1"), 3600)))
    }

    async fn refresh(&self, _refresh_token: &str) -> Result<TokenSet> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        let queued = self.refresh_results.lock().unwrap().pop_front();
        if !self.refresh_delay.is_zero() {
            tokio::time::sleep(self.refresh_delay).await;
        }
        queued.unwrap_or_else(|| Ok(token_set("refreshed", None, 3600)))
    }
}

pub fn token_set(access: &str, refresh: Option<&str>, expires_in_secs: i64) -> TokenSet {
    TokenSet {
        account: "default".into(),
        access_token: access.into(),
        refresh_token: refresh.map(Into::into),
        token_type: "Bearer".into(),
        expires_at: Utc::now() + chrono::Duration::seconds(expires_in_secs),
        scope: parse_scope("offline_access Mail.Read"),
    }
}

pub fn transient() -> AuthError {
    AuthError::Transient("token endpoint returned 503 Service Unavailable".into())
}

/// A loopback port that was free a moment ago.
pub fn free_port() -> u16 {
    std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

/// Configuration with a private callback port, a scratch token path and
/// fast retries.
pub fn config(dir: &Path) -> AuthConfig {
    AuthConfig::new("test-client", Provider::microsoft("common").unwrap())
        .with_redirect_uri(format!("http://localhost:{}/auth/callback", free_port()))
        .unwrap()
        .with_token_path(dir.join("tokens.json"))
        .with_login_timeout(Duration::from_secs(10))
        .with_retry(RetryPolicy {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        })
}

/// Extracts a query parameter from an authorization URL.
pub fn query_param(url: &Url, name: &str) -> String {
    url.query_pairs()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.into_owned())
        .unwrap()
}

/// Plays the browser: sends the provider redirect to the callback listener
/// and returns the raw HTTP response.
pub async fn send_callback(config: &AuthConfig, query: &str) -> String {
    let port = config.callback_port().unwrap();
    let mut stream = TcpStream::connect((Ipv4Addr::LOCALHOST, port)).await.unwrap();
    let request = format!(
        "GET {}?{query} HTTP/1.1\r\nHost: localhost:{port}\r\nAccept: text/html\r\n\r\n",
        config.redirect_uri.path()
    );
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    response
}
