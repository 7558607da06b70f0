//! Interactive login: listener, correlation and state transitions.

#![allow(clippy::unwrap_used)]

mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio_test::{assert_err, assert_ok};

use common::{FakeExchanger, config, query_param, send_callback, token_set, transient};
use graphmail_auth::{
    AuthError, AuthSession, AuthorizationCode, AuthorizationRequest, CredentialStore,
    FileCredentialStore, MemoryCredentialStore, SessionStatus, TokenExchanger, TokenSet,
};

/// Token client that crashes on every call.
struct CrashingExchanger;

impl TokenExchanger for CrashingExchanger {
    async fn exchange_code(
        &self,
        _code: &AuthorizationCode,
        _request: &AuthorizationRequest,
    ) -> graphmail_auth::Result<TokenSet> {
        panic!("token client crashed")
    }

    async fn refresh(&self, _refresh_token: &str) -> graphmail_auth::Result<TokenSet> {
        panic!("token client crashed")
    }
}

#[tokio::test]
async fn test_full_login_persists_and_serves_token() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    let store = Arc::new(FileCredentialStore::new(&config.token_path, &config.account));
    let exchanger = Arc::new(FakeExchanger::new());
    let session = AuthSession::new(config.clone(), Arc::clone(&store), Arc::clone(&exchanger));
    assert_eq!(session.status(), SessionStatus::Unauthenticated);

    let login = session.begin_login().unwrap();
    assert_eq!(session.status(), SessionStatus::AwaitingUserConsent);

    let url = login.authorization_url().clone();
    assert_eq!(query_param(&url, "client_id"), "test-client");
    assert_eq!(query_param(&url, "code_challenge_method"), "S256");
    assert_eq!(query_param(&url, "redirect_uri"), config.redirect_uri.as_str());
    let state = query_param(&url, "state");

    let response = send_callback(&config, &format!("code=M.R3_BAY.c0de&state={state}")).await;
    assert!(response.starts_with("HTTP/1.1 200 OK"));
    assert_ok!(login.wait().await);

    assert!(matches!(session.status(), SessionStatus::Authenticated { .. }));
    assert_eq!(session.get_valid_token().await.unwrap(), "from-code");
    assert_eq!(exchanger.exchange_calls(), 1);
    assert_eq!(exchanger.refresh_calls(), 0);

    let persisted = store.load().unwrap();
    assert_eq!(persisted.access_token, "from-code");
    assert_eq!(persisted.refresh_token.as_deref(), Some("rt-1"));
}

#[tokio::test]
async fn test_second_login_while_pending_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let session = AuthSession::new(
        config(dir.path()),
        MemoryCredentialStore::new(),
        FakeExchanger::new(),
    );

    let login = session.begin_login().unwrap();
    assert_eq!(
        session.begin_login().unwrap_err(),
        AuthError::LoginAlreadyInProgress
    );

    login.cancel();
    assert_eq!(login.wait().await.unwrap_err(), AuthError::Cancelled);
}

#[tokio::test]
async fn test_mismatched_state_does_not_resolve_login() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    let exchanger = Arc::new(FakeExchanger::new());
    let session = AuthSession::new(
        config.clone(),
        MemoryCredentialStore::new(),
        Arc::clone(&exchanger),
    );

    let login = session.begin_login().unwrap();
    let state = query_param(login.authorization_url(), "state");

    let forged = send_callback(&config, "code=attacker&state=forged").await;
    assert!(forged.starts_with("HTTP/1.1 403"));
    let no_state = send_callback(&config, "code=attacker").await;
    assert!(no_state.starts_with("HTTP/1.1 403"));

    assert_eq!(session.status(), SessionStatus::AwaitingUserConsent);
    assert_eq!(exchanger.exchange_calls(), 0);

    send_callback(&config, &format!("code=genuine&state={state}")).await;
    assert_ok!(login.wait().await);
    assert_eq!(exchanger.exchange_calls(), 1);
}

#[tokio::test]
async fn test_timeout_releases_port_for_next_login() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path()).with_login_timeout(Duration::from_millis(100));
    let session = AuthSession::new(config.clone(), MemoryCredentialStore::new(), FakeExchanger::new());

    let login = session.begin_login().unwrap();
    assert!(matches!(login.wait().await, Err(AuthError::TimedOut(_))));
    assert_eq!(session.status(), SessionStatus::Unauthenticated);

    let retry = session.begin_login().unwrap();
    let state = query_param(retry.authorization_url(), "state");
    send_callback(&config, &format!("code=second-try&state={state}")).await;
    assert_ok!(retry.wait().await);
    assert!(matches!(session.status(), SessionStatus::Authenticated { .. }));
}

#[tokio::test]
async fn test_cancel_login() {
    let dir = tempfile::tempdir().unwrap();
    let session = AuthSession::new(
        config(dir.path()),
        MemoryCredentialStore::new(),
        FakeExchanger::new(),
    );

    let login = session.begin_login().unwrap();
    assert!(session.cancel_login());
    assert_eq!(login.wait().await.unwrap_err(), AuthError::Cancelled);
    assert_eq!(session.status(), SessionStatus::Unauthenticated);
    assert!(!session.cancel_login());
}

#[tokio::test]
async fn test_consent_denied() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    let session = AuthSession::new(config.clone(), MemoryCredentialStore::new(), FakeExchanger::new());

    let login = session.begin_login().unwrap();
    let state = query_param(login.authorization_url(), "state");
    let response = send_callback(
        &config,
        &format!("error=access_denied&error_description=AADSTS65004%3A+User+declined&state={state}"),
    )
    .await;
    assert!(response.contains("AADSTS65004"));

    let err = login.wait().await.unwrap_err();
    assert!(matches!(err, AuthError::ConsentDenied { ref error, .. } if error == "access_denied"));
    assert!(err.requires_login());
    assert_eq!(session.status(), SessionStatus::Unauthenticated);
}

#[tokio::test]
async fn test_port_unavailable_leaves_state_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    let _squatter =
        std::net::TcpListener::bind(("127.0.0.1", config.callback_port().unwrap())).unwrap();

    let session = AuthSession::new(
        config,
        MemoryCredentialStore::with_tokens(token_set("still-good", Some("rt"), 3600)),
        FakeExchanger::new(),
    );

    let err = session.begin_login().unwrap_err();
    assert!(matches!(err, AuthError::PortUnavailable { .. }));
    assert!(matches!(session.status(), SessionStatus::Authenticated { .. }));
    assert_eq!(session.get_valid_token().await.unwrap(), "still-good");
}

#[tokio::test]
async fn test_forced_relogin_discards_previous_credential() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    let store = Arc::new(MemoryCredentialStore::with_tokens(token_set("old", Some("rt-old"), 3600)));
    let session = AuthSession::new(config.clone(), Arc::clone(&store), FakeExchanger::new());

    let login = session.begin_login().unwrap();
    assert!(store.load().is_none());
    assert_eq!(
        session.get_valid_token().await.unwrap_err(),
        AuthError::ReauthenticationRequired
    );

    let state = query_param(login.authorization_url(), "state");
    send_callback(&config, &format!("code=new&state={state}")).await;
    assert_ok!(login.wait().await);
    assert_eq!(session.get_valid_token().await.unwrap(), "from-code");
    assert_eq!(store.load().unwrap().access_token, "from-code");
}

#[tokio::test]
async fn test_rejected_code_ends_unauthenticated() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    let exchanger = Arc::new(FakeExchanger::new());
    exchanger.push_exchange(Err(AuthError::InvalidGrant(
        "AADSTS54005: OAuth2 Authorization code was already redeemed".into(),
    )));
    let session = AuthSession::new(config.clone(), MemoryCredentialStore::new(), Arc::clone(&exchanger));

    let login = session.begin_login().unwrap();
    let state = query_param(login.authorization_url(), "state");
    send_callback(&config, &format!("code=used&state={state}")).await;

    assert!(matches!(login.wait().await, Err(AuthError::InvalidGrant(_))));
    assert_eq!(exchanger.exchange_calls(), 1);
    assert_eq!(session.status(), SessionStatus::Unauthenticated);
}

#[tokio::test]
async fn test_transient_exchange_failures_are_retried() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    let exchanger = Arc::new(FakeExchanger::new());
    exchanger.push_exchange(Err(transient()));
    exchanger.push_exchange(Err(transient()));
    let session = AuthSession::new(config.clone(), MemoryCredentialStore::new(), Arc::clone(&exchanger));

    let login = session.begin_login().unwrap();
    let state = query_param(login.authorization_url(), "state");
    send_callback(&config, &format!("code=flaky&state={state}")).await;

    assert_ok!(login.wait().await);
    assert_eq!(exchanger.exchange_calls(), 3);
    assert_eq!(session.get_valid_token().await.unwrap(), "from-code");
}

#[tokio::test]
async fn test_persistence_failure_ends_unauthenticated() {
    let dir = tempfile::tempdir().unwrap();
    let blocker = dir.path().join("not-a-dir");
    std::fs::write(&blocker, b"").unwrap();

    let config = config(dir.path());
    let store = FileCredentialStore::new(blocker.join("tokens.json"), &config.account);
    let session = AuthSession::new(config.clone(), store, FakeExchanger::new());

    let login = session.begin_login().unwrap();
    let state = query_param(login.authorization_url(), "state");
    send_callback(&config, &format!("code=ok&state={state}")).await;

    assert!(matches!(login.wait().await, Err(AuthError::Storage(_))));
    assert_eq!(session.status(), SessionStatus::Unauthenticated);
}

#[tokio::test]
async fn test_logout_cancels_pending_login() {
    let dir = tempfile::tempdir().unwrap();
    let session = AuthSession::new(
        config(dir.path()),
        MemoryCredentialStore::new(),
        FakeExchanger::new(),
    );

    let login = session.begin_login().unwrap();
    assert_ok!(session.logout());
    assert_eq!(session.status(), SessionStatus::Unauthenticated);
    assert_err!(login.wait().await);
}

#[tokio::test]
async fn test_crashed_exchange_ends_unauthenticated() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    let session = AuthSession::new(config.clone(), MemoryCredentialStore::new(), CrashingExchanger);

    let login = session.begin_login().unwrap();
    let state = query_param(login.authorization_url(), "state");
    send_callback(&config, &format!("code=M.R3_BAY.c0de&state={state}")).await;
    assert_err!(login.wait().await);
    assert_eq!(session.status(), SessionStatus::Unauthenticated);

    let again = session.begin_login().unwrap();
    again.cancel();
    assert_eq!(again.wait().await.unwrap_err(), AuthError::Cancelled);
    assert_ok!(session.logout());
}
