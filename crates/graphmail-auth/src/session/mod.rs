//! The authentication session: login state machine and token lifecycle.
//!
//! ```text
//! Unauthenticated -> AwaitingUserConsent -> ExchangingCode -> Authenticated
//!        ^                   |                    |               |
//!        +-------------------+--------------------+---------------+
//!          timeout, cancel,      exchange or         refresh rejected,
//!          consent denied        persistence failed  logout
//! ```
//!
//! The session state lives behind a mutex that is only held for bookkeeping,
//! never while waiting on the network, the browser, or the credential store.
//!
//! Several processes may share one credential record. The record is re-read
//! before every refresh and whenever the session has no credential, so a
//! token renewed or a login completed elsewhere is picked up.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::config::AuthConfig;
use crate::error::{AuthError, Result};
use crate::exchange::{HttpExchanger, TokenExchanger};
use crate::flow::AuthorizationRequest;
use crate::listener::{CallbackListener, CancelHandle};
use crate::retry::with_backoff;
use crate::store::{CredentialStore, FileCredentialStore};
use crate::token::TokenSet;

/// One refresh shared by every caller that needed it.
type SharedRefresh = Shared<BoxFuture<'static, Result<String>>>;

struct InFlight {
    id: u64,
    future: SharedRefresh,
}

enum Phase {
    Unauthenticated,
    AwaitingUserConsent {
        state: String,
        cancel: CancelHandle,
    },
    ExchangingCode {
        state: String,
    },
    Authenticated {
        tokens: TokenSet,
        refresh: Option<InFlight>,
    },
}

impl Phase {
    fn is_attempt(&self, attempt: &str) -> bool {
        match self {
            Self::AwaitingUserConsent { state, .. } | Self::ExchangingCode { state } => {
                state == attempt
            }
            _ => false,
        }
    }

    /// True while refresh `id` is the one registered with the session.
    fn is_refreshing(&self, id: u64) -> bool {
        matches!(
            self,
            Self::Authenticated { refresh: Some(in_flight), .. } if in_flight.id == id
        )
    }
}

/// What [`AuthSession::get_valid_token`] has to do next.
enum Step {
    Ready(String),
    Wait(SharedRefresh),
    Reload,
    LoginPending,
}

/// Snapshot of the session state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionStatus {
    /// No credential; a login is required.
    Unauthenticated,
    /// Waiting for the user to complete consent in the browser.
    AwaitingUserConsent,
    /// Trading the authorization code for tokens.
    ExchangingCode,
    /// A credential is available and not yet expired.
    Authenticated {
        /// Account the credential belongs to.
        account: String,
        /// Access token expiry.
        expires_at: DateTime<Utc>,
    },
    /// A credential is held but its access token has expired. The next
    /// [`AuthSession::get_valid_token`] call will try to refresh it.
    Expired {
        /// Account the credential belongs to.
        account: String,
        /// When the access token expired.
        expires_at: DateTime<Utc>,
    },
}

/// Authentication session for a single account.
///
/// Cloning is cheap; clones share the same state.
pub struct AuthSession<S, E> {
    inner: Arc<Inner<S, E>>,
}

impl<S, E> Clone for AuthSession<S, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S, E> std::fmt::Debug for AuthSession<S, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthSession")
            .field("account", &self.inner.config.account)
            .finish_non_exhaustive()
    }
}

struct Inner<S, E> {
    config: AuthConfig,
    store: S,
    exchanger: E,
    phase: Mutex<Phase>,
    refresh_ids: AtomicU64,
}

impl AuthSession<FileCredentialStore, HttpExchanger> {
    /// Creates a session persisting to `config.token_path` and talking to the
    /// provider's token endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::InvalidConfig`] if the configuration is invalid.
    pub fn from_config(config: AuthConfig) -> Result<Self> {
        config.validate()?;
        let store = FileCredentialStore::new(&config.token_path, &config.account);
        let exchanger = HttpExchanger::new(&config)?;
        Ok(Self::new(config, store, exchanger))
    }
}

impl<S: CredentialStore, E: TokenExchanger> AuthSession<S, E> {
    /// Creates a session, restoring any credential found in `store`.
    ///
    /// A restored credential may already be expired; it is refreshed the
    /// first time a token is requested.
    pub fn new(config: AuthConfig, store: S, exchanger: E) -> Self {
        let phase = match store.load() {
            Some(tokens) => {
                info!(
                    account = %tokens.account,
                    expires_at = %tokens.expires_at,
                    "Restored stored credential"
                );
                Phase::Authenticated {
                    tokens,
                    refresh: None,
                }
            }
            None => {
                debug!(account = %config.account, "No stored credential");
                Phase::Unauthenticated
            }
        };

        Self {
            inner: Arc::new(Inner {
                config,
                store,
                exchanger,
                phase: Mutex::new(phase),
                refresh_ids: AtomicU64::new(0),
            }),
        }
    }

    /// Returns the session configuration.
    #[must_use]
    pub fn config(&self) -> &AuthConfig {
        &self.inner.config
    }

    /// Reports the current state.
    #[must_use]
    pub fn status(&self) -> SessionStatus {
        match &*self.inner.lock() {
            Phase::Unauthenticated => SessionStatus::Unauthenticated,
            Phase::AwaitingUserConsent { .. } => SessionStatus::AwaitingUserConsent,
            Phase::ExchangingCode { .. } => SessionStatus::ExchangingCode,
            Phase::Authenticated { tokens, .. } => {
                let account = tokens.account.clone();
                let expires_at = tokens.expires_at;
                if tokens.is_expired(Utc::now()) {
                    SessionStatus::Expired {
                        account,
                        expires_at,
                    }
                } else {
                    SessionStatus::Authenticated {
                        account,
                        expires_at,
                    }
                }
            }
        }
    }

    /// Starts an interactive login.
    ///
    /// Binds the callback listener and returns a handle carrying the URL the
    /// user has to open. Starting a login while authenticated discards the
    /// current credential once the listener is bound. The login continues in
    /// the background even if the returned handle is dropped.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::LoginAlreadyInProgress`] if a login is pending,
    /// [`AuthError::PortUnavailable`] if the callback port is taken (the
    /// session is left unchanged), or [`AuthError::InvalidConfig`].
    pub fn begin_login(&self) -> Result<PendingLogin> {
        let config = &self.inner.config;
        config.validate()?;

        let mut phase = self.inner.lock();
        if matches!(
            *phase,
            Phase::AwaitingUserConsent { .. } | Phase::ExchangingCode { .. }
        ) {
            return Err(AuthError::LoginAlreadyInProgress);
        }

        let request = AuthorizationRequest::new(config.redirect_uri.clone(), config.use_pkce);
        let listener = CallbackListener::start(&request.redirect_uri, request.state.clone())?;

        let discard = matches!(*phase, Phase::Authenticated { .. });
        let cancel = listener.cancel_handle();
        *phase = Phase::AwaitingUserConsent {
            state: request.state.clone(),
            cancel: cancel.clone(),
        };
        drop(phase);

        if discard {
            info!("Discarding current credential for a new login");
            self.inner.clear_store();
        }

        let authorization_url = request.authorization_url(config);
        info!(port = listener.port(), "Waiting for the user to authorize");

        let task = tokio::spawn(Arc::clone(&self.inner).run_login(request, listener));
        Ok(PendingLogin {
            authorization_url,
            cancel,
            task,
        })
    }

    /// Signals the pending login, if any, to stop waiting for the browser.
    ///
    /// Returns false if no login was waiting for consent. The session returns
    /// to `Unauthenticated` once the callback port has been released.
    pub fn cancel_login(&self) -> bool {
        match &*self.inner.lock() {
            Phase::AwaitingUserConsent { cancel, .. } => {
                cancel.cancel();
                true
            }
            _ => false,
        }
    }

    /// Returns an access token that is valid for at least the configured
    /// expiry margin, refreshing it first if needed.
    ///
    /// Concurrent callers share a single refresh. A session without a
    /// credential first looks for one saved by another process.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::ReauthenticationRequired`] when there is no
    /// credential or the provider rejected the refresh token (the stored
    /// credential is cleared in that case), or [`AuthError::Transient`] when
    /// the refresh failed after all retries (the credential is kept).
    pub async fn get_valid_token(&self) -> Result<String> {
        let mut step = self.inner.next_step();
        if matches!(step, Step::Reload) {
            if let Some(stored) = self.inner.store.load() {
                self.inner.adopt(stored);
            }
            step = self.inner.next_step();
        }

        match step {
            Step::Ready(access_token) => Ok(access_token),
            Step::Wait(refresh) => refresh.await,
            Step::Reload | Step::LoginPending => Err(AuthError::ReauthenticationRequired),
        }
    }

    /// Forgets the current credential, in memory and in the store.
    ///
    /// A login waiting for consent is cancelled.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::LoginAlreadyInProgress`] while an authorization
    /// code is being exchanged, or [`AuthError::Storage`] if the stored record
    /// could not be removed (the in-memory credential is gone regardless).
    pub fn logout(&self) -> Result<()> {
        let mut phase = self.inner.lock();
        match &*phase {
            Phase::ExchangingCode { .. } => return Err(AuthError::LoginAlreadyInProgress),
            Phase::AwaitingUserConsent { cancel, .. } => cancel.cancel(),
            Phase::Unauthenticated | Phase::Authenticated { .. } => {}
        }
        *phase = Phase::Unauthenticated;
        drop(phase);

        self.inner.store.clear()?;
        info!("Logged out");
        Ok(())
    }
}

impl<S, E> Inner<S, E> {
    fn lock(&self) -> MutexGuard<'_, Phase> {
        self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn margin(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.config.expiry_margin).unwrap_or(chrono::Duration::MAX)
    }

    /// Ends the login attempt `attempt` in `Unauthenticated`, unless the
    /// session has already moved on.
    fn abandon_attempt(&self, attempt: &str) {
        let mut phase = self.lock();
        if phase.is_attempt(attempt) {
            *phase = Phase::Unauthenticated;
        }
    }

    /// Takes over a credential found in the store if the session has none.
    fn adopt(&self, stored: TokenSet) {
        let mut phase = self.lock();
        if matches!(*phase, Phase::Unauthenticated) {
            info!(
                account = %stored.account,
                expires_at = %stored.expires_at,
                "Picked up stored credential"
            );
            *phase = Phase::Authenticated {
                tokens: stored,
                refresh: None,
            };
        }
    }

    /// Installs `tokens` if refresh `id` still owns the session.
    fn settle(&self, id: u64, tokens: TokenSet) -> Option<String> {
        let mut phase = self.lock();
        if !phase.is_refreshing(id) {
            return None;
        }
        let access_token = tokens.access_token.clone();
        *phase = Phase::Authenticated {
            tokens,
            refresh: None,
        };
        Some(access_token)
    }

    /// What a refresh reports once the session has moved on without it.
    fn superseded(&self) -> Result<String> {
        debug!("Session changed during refresh; discarding the result");
        match &*self.lock() {
            Phase::Authenticated { tokens, .. } => Ok(tokens.access_token.clone()),
            _ => Err(AuthError::ReauthenticationRequired),
        }
    }
}

impl<S: CredentialStore, E: TokenExchanger> Inner<S, E> {
    fn next_step(self: &Arc<Self>) -> Step {
        let mut phase = self.lock();
        match &mut *phase {
            Phase::Unauthenticated => Step::Reload,
            Phase::AwaitingUserConsent { .. } | Phase::ExchangingCode { .. } => Step::LoginPending,
            Phase::Authenticated { tokens, refresh } => {
                if !tokens.needs_refresh(Utc::now(), self.margin()) {
                    return Step::Ready(tokens.access_token.clone());
                }
                if let Some(in_flight) = refresh.as_ref() {
                    debug!("Joining in-flight token refresh");
                    return Step::Wait(in_flight.future.clone());
                }
                let in_flight = Self::start_refresh(self, tokens.clone());
                let future = in_flight.future.clone();
                *refresh = Some(in_flight);
                Step::Wait(future)
            }
        }
    }

    fn clear_store(&self) {
        if let Err(e) = self.store.clear() {
            error!("Failed to clear stored credential: {e}");
        }
    }

    async fn run_login(
        self: Arc<Self>,
        request: AuthorizationRequest,
        listener: CallbackListener,
    ) -> Result<()> {
        let attempt = AttemptGuard {
            inner: &self,
            state: request.state.clone(),
        };

        let code = listener
            .await_code(self.config.login_timeout)
            .await
            .inspect_err(|err| warn!("Login did not complete: {err}"))?;

        {
            let mut phase = self.lock();
            if !phase.is_attempt(&attempt.state) {
                debug!("Login attempt was superseded before the code exchange");
                return Err(AuthError::Cancelled);
            }
            *phase = Phase::ExchangingCode {
                state: attempt.state.clone(),
            };
        }

        let exchanger = &self.exchanger;
        let (code_ref, request_ref) = (&code, &request);
        let tokens = with_backoff(&self.config.retry, "Code exchange", move || {
            exchanger.exchange_code(code_ref, request_ref)
        })
        .await
        .inspect_err(|err| warn!("Code exchange failed: {err}"))?;

        if let Err(e) = self.store.save(&tokens) {
            error!("Failed to persist credential: {e}");
            return Err(e.into());
        }

        let mut phase = self.lock();
        if !phase.is_attempt(&attempt.state) {
            return Err(AuthError::Cancelled);
        }
        info!(
            account = %tokens.account,
            expires_at = %tokens.expires_at,
            scope = %tokens.scope_string(),
            "Login succeeded"
        );
        *phase = Phase::Authenticated {
            tokens,
            refresh: None,
        };
        Ok(())
    }

    /// Spawns a refresh so that it completes even if every waiter goes away.
    fn start_refresh(this: &Arc<Self>, cached: TokenSet) -> InFlight {
        let id = this.refresh_ids.fetch_add(1, Ordering::Relaxed);
        let inner = Arc::clone(this);
        let task = tokio::spawn(async move { inner.run_refresh(id, cached).await });
        let future = async move {
            task.await
                .unwrap_or_else(|e| Err(AuthError::Transient(format!("refresh task failed: {e}"))))
        }
        .boxed()
        .shared();
        InFlight { id, future }
    }

    async fn run_refresh(&self, id: u64, cached: TokenSet) -> Result<String> {
        let _slot = RefreshSlot { inner: self, id };

        let current = match self.store.load() {
            Some(stored) if renewed_elsewhere(&stored, &cached) => {
                debug!("Stored credential was renewed by another process");
                stored
            }
            _ => cached,
        };
        if !current.needs_refresh(Utc::now(), self.margin()) {
            return self.settle(id, current).map_or_else(|| self.superseded(), Ok);
        }
        let Some(refresh_token) = current.refresh_token.clone() else {
            warn!("Access token expired and no refresh token is available");
            return self.revoke(id, &current);
        };

        debug!("Refreshing access token");
        let exchanger = &self.exchanger;
        let token_ref = refresh_token.as_str();
        let outcome = with_backoff(&self.config.retry, "Token refresh", move || {
            exchanger.refresh(token_ref)
        })
        .await;

        match outcome {
            Ok(fresh) => {
                let renewed = current.renewed(fresh);
                if let Err(e) = self.store.save(&renewed) {
                    error!("Failed to persist refreshed credential: {e}");
                }
                let expires_at = renewed.expires_at;
                let access_token = renewed.access_token.clone();
                if self.settle(id, renewed).is_some() {
                    info!(%expires_at, "Access token refreshed");
                    return Ok(access_token);
                }
                // The session moved on while the record was written.
                self.discard_record(&|record: &TokenSet| record.access_token == access_token);
                self.superseded()
            }
            Err(AuthError::InvalidGrant(reason)) => {
                warn!("Refresh token rejected: {reason}");
                match self.store.load() {
                    Some(stored)
                        if stored.refresh_token != current.refresh_token
                            && !stored.needs_refresh(Utc::now(), self.margin()) =>
                    {
                        debug!("Using credential renewed by another process");
                        self.settle(id, stored).map_or_else(|| self.superseded(), Ok)
                    }
                    _ => self.revoke(id, &current),
                }
            }
            Err(err) => {
                warn!("Token refresh failed: {err}");
                self.settle(id, current);
                Err(err)
            }
        }
    }

    /// Demotes the session after `rejected` turned out to be unusable and
    /// removes the stored record if it still holds the same credential.
    fn revoke(&self, id: u64, rejected: &TokenSet) -> Result<String> {
        {
            let mut phase = self.lock();
            if !phase.is_refreshing(id) {
                drop(phase);
                return self.superseded();
            }
            *phase = Phase::Unauthenticated;
        }
        info!("Login required");

        self.discard_record(&|record: &TokenSet| match &rejected.refresh_token {
            Some(token) => record.refresh_token.as_ref() == Some(token),
            None => record.refresh_token.is_none() && record.access_token == rejected.access_token,
        });
        Err(AuthError::ReauthenticationRequired)
    }

    fn discard_record(&self, stale: &dyn Fn(&TokenSet) -> bool) {
        match self.store.clear_if(stale) {
            Ok(true) => debug!("Removed stale credential record"),
            Ok(false) => debug!("Stored credential is newer; keeping it"),
            Err(e) => error!("Failed to clear stored credential: {e}"),
        }
    }
}

/// True if `stored` is a newer credential than `cached`.
fn renewed_elsewhere(stored: &TokenSet, cached: &TokenSet) -> bool {
    stored.refresh_token != cached.refresh_token || stored.expires_at > cached.expires_at
}

/// Returns a login attempt that did not reach `Authenticated` to
/// `Unauthenticated`, however the login task ends.
struct AttemptGuard<'a, S, E> {
    inner: &'a Inner<S, E>,
    state: String,
}

impl<S, E> Drop for AttemptGuard<'_, S, E> {
    fn drop(&mut self) {
        self.inner.abandon_attempt(&self.state);
    }
}

/// Frees the session's refresh slot if refresh `id` ends without settling,
/// so that the next caller starts a new refresh.
struct RefreshSlot<'a, S, E> {
    inner: &'a Inner<S, E>,
    id: u64,
}

impl<S, E> Drop for RefreshSlot<'_, S, E> {
    fn drop(&mut self) {
        let mut phase = self.inner.lock();
        if let Phase::Authenticated { refresh, .. } = &mut *phase
            && refresh.as_ref().is_some_and(|in_flight| in_flight.id == self.id)
        {
            *refresh = None;
        }
    }
}

/// An interactive login waiting for the user.
#[derive(Debug)]
pub struct PendingLogin {
    authorization_url: Url,
    cancel: CancelHandle,
    task: JoinHandle<Result<()>>,
}

impl PendingLogin {
    /// URL the user must open to grant consent.
    #[must_use]
    pub const fn authorization_url(&self) -> &Url {
        &self.authorization_url
    }

    /// Stops waiting for the browser.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Handle that cancels this login from elsewhere.
    #[must_use]
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Waits until the login has finished, successfully or not.
    ///
    /// # Errors
    ///
    /// Returns the error that ended the login: [`AuthError::TimedOut`],
    /// [`AuthError::Cancelled`], [`AuthError::ConsentDenied`], or any code
    /// exchange or storage error.
    pub async fn wait(self) -> Result<()> {
        self.task.await.unwrap_or(Err(AuthError::Cancelled))
    }
}
