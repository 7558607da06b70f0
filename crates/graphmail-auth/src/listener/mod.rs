//! One-shot loopback HTTP listener for the authorization redirect.
//!
//! The listener binds the port named by the redirect URI, answers every
//! request with a small HTML page, and resolves once a request carrying the
//! expected `state` arrives. Requests for other paths, with other methods, or
//! with the wrong `state` are answered and otherwise ignored.

mod pages;
mod request;

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Notify, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{AuthError, Result};
use crate::flow::AuthorizationCode;

use request::Verdict;

/// Largest request head the listener reads.
const MAX_REQUEST_BYTES: usize = 8 * 1024;

/// How long a connected client may take to send its request head.
const READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Signals a pending login attempt to stop waiting.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<Notify>);

impl CancelHandle {
    /// Creates a handle that has not been triggered.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation. Takes effect even if nobody is waiting yet.
    pub fn cancel(&self) {
        self.0.notify_one();
    }

    async fn cancelled(&self) {
        self.0.notified().await;
    }
}

/// A bound callback listener waiting for exactly one authorization response.
#[derive(Debug)]
pub struct CallbackListener {
    port: u16,
    outcome: oneshot::Receiver<Result<AuthorizationCode>>,
    cancel: CancelHandle,
    task: JoinHandle<()>,
}

impl CallbackListener {
    /// Binds the redirect URI's port on the loopback interface and starts
    /// serving in the background.
    ///
    /// The port is bound on 127.0.0.1 and, when available, on ::1. Must be
    /// called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::PortUnavailable`] if the IPv4 loopback port cannot
    /// be bound, or [`AuthError::InvalidConfig`] if the URI names no port.
    pub fn start(redirect_uri: &Url, expected_state: impl Into<String>) -> Result<Self> {
        let port = redirect_uri.port_or_known_default().ok_or_else(|| {
            AuthError::InvalidConfig(format!("redirect URI has no port: {redirect_uri}"))
        })?;

        let v4 = bind(SocketAddr::from((Ipv4Addr::LOCALHOST, port))).map_err(|e| {
            AuthError::PortUnavailable {
                port,
                reason: e.to_string(),
            }
        })?;
        let v6 = match bind(SocketAddr::from((Ipv6Addr::LOCALHOST, port))) {
            Ok(listener) => Some(listener),
            Err(e) => {
                debug!(port, "IPv6 loopback not bound: {e}");
                None
            }
        };

        let (tx, outcome) = oneshot::channel();
        let server = Server {
            v4,
            v6,
            path: redirect_uri.path().to_string(),
            state: expected_state.into(),
        };
        let task = tokio::spawn(server.run(tx));

        info!(port, path = redirect_uri.path(), "Callback listener started");
        Ok(Self {
            port,
            outcome,
            cancel: CancelHandle::new(),
            task,
        })
    }

    /// Port the listener is bound to.
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }

    /// Handle that makes [`await_code`](Self::await_code) return
    /// [`AuthError::Cancelled`].
    #[must_use]
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Waits for the authorization response, then shuts the listener down.
    ///
    /// The port is released before this returns, whatever the outcome.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::ConsentDenied`] if the user declined,
    /// [`AuthError::TimedOut`] if nothing arrived within `timeout`, or
    /// [`AuthError::Cancelled`] if the attempt was cancelled.
    pub async fn await_code(mut self, timeout: Duration) -> Result<AuthorizationCode> {
        let cancel = self.cancel.clone();
        let result = tokio::select! {
            received = &mut self.outcome => received.unwrap_or(Err(AuthError::Cancelled)),
            () = cancel.cancelled() => Err(AuthError::Cancelled),
            () = tokio::time::sleep(timeout) => Err(AuthError::TimedOut(timeout.as_secs())),
        };

        self.stop().await;
        result
    }

    /// Stops serving and waits until the port is released.
    pub async fn stop(mut self) {
        self.task.abort();
        let _ = (&mut self.task).await;
        debug!(port = self.port, "Callback listener stopped");
    }
}

impl Drop for CallbackListener {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn bind(addr: SocketAddr) -> std::io::Result<TcpListener> {
    let listener = std::net::TcpListener::bind(addr)?;
    listener.set_nonblocking(true)?;
    TcpListener::from_std(listener)
}

struct Server {
    v4: TcpListener,
    v6: Option<TcpListener>,
    path: String,
    state: String,
}

impl Server {
    async fn run(self, tx: oneshot::Sender<Result<AuthorizationCode>>) {
        loop {
            let (stream, peer) = match self.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Callback listener accept failed: {e}");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    continue;
                }
            };

            match self.handle(stream, peer).await {
                Some(Verdict::Accepted(code)) => {
                    info!("Authorization code received");
                    let _ = tx.send(Ok(code));
                    return;
                }
                Some(Verdict::Denied { error, description }) => {
                    warn!(%error, "Authorization was denied at the provider");
                    let _ = tx.send(Err(AuthError::ConsentDenied { error, description }));
                    return;
                }
                Some(Verdict::Rejected { .. }) | None => {}
            }
        }
    }

    async fn accept(&self) -> std::io::Result<(TcpStream, SocketAddr)> {
        match &self.v6 {
            Some(v6) => tokio::select! {
                accepted = self.v4.accept() => accepted,
                accepted = v6.accept() => accepted,
            },
            None => self.v4.accept().await,
        }
    }

    async fn handle(&self, mut stream: TcpStream, peer: SocketAddr) -> Option<Verdict> {
        let head = match tokio::time::timeout(READ_TIMEOUT, read_head(&mut stream)).await {
            Ok(Ok(head)) => head,
            Ok(Err(e)) => {
                debug!(%peer, "Failed to read callback request: {e}");
                return None;
            }
            Err(_) => {
                debug!(%peer, "Callback request timed out");
                return None;
            }
        };

        let verdict = request::classify(&head, &self.path, &self.state);
        if let Verdict::Rejected { status, reason } = &verdict {
            warn!(%peer, status = status.line(), "Rejected callback request: {reason}");
        }

        let (status, body) = verdict.page();
        let response = pages::response(status, &body);
        if let Err(e) = stream.write_all(response.as_bytes()).await {
            debug!(%peer, "Failed to write callback response: {e}");
        }
        let _ = stream.shutdown().await;

        Some(verdict)
    }
}

/// Reads until the end of the request head or the size limit.
async fn read_head(stream: &mut TcpStream) -> std::io::Result<String> {
    let mut buf = vec![0u8; MAX_REQUEST_BYTES];
    let mut len = 0;
    while len < buf.len() {
        let n = stream.read(&mut buf[len..]).await?;
        if n == 0 {
            break;
        }
        len += n;
        if buf[..len].windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }
    Ok(String::from_utf8_lossy(&buf[..len]).into_owned())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn redirect(port: u16) -> Url {
        Url::parse(&format!("http://localhost:{port}/auth/callback")).unwrap()
    }

    fn free_port() -> u16 {
        std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    async fn get(port: u16, target: &str) -> String {
        let mut stream = TcpStream::connect((Ipv4Addr::LOCALHOST, port)).await.unwrap();
        stream
            .write_all(format!("GET {target} HTTP/1.1\r\nHost: localhost\r\n\r\n").as_bytes())
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    #[tokio::test]
    async fn test_receives_code() {
        let port = free_port();
        let listener = CallbackListener::start(&redirect(port), "xyz").unwrap();

        let waiter = tokio::spawn(listener.await_code(Duration::from_secs(5)));
        let response = get(port, "/auth/callback?code=abc&state=xyz").await;
        assert!(response.starts_with("HTTP/1.1 200 OK"));

        let code = waiter.await.unwrap().unwrap();
        assert_eq!(code.code, "abc");
        assert_eq!(code.state, "xyz");

        // Port is released once await_code returns.
        std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, port)).unwrap();
    }

    #[tokio::test]
    async fn test_ignores_wrong_state_then_accepts() {
        let port = free_port();
        let listener = CallbackListener::start(&redirect(port), "xyz").unwrap();
        let waiter = tokio::spawn(listener.await_code(Duration::from_secs(5)));

        let forged = get(port, "/auth/callback?code=evil&state=abc").await;
        assert!(forged.starts_with("HTTP/1.1 403"));
        let other = get(port, "/favicon.ico").await;
        assert!(other.starts_with("HTTP/1.1 404"));
        assert!(!waiter.is_finished());

        get(port, "/auth/callback?code=good&state=xyz").await;
        assert_eq!(waiter.await.unwrap().unwrap().code, "good");
    }

    #[tokio::test]
    async fn test_consent_denied() {
        let port = free_port();
        let listener = CallbackListener::start(&redirect(port), "xyz").unwrap();
        let waiter = tokio::spawn(listener.await_code(Duration::from_secs(5)));

        let response = get(
            port,
            "/auth/callback?error=access_denied&error_description=%3Cb%3Enope%3C%2Fb%3E&state=xyz",
        )
        .await;
        assert!(response.contains("&lt;b&gt;nope&lt;/b&gt;"));

        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, AuthError::ConsentDenied { error, .. } if error == "access_denied"));
    }

    #[tokio::test]
    async fn test_timeout_releases_port() {
        let port = free_port();
        let listener = CallbackListener::start(&redirect(port), "xyz").unwrap();

        let err = listener
            .await_code(Duration::from_millis(50))
            .await
            .unwrap_err();
        assert_eq!(err, AuthError::TimedOut(0));

        let again = CallbackListener::start(&redirect(port), "next").unwrap();
        again.stop().await;
    }

    #[tokio::test]
    async fn test_cancel() {
        let port = free_port();
        let listener = CallbackListener::start(&redirect(port), "xyz").unwrap();
        listener.cancel_handle().cancel();

        let err = listener.await_code(Duration::from_secs(5)).await.unwrap_err();
        assert_eq!(err, AuthError::Cancelled);
    }

    #[tokio::test]
    async fn test_port_in_use() {
        let taken = std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let port = taken.local_addr().unwrap().port();

        let err = CallbackListener::start(&redirect(port), "xyz").unwrap_err();
        assert!(matches!(err, AuthError::PortUnavailable { port: p, .. } if p == port));
    }
}
