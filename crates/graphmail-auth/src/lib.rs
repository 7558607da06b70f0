//! # graphmail-auth
//!
//! `OAuth2` login and token lifecycle for the Microsoft Graph mail API.
//!
//! ## Features
//!
//! - **Interactive login**: Authorization Code Flow with PKCE and a one-shot
//!   loopback callback listener
//! - **Token lifecycle**: lazy expiry checks, single-flight refresh with
//!   bounded retry, automatic demotion when a refresh token is revoked
//! - **Persistence**: atomic, owner-only JSON credential record with advisory
//!   locking
//! - **Graph client**: authorized JSON requests that fetch tokens on demand
//!
//! ## Quick Start
//!
//! ```ignore
//! use graphmail_auth::{AuthConfig, AuthSession, GraphClient, Provider};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = AuthConfig::new("your_client_id", Provider::microsoft("common")?);
//!     let session = AuthSession::from_config(config)?;
//!
//!     if session.get_valid_token().await.is_err() {
//!         let login = session.begin_login()?;
//!         println!("Visit: {}", login.authorization_url());
//!         login.wait().await?;
//!     }
//!
//!     let graph = GraphClient::new(session)?;
//!     let me = graph.me().await?;
//!     println!("Signed in as {:?}", me.mail);
//!     Ok(())
//! }
//! ```
//!
//! ## Testing
//!
//! [`AuthSession`] is generic over its [`CredentialStore`] and
//! [`TokenExchanger`], so tests can substitute [`MemoryCredentialStore`] and a
//! scripted exchanger.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

pub mod config;
mod error;
pub mod exchange;
pub mod flow;
pub mod graph;
pub mod listener;
pub mod provider;
pub mod retry;
pub mod session;
pub mod store;
pub mod token;

pub use config::AuthConfig;
pub use error::{AuthError, Result};
pub use exchange::{HttpExchanger, TokenExchanger};
pub use flow::{AuthorizationCode, AuthorizationRequest, PkcePair};
pub use graph::{GraphClient, GraphError, UserProfile};
pub use listener::{CallbackListener, CancelHandle};
pub use provider::Provider;
pub use retry::RetryPolicy;
pub use session::{AuthSession, PendingLogin, SessionStatus};
pub use store::{CredentialStore, FileCredentialStore, MemoryCredentialStore, StoreError};
pub use token::TokenSet;
