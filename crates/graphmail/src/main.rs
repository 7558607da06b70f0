//! `graphmail` - sign in to Microsoft Graph mail from the command line.
//!
//! Keeps a persisted, auto-refreshing credential so that other tools can ask
//! for a valid access token without prompting the user again.

#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

mod settings;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Local, Utc};
use clap::{Parser, Subcommand};
use graphmail_auth::{AuthError, AuthSession, GraphClient, SessionStatus};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use settings::Settings;

/// Sign in to Microsoft Graph and manage the stored credential.
#[derive(Debug, Parser)]
#[command(name = "graphmail", version, about)]
struct Cli {
    #[command(flatten)]
    settings: Settings,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Sign in through the browser and store the credential.
    Login {
        /// Print the sign-in URL instead of opening a browser.
        #[arg(long)]
        no_browser: bool,
    },
    /// Show whether a credential is stored and when it expires.
    Status,
    /// Print a valid access token, refreshing it if needed.
    Token,
    /// Forget the stored credential.
    Logout,
    /// Show the signed-in user.
    Whoami,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "graphmail=info,graphmail_auth=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = cli.settings.to_config()?;
    info!(account = %config.account, store = %config.token_path.display(), "Starting graphmail");
    let session = AuthSession::from_config(config)?;

    match cli.command {
        Command::Login { no_browser } => login(&session, no_browser).await,
        Command::Status => {
            print_status(&session.status());
            Ok(())
        }
        Command::Token => {
            let token = session.get_valid_token().await.map_err(with_hint)?;
            println!("{token}");
            Ok(())
        }
        Command::Logout => {
            session.logout()?;
            println!("Signed out.");
            Ok(())
        }
        Command::Whoami => {
            let graph = GraphClient::new(session)?;
            let me = graph.me().await.context("failed to fetch the signed-in user")?;
            println!(
                "{} <{}>",
                me.display_name.as_deref().unwrap_or("(no display name)"),
                me.mail
                    .as_deref()
                    .or(me.user_principal_name.as_deref())
                    .unwrap_or("unknown")
            );
            Ok(())
        }
    }
}

async fn login<S, E>(session: &AuthSession<S, E>, no_browser: bool) -> Result<()>
where
    S: graphmail_auth::CredentialStore,
    E: graphmail_auth::TokenExchanger,
{
    let pending = session.begin_login()?;
    let url = pending.authorization_url().to_string();

    println!("Open this URL to sign in:\n\n  {url}\n");
    if !no_browser {
        if let Err(e) = opener::open(&url) {
            warn!("Could not open a browser: {e}");
        }
    }
    println!("Waiting for the browser to finish (Ctrl-C to cancel)...");

    let cancel = pending.cancel_handle();
    let wait = pending.wait();
    tokio::pin!(wait);

    let outcome = tokio::select! {
        outcome = &mut wait => outcome,
        _ = tokio::signal::ctrl_c() => {
            cancel.cancel();
            wait.await
        }
    };

    match outcome {
        Ok(()) => {
            print_status(&session.status());
            Ok(())
        }
        Err(AuthError::Cancelled) => bail!("sign-in cancelled"),
        Err(AuthError::TimedOut(secs)) => bail!("no response from the browser within {secs}s"),
        Err(e) => Err(e).context("sign-in failed"),
    }
}

fn print_status(status: &SessionStatus) {
    match status {
        SessionStatus::Unauthenticated => println!("Not signed in."),
        SessionStatus::AwaitingUserConsent | SessionStatus::ExchangingCode => {
            println!("Sign-in in progress.");
        }
        SessionStatus::Authenticated {
            account,
            expires_at,
        } => println!("Signed in as {account}; access token valid until {}.", local(*expires_at)),
        SessionStatus::Expired {
            account,
            expires_at,
        } => println!(
            "Signed in as {account}; access token expired at {} and will be refreshed on next use.",
            local(*expires_at)
        ),
    }
}

fn local(at: DateTime<Utc>) -> String {
    at.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S %Z").to_string()
}

fn with_hint(err: AuthError) -> anyhow::Error {
    if err.requires_login() {
        anyhow::Error::new(err).context("not signed in; run `graphmail login`")
    } else {
        err.into()
    }
}
