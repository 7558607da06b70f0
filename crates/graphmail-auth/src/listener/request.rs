//! Callback request parsing and validation.

use url::Url;

use super::pages::{self, Status};
use crate::flow::{AuthorizationCode, constant_time_eq};

/// What to do with one incoming request.
#[derive(Debug, PartialEq, Eq)]
pub(super) enum Verdict {
    /// Correct state and a code: the login can proceed.
    Accepted(AuthorizationCode),
    /// Correct state and an `error` parameter: the user declined.
    Denied { error: String, description: String },
    /// Anything else; the listener keeps waiting.
    Rejected { status: Status, reason: &'static str },
}

impl Verdict {
    /// Status line and HTML body for the browser.
    pub(super) fn page(&self) -> (Status, String) {
        match self {
            Self::Accepted(_) => (Status::Ok, pages::signed_in()),
            Self::Denied { error, description } => {
                (Status::BadRequest, pages::consent_denied(error, description))
            }
            Self::Rejected { status, reason } => (*status, pages::rejected(reason)),
        }
    }

    const fn reject(status: Status, reason: &'static str) -> Self {
        Self::Rejected { status, reason }
    }
}

/// Classifies a raw HTTP request head against the expected callback.
pub(super) fn classify(head: &str, expected_path: &str, expected_state: &str) -> Verdict {
    let Some(request_line) = head.lines().next() else {
        return Verdict::reject(Status::BadRequest, "Malformed request.");
    };
    let mut parts = request_line.split_whitespace();
    let (Some(method), Some(target)) = (parts.next(), parts.next()) else {
        return Verdict::reject(Status::BadRequest, "Malformed request.");
    };
    if !target.starts_with('/') {
        return Verdict::reject(Status::BadRequest, "Malformed request target.");
    }
    let Ok(url) = Url::parse(&format!("http://localhost{target}")) else {
        return Verdict::reject(Status::BadRequest, "Malformed request target.");
    };

    if url.path() != expected_path {
        return Verdict::reject(Status::NotFound, "Not found.");
    }
    if method != "GET" {
        return Verdict::reject(Status::MethodNotAllowed, "Only GET is supported.");
    }

    let mut code = None;
    let mut state = None;
    let mut error = None;
    let mut error_description = None;
    for (key, value) in url.query_pairs() {
        match key.as_ref() {
            "code" => code = Some(value.into_owned()),
            "state" => state = Some(value.into_owned()),
            "error" => error = Some(value.into_owned()),
            "error_description" => error_description = Some(value.into_owned()),
            _ => {}
        }
    }

    if !state.is_some_and(|state| constant_time_eq(&state, expected_state)) {
        return Verdict::reject(
            Status::Forbidden,
            "This response does not belong to the pending sign-in.",
        );
    }

    if let Some(error) = error {
        return Verdict::Denied {
            error,
            description: error_description.unwrap_or_default(),
        };
    }

    match code {
        Some(code) if !code.is_empty() => Verdict::Accepted(AuthorizationCode {
            code,
            state: expected_state.to_string(),
        }),
        _ => Verdict::reject(Status::BadRequest, "Missing authorization code."),
    }
}
