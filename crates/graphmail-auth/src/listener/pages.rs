//! Minimal HTML responses shown in the user's browser.

use std::fmt::Write;

/// HTTP status sent back to the browser.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Status {
    Ok,
    BadRequest,
    Forbidden,
    NotFound,
    MethodNotAllowed,
}

impl Status {
    pub(super) const fn line(self) -> &'static str {
        match self {
            Self::Ok => "200 OK",
            Self::BadRequest => "400 Bad Request",
            Self::Forbidden => "403 Forbidden",
            Self::NotFound => "404 Not Found",
            Self::MethodNotAllowed => "405 Method Not Allowed",
        }
    }
}

/// Escapes text for interpolation into HTML element content or attributes.
pub(super) fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            _ => out.push(c),
        }
    }
    out
}

/// Renders a page; `title` and `message` are escaped here.
pub(super) fn render(title: &str, message: &str) -> String {
    let title = escape(title);
    let message = escape(message);
    let mut page = String::with_capacity(512 + title.len() + message.len());
    let _ = write!(
        page,
        "<!DOCTYPE html>\n<html lang=\"en\">\n<head>\n<meta charset=\"utf-8\">\n\
         <title>graphmail | {title}</title>\n\
         <style>body{{font-family:-apple-system,system-ui,sans-serif;text-align:center;\
         padding-top:15vh;color:#1f2937}}p{{color:#6b7280}}</style>\n\
         </head>\n<body>\n<h1>{title}</h1>\n<p>{message}</p>\n</body>\n</html>\n"
    );
    page
}

/// Serializes a complete HTTP/1.1 response that closes the connection.
pub(super) fn response(status: Status, body: &str) -> String {
    format!(
        "HTTP/1.1 {}\r\nContent-Type: text/html; charset=utf-8\r\nContent-Length: {}\r\n\
         Cache-Control: no-store\r\nConnection: close\r\n\r\n{body}",
        status.line(),
        body.len(),
    )
}

pub(super) fn signed_in() -> String {
    render(
        "Signed in",
        "Authorization complete. You can close this window and return to your terminal.",
    )
}

pub(super) fn consent_denied(error: &str, description: &str) -> String {
    let message = if description.is_empty() {
        format!("The provider reported: {error}")
    } else {
        format!("The provider reported: {error}: {description}")
    };
    render("Authorization failed", &message)
}

pub(super) fn rejected(reason: &str) -> String {
    render("Request rejected", reason)
}
