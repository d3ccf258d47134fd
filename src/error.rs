//! Error taxonomy shared by every layer of the sync core.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Maximum number of response-body characters kept in a remote error.
pub const REMOTE_BODY_MAX_CHARS: usize = 300;

#[derive(Debug, Error)]
pub enum Error {
    /// Local durability failed. Fatal to the current operation.
    #[error("local store error: {0}")]
    LocalStore(String),
    /// Network failure or non-2xx response. Recoverable by queuing.
    #[error("{}", remote_message(*status, message))]
    Remote { status: Option<u16>, message: String },
    /// A record was rejected before touching any store.
    #[error("validation error: {0}")]
    Validation(String),
    /// Credential missing, expired, or refresh failed. Requires sign-in.
    #[error("authentication required: {0}")]
    Auth(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

fn remote_message(status: Option<u16>, message: &str) -> String {
    match status {
        Some(code) => format!("remote error (HTTP {code}): {message}"),
        None => format!("remote error: {message}"),
    }
}

impl Error {
    pub fn remote(status: Option<u16>, message: impl Into<String>) -> Self {
        Self::Remote {
            status,
            message: message.into(),
        }
    }

    /// True when the caller must send the user back to the sign-in flow.
    pub fn is_sign_in_required(&self) -> bool {
        matches!(self, Self::Auth(_))
    }

    /// True for failures the outbox absorbs.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Remote { .. })
    }
}

/// Truncate a response body for inclusion in an error message.
pub fn truncate_body(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.chars().count() <= REMOTE_BODY_MAX_CHARS {
        return trimmed.to_string();
    }
    let mut out: String = trimmed.chars().take(REMOTE_BODY_MAX_CHARS).collect();
    out.push('…');
    out
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Self::LocalStore(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        let message = if err.is_connect() {
            "cannot reach remote backend".to_string()
        } else if err.is_timeout() {
            "request to remote backend timed out".to_string()
        } else if err.is_builder() {
            format!("invalid remote request: {err}")
        } else {
            format!("network error: {err}")
        };
        Self::Remote {
            status: err.status().map(|s| s.as_u16()),
            message,
        }
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::LocalStore(format!("connection lock poisoned: {err}"))
    }
}
