use std::sync::LazyLock;
use std::time::Duration;

use regex_lite::Regex;
use reqwest::StatusCode;
use thiserror::Error;
use tokio::task::JoinError;

pub type Result<T> = std::result::Result<T, DomainOsErr>;

#[derive(Error, Debug)]
pub enum DomainOsErr {
    /// Schema or format violation at an API boundary. Never retried;
    /// surfaced verbatim.
    #[error("validation error: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Translation of a `UNIQUE` constraint violation on
    /// `automation_runs.dedupe_key`. Other constraint violations bubble as
    /// [`DomainOsErr::Db`].
    #[error("duplicate")]
    Duplicate,

    /// The SSE stream disconnected or errored out after the HTTP handshake
    /// succeeded but before the provider finished the message.
    #[error("stream disconnected before completion: {0}")]
    Stream(String),

    /// Unexpected HTTP status code from a provider.
    #[error("unexpected status {0}: {1}")]
    UnexpectedStatus(StatusCode, String),

    /// Retry limit exceeded while talking to a provider.
    #[error("exceeded retry limit, last status: {0}")]
    RetryLimit(StatusCode),

    /// Sentinel raised by adapters when the provider rejects tool fields.
    /// The tool loop catches this, flips the capability cache and downgrades
    /// to a flattened `chat_complete` call. Never surfaced as a stop reason.
    #[error("{0}")]
    ToolsNotSupported(ToolsNotSupportedError),

    /// Advisory write limit for the rolling hour. Non-retried; attached to
    /// the parse result as a system note.
    #[error("hourly save limit reached ({limit} per hour)")]
    RateLimitHour { limit: u32 },

    /// Advisory write limit for the calendar day.
    #[error("daily save limit reached ({limit} per day)")]
    RateLimitDay { limit: u32 },

    /// Cooperative abort. Not an error from the user's perspective, but the
    /// run record is marked `cancelled` for audit.
    #[error("cancelled")]
    Cancelled,

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Reqwest(#[from] reqwest::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Db(#[from] rusqlite::Error),

    #[error(transparent)]
    TokioJoin(#[from] JoinError),
}

#[derive(Debug)]
pub struct ToolsNotSupportedError {
    pub provider: String,
    pub model: String,
    /// The original provider message that tripped the heuristic.
    pub message: String,
}

impl std::fmt::Display for ToolsNotSupportedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "provider `{}` does not support tools for model `{}`: {}",
            self.provider, self.model, self.message
        )
    }
}

#[allow(clippy::unwrap_used)]
static TOOLS_NOT_SUPPORTED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)tools?.not.supported|does not support tools|unknown.field.*tools|invalid.*tool")
        .unwrap()
});

/// Matches provider error messages that mean "this model rejects the tools
/// field" as opposed to a transport failure.
pub(crate) fn is_tools_not_supported_message(message: &str) -> bool {
    TOOLS_NOT_SUPPORTED.is_match(message)
}

/// Attempt to pull a human-readable message out of an error body that embeds
/// JSON of the shape `{"error": {"message": "..."}}`. Providers wrap most
/// 4xx responses this way; surfacing the inner message beats showing the
/// whole body.
pub fn extract_provider_error_message(body: &str) -> Option<String> {
    let start = body.find('{')?;
    let value: serde_json::Value = serde_json::from_str(&body[start..]).ok()?;
    value
        .get("error")
        .and_then(|e| e.get("message"))
        .and_then(|m| m.as_str())
        .map(|s| s.to_string())
}

pub fn get_error_message_ui(e: &DomainOsErr) -> String {
    match e {
        DomainOsErr::UnexpectedStatus(status, body) => match extract_provider_error_message(body) {
            Some(message) => format!("provider error ({status}): {message}"),
            None => e.to_string(),
        },
        _ => e.to_string(),
    }
}
