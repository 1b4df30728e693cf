use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::state_machine::AttemptState;

/// Broad error category used for user-facing handling and retry behavior.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorCategory {
    /// No response was received.
    Network,
    /// Authentication failed and the session was destroyed.
    Auth,
    /// Anti-forgery handshake could not be renewed.
    Handshake,
    /// Server answered with a non-success status or query errors.
    Application,
    /// Caller handed over a payload that cannot be encoded.
    Encoding,
    /// Local persistence failure.
    Storage,
    /// Internal bug or invariant break.
    Internal,
}

/// Caller-facing failure taxonomy for every request path.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ClientError {
    /// The request never produced a response (DNS, connect, timeout, TLS).
    #[error("network error: {0}")]
    Network(String),
    /// The access token could not be refreshed; the session is gone.
    #[error("session expired, re-authentication required")]
    AuthExpired,
    /// The anti-forgery token could not be renewed.
    #[error("anti-forgery handshake failed (status {status})")]
    HandshakeFailed {
        /// Status of the original rejected request.
        status: u16,
        /// Parsed body of the original rejected request.
        body: Value,
    },
    /// Any other non-2xx response, or a query response carrying `errors`.
    #[error("application error {status}: {}", display_message(.body))]
    Application {
        /// HTTP status code.
        status: u16,
        /// Parsed body, or the raw text wrapped in a JSON string.
        body: Value,
    },
    /// The request payload could not be encoded. Indicates a caller bug.
    #[error("encoding error: {0}")]
    Encoding(String),
    /// Persisting or clearing local session state failed.
    #[error("storage error: {0}")]
    Storage(String),
    /// Internal invariant break.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ClientError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Network(_) => ErrorCategory::Network,
            Self::AuthExpired => ErrorCategory::Auth,
            Self::HandshakeFailed { .. } => ErrorCategory::Handshake,
            Self::Application { .. } => ErrorCategory::Application,
            Self::Encoding(_) => ErrorCategory::Encoding,
            Self::Storage(_) => ErrorCategory::Storage,
            Self::Internal(_) => ErrorCategory::Internal,
        }
    }

    /// Stable machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Network(_) => "network_error",
            Self::AuthExpired => "auth_expired",
            Self::HandshakeFailed { .. } => "handshake_failed",
            Self::Application { .. } => "application_error",
            Self::Encoding(_) => "encoding_error",
            Self::Storage(_) => "storage_error",
            Self::Internal(_) => "internal_error",
        }
    }

    /// Whether the user may retry the action without re-authenticating.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Network(_) | Self::HandshakeFailed { .. } | Self::Application { .. }
        )
    }

    /// HTTP status carried by the error, when one exists.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::HandshakeFailed { status, .. } | Self::Application { status, .. } => {
                Some(*status)
            }
            Self::AuthExpired => Some(401),
            _ => None,
        }
    }

    /// Human-readable message suitable for a transient UI notification.
    pub fn user_message(&self) -> String {
        match self {
            Self::Application { body, .. } | Self::HandshakeFailed { body, .. } => {
                display_message(body)
            }
            other => other.to_string(),
        }
    }

    /// Build a standard invalid-state-transition error.
    pub fn invalid_state(current: AttemptState, action: impl Into<String>) -> Self {
        let action = action.into();
        Self::Internal(format!(
            "cannot run '{action}' while request attempt is in state {current:?}"
        ))
    }
}

/// Outcome class of an HTTP status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    Success,
    /// Access token invalid or expired.
    AuthExpired,
    /// Anti-forgery token mismatch.
    HandshakeMismatch,
    Application,
}

/// Map HTTP status codes to request outcome classes.
pub fn classify_http_status(status: u16) -> StatusClass {
    match status {
        200..=299 => StatusClass::Success,
        401 => StatusClass::AuthExpired,
        419 => StatusClass::HandshakeMismatch,
        _ => StatusClass::Application,
    }
}

/// Extract the most useful message from a server error body.
///
/// Understands `{message}`, `{error}` and `{errors: [{message}]}` shapes and
/// falls back to the compact JSON rendering.
pub fn display_message(body: &Value) -> String {
    if let Some(message) = body.get("message").and_then(Value::as_str) {
        return message.to_owned();
    }
    if let Some(message) = body.get("error").and_then(Value::as_str) {
        return message.to_owned();
    }
    if let Some(errors) = body.get("errors").and_then(Value::as_array) {
        let messages: Vec<&str> = errors
            .iter()
            .filter_map(|err| err.get("message").and_then(Value::as_str))
            .collect();
        if !messages.is_empty() {
            return messages.join("; ");
        }
    }
    match body {
        Value::String(text) => text.clone(),
        Value::Null => "no response body".to_owned(),
        other => other.to_string(),
    }
}
