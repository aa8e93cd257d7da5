use serde_json::Value;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// Device offline and nothing cached.
    Offline,
    Timeout,
    NetworkUnreachable,
    ServerError(u16),
    ClientError(u16),
    /// A queued operation exceeded the replay ceiling.
    QueueAbandoned,
    /// The realtime channel exhausted its reconnect attempts.
    ChannelFailed,
}

impl ErrorKind {
    pub fn status(&self) -> Option<u16> {
        match self {
            ErrorKind::ServerError(status) | ErrorKind::ClientError(status) => Some(*status),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Offline => "offline",
            ErrorKind::Timeout => "timeout",
            ErrorKind::NetworkUnreachable => "network_unreachable",
            ErrorKind::ServerError(_) => "server_error",
            ErrorKind::ClientError(_) => "client_error",
            ErrorKind::QueueAbandoned => "queue_abandoned",
            ErrorKind::ChannelFailed => "channel_failed",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status() {
            Some(status) => write!(f, "{}({status})", self.as_str()),
            None => f.write_str(self.as_str()),
        }
    }
}

/// Surfaced failure of a request. `message` is ready to show to a user;
/// `detail` holds whatever the server said, when it said anything.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("{message}")]
pub struct TransportError {
    pub kind: ErrorKind,
    pub message: String,
    pub detail: Option<String>,
    pub request_id: Option<String>,
}

impl TransportError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            detail: None,
            request_id: None,
        }
    }

    /// Builds the error with the precomputed user-facing message for its kind.
    pub fn from_kind(kind: ErrorKind) -> Self {
        let message = user_message(&kind).to_string();
        Self::new(kind, message)
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn status(&self) -> Option<u16> {
        self.kind.status()
    }
}

pub fn user_message(kind: &ErrorKind) -> &'static str {
    match kind {
        ErrorKind::Offline => "You are offline and this content is not available offline.",
        ErrorKind::Timeout => "The server took too long to respond. Please try again.",
        ErrorKind::NetworkUnreachable => {
            "Unable to reach the server. Check your connection and try again."
        }
        ErrorKind::QueueAbandoned => {
            "A change made while offline could not be saved after several attempts."
        }
        ErrorKind::ChannelFailed => {
            "Live updates are unavailable. Please refresh to reconnect."
        }
        ErrorKind::ServerError(status) | ErrorKind::ClientError(status) => {
            status_message(*status)
        }
    }
}

pub fn status_message(status: u16) -> &'static str {
    match status {
        400 => "The request was invalid.",
        401 => "Your session is not authorized. Please sign in again.",
        403 => "You do not have permission to do that.",
        404 => "The requested resource was not found.",
        408 => "The request timed out. Please try again.",
        409 => "This change conflicts with the current state. Refresh and try again.",
        422 => "Some of the submitted data is invalid.",
        429 => "Too many requests. Please wait a moment and try again.",
        500 => "The server encountered an error. Please try again later.",
        502 | 504 => "The server is temporarily unreachable. Please try again later.",
        503 => "The service is temporarily unavailable. Please try again later.",
        400..=499 => "The request could not be completed.",
        _ => "Something went wrong on the server. Please try again later.",
    }
}

/// Server-provided message: the `message` or `error` field of a JSON body,
/// or the body itself when it is plain text.
pub fn server_message(body: &Value) -> Option<String> {
    match body {
        Value::Object(map) => ["message", "error"]
            .iter()
            .find_map(|key| map.get(*key))
            .and_then(|value| match value {
                Value::String(text) => Some(text.clone()),
                Value::Object(inner) => inner
                    .get("message")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                _ => None,
            }),
        Value::String(text) if !text.trim().is_empty() => Some(text.clone()),
        _ => None,
    }
}
