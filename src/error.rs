use thiserror::Error;

use crate::protocol::ProtocolError;

/// Errors surfaced to a browser client as `error` envelopes.
///
/// Each variant carries a stable machine-readable [`code`](RelayError::code);
/// the `Display` text becomes the envelope's `message`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("session already exists: {0}")]
    DuplicateSession(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("no session specified and {0} sessions are open")]
    AmbiguousSession(usize),

    #[error("maximum number of sessions per connection reached ({0})")]
    SessionLimit(usize),

    #[error("session is closed: {0}")]
    SessionClosed(String),

    #[error("connection is closed")]
    ChannelClosed,
}

impl RelayError {
    pub const PROTOCOL: &'static str = "protocol_error";
    pub const DUPLICATE: &'static str = "duplicate_session";
    pub const NOT_FOUND: &'static str = "session_not_found";
    pub const LIMIT: &'static str = "session_limit";
    pub const TRANSPORT: &'static str = "transport_error";
    pub const SHELL: &'static str = "shell_error";

    pub fn code(&self) -> &'static str {
        match self {
            RelayError::Protocol(_) => Self::PROTOCOL,
            RelayError::DuplicateSession(_) => Self::DUPLICATE,
            RelayError::SessionNotFound(_)
            | RelayError::AmbiguousSession(_)
            | RelayError::SessionClosed(_) => Self::NOT_FOUND,
            RelayError::SessionLimit(_) => Self::LIMIT,
            RelayError::ChannelClosed => Self::TRANSPORT,
        }
    }
}
