use thiserror::Error;

/// Failures crossing the backend seam.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SyncError {
    #[error("network error: {0}")]
    Network(String),

    #[error("server returned {status}: {message}")]
    Status { status: u16, message: String },

    #[error("not found: {0}")]
    NotFound(String),

    /// The resource already exists (e.g. joining a room twice).
    #[error("already exists")]
    Conflict,

    /// The session token is no longer accepted.
    #[error("session is no longer valid")]
    Unauthorized,

    #[error("malformed response: {0}")]
    Decode(String),

    #[error("not signed in")]
    NoSession,
}

impl SyncError {
    /// Failures that end the session.
    pub fn is_session_fatal(&self) -> bool {
        matches!(self, Self::Unauthorized | Self::NoSession)
    }
}
