//! Error taxonomy shared across all hark crates.

/// Errors that can surface at the relay's external boundary.
///
/// Each variant maps to a stable wire code (see [`RelayError::code`]) that
/// clients switch on; the HTTP gateway owns the status-code mapping.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// The connecting peer is not in the node allowlist.
    #[error("peer is not an authorised node")]
    AuthDenied,

    /// Malformed request: bad JSON, missing field, wrong content type.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Request body exceeded the configured size cap.
    #[error("payload of {actual} bytes exceeds cap of {max} bytes")]
    PayloadTooLarge { max: u64, actual: u64 },

    /// Identical submission within the duplicate cooldown window.
    #[error("duplicate submission within cooldown ({remaining_ms} ms remaining)")]
    Cooldown { remaining_ms: u64 },

    /// A turn is already in flight; submissions are not queued.
    #[error("agent is busy with another turn")]
    Busy,

    /// An external dependency (STT/TTS provider or the child) is down.
    #[error("upstream unavailable: {0}")]
    Unavailable(String),

    /// An operation exceeded its deadline.
    #[error("operation timed out")]
    Timeout,

    /// The referenced entity does not exist.
    #[error("not found")]
    NotFound,

    /// The operation conflicts with existing state (e.g. write-once violation).
    #[error("conflict: {0}")]
    Conflict(String),

    /// Anything else. Logged with full context at the boundary.
    #[error("internal error: {0}")]
    Internal(String),
}

impl RelayError {
    /// Stable snake_case code carried in error bodies and WS error frames.
    pub fn code(&self) -> &'static str {
        match self {
            RelayError::AuthDenied => "auth_denied",
            RelayError::BadRequest(_) => "bad_request",
            RelayError::PayloadTooLarge { .. } => "payload_too_large",
            RelayError::Cooldown { .. } => "cooldown",
            RelayError::Busy => "busy",
            RelayError::Unavailable(_) => "unavailable",
            RelayError::Timeout => "timeout",
            RelayError::NotFound => "not_found",
            RelayError::Conflict(_) => "conflict",
            RelayError::Internal(_) => "internal",
        }
    }
}
