use thiserror::Error;

/// Why a username was rejected by [`crate::username::validate`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UsernameError {
    #[error("username is required")]
    Empty,
    #[error("username must be no longer than 50 characters")]
    TooLong,
    #[error("username must start with a letter")]
    NotAlphaStart,
    #[error("username must only contain lowercase alphanumeric characters")]
    NotLowerAlphanumeric,
    #[error("username 'server' is reserved")]
    ReservedServer,
    #[error("username is a reserved keyword")]
    ReservedKeyword,
}

/// Failure modes when turning wire bytes into an [`crate::Envelope`].
///
/// Per spec, a malformed envelope is never fatal: callers coerce this into a
/// synthetic `system_message` rather than propagate it to a peer.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("malformed JSON: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Failures from the AES-256-GCM symmetric layer.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("encrypted message is too short to contain a nonce and tag")]
    Truncated,
    #[error("GCM authentication failed")]
    AuthenticationFailed,
}
