use thiserror::Error;

/// Failures from the connection/tunnel state machine and the transport
/// layer that drives it.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("failed to connect to the relay server")]
    Connect,
    #[error("registration was rejected: {0}")]
    Registration(String),
    #[error("cannot start a new connection while one is already in progress")]
    NotIdle,
    #[error("cannot connect to yourself")]
    SelfTarget,
    #[error("there is no pending connection request to respond to")]
    NoPendingRequest,
    #[error("there is no active tunnel")]
    NoActiveTunnel,
    #[error("not currently waiting on a pre-shared key")]
    NotValidating,
    #[error("that action isn't available in the current input mode")]
    WrongInputMode,
    #[error("no session key has been derived yet")]
    NoSessionKey,
}
