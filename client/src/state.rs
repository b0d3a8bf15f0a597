//! Client-side state (spec.md §3/§4.1, §9 redesign guidance), modeled as
//! explicit tagged variants rather than loose string fields.

use tunnel_protocol::crypto::KeyPair;

/// The connection/tunnel state machine. Only one peer interaction is active
/// at a time; a `target` is carried on every non-`Idle` state so the
/// dispatcher always knows who the current interaction is with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    RequestSent { target: String },
    RequestReceived { target: String },
    WaitTunnelTrigger { target: String },
    TunnelValidating { target: String },
    TunnelActive { target: String },
}

impl ConnectionState {
    pub fn target(&self) -> Option<&str> {
        match self {
            ConnectionState::Idle => None,
            ConnectionState::RequestSent { target }
            | ConnectionState::RequestReceived { target }
            | ConnectionState::WaitTunnelTrigger { target }
            | ConnectionState::TunnelValidating { target }
            | ConnectionState::TunnelActive { target } => Some(target),
        }
    }
}

/// Which prompt is active. `Locked` is the neutral non-sending mode entered
/// between `tunnel_ok_key_init` and the peer's `key_share` (spec.md §9 Open
/// Question 1) — plaintext must never go out during that window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputMode {
    Chat,
    Psk,
    Locked,
    Encrypted,
}

/// Per-tunnel cryptographic material. Cleared in full on tunnel exit or
/// reset, never carried over to the next tunnel.
#[derive(Default)]
pub struct TunnelKeys {
    pub keypair: Option<KeyPair>,
    pub peer_public: Option<[u8; 32]>,
    pub psk_hash: Option<[u8; 32]>,
    pub shared_secret: Option<[u8; 32]>,
    pub session_key: Option<[u8; 32]>,
}

impl TunnelKeys {
    pub fn reset(&mut self) {
        *self = TunnelKeys::default();
    }
}
