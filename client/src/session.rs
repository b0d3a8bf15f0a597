//! The client connection/tunnel state machine (spec.md §4.1), driven by
//! local commands and inbound envelopes from the relay.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::Value;
use tokio::sync::mpsc;
use tunnel_protocol::{crypto, Body, Envelope};

use crate::error::ClientError;
use crate::state::{ConnectionState, InputMode, TunnelKeys};

/// What happened as a result of handling one inbound envelope, for the UI
/// layer (out of scope here) to render.
#[derive(Debug)]
pub enum SessionEvent {
    IncomingRequest { from: String, message: String },
    IncomingRequestRejected { from: String },
    Accepted { by: String, message: String },
    Denied { message: String },
    PeerBusy { message: String },
    ValidatePrompt { message: String },
    TunnelActive { peer: String },
    TunnelEncrypted,
    TunnelFailed { message: String },
    PeerLeftTunnel { message: String },
    PeerDisconnected { username: String, message: String },
    Broadcast { from: String, message: String },
    DecryptedMessage { from: String, message: String },
    CryptoFailure,
    SystemMessage { message: String },
    UserList { users: Vec<String> },
    SystemResponse { need: Option<String>, info: Option<Value> },
    Error { message: String },
    Ignored,
}

pub struct ClientSession {
    pub username: String,
    pub state: ConnectionState,
    pub mode: InputMode,
    pub keys: TunnelKeys,
    outbound: mpsc::UnboundedSender<Envelope>,
}

impl ClientSession {
    pub fn new(username: String, outbound: mpsc::UnboundedSender<Envelope>) -> Self {
        Self {
            username,
            state: ConnectionState::Idle,
            mode: InputMode::Chat,
            keys: TunnelKeys::default(),
            outbound,
        }
    }

    fn send(&self, body: Body) {
        let _ = self.outbound.send(Envelope::new(&self.username, body));
    }

    fn reset_to_idle(&mut self) {
        self.state = ConnectionState::Idle;
        self.mode = InputMode::Chat;
        self.keys.reset();
    }

    // ── Local commands ──────────────────────────────────────────

    pub fn connect(&mut self, target: String) -> Result<(), ClientError> {
        if self.state != ConnectionState::Idle {
            return Err(ClientError::NotIdle);
        }
        if target == self.username {
            return Err(ClientError::SelfTarget);
        }
        self.send(Body::ConnectRequest {
            target: target.clone(),
            message: format!("{} wants to connect", self.username),
        });
        self.state = ConnectionState::RequestSent { target };
        Ok(())
    }

    pub fn accept(&mut self) -> Result<(), ClientError> {
        let target = match &self.state {
            ConnectionState::RequestReceived { target } => target.clone(),
            _ => return Err(ClientError::NoPendingRequest),
        };
        self.send(Body::ConnectAccept {
            target: target.clone(),
            message: "accepted".to_string(),
        });
        self.state = ConnectionState::WaitTunnelTrigger { target };
        Ok(())
    }

    pub fn deny(&mut self) -> Result<(), ClientError> {
        let target = match &self.state {
            ConnectionState::RequestReceived { target } | ConnectionState::RequestSent { target } => {
                target.clone()
            }
            _ => return Err(ClientError::NoPendingRequest),
        };
        self.send(Body::ConnectDeny {
            target,
            message: "denied".to_string(),
        });
        self.reset_to_idle();
        Ok(())
    }

    pub fn exit_tunnel(&mut self) -> Result<(), ClientError> {
        let target = match &self.state {
            ConnectionState::TunnelActive { target } => target.clone(),
            _ => return Err(ClientError::NoActiveTunnel),
        };
        self.send(Body::TunnelExit {
            target,
            message: "leaving tunnel".to_string(),
        });
        self.reset_to_idle();
        Ok(())
    }

    /// Submits a locally typed pre-shared key. Only valid while
    /// `mode == Psk`.
    pub fn submit_psk(&mut self, psk: &str) -> Result<(), ClientError> {
        if !matches!(self.state, ConnectionState::TunnelValidating { .. }) {
            return Err(ClientError::NotValidating);
        }
        let hash = crypto::hash_psk(psk);
        self.keys.psk_hash = Some(hash);
        self.send(Body::TunnelSecret {
            secret: BASE64.encode(hash),
        });
        Ok(())
    }

    pub fn send_chat(&mut self, message: String) -> Result<(), ClientError> {
        self.send(Body::ChatMessage { message });
        Ok(())
    }

    /// Sends end-to-end encrypted chat to the active tunnel peer. Requires
    /// `mode == Encrypted`: the ordering subtlety in spec.md §9 means a
    /// `TunnelActive` state with `mode == Locked` (key share not yet
    /// exchanged) must never be allowed to emit plaintext here.
    pub fn send_encrypted(&mut self, plaintext: &str) -> Result<(), ClientError> {
        let target = match &self.state {
            ConnectionState::TunnelActive { target } => target.clone(),
            _ => return Err(ClientError::NoActiveTunnel),
        };
        if self.mode != InputMode::Encrypted {
            return Err(ClientError::WrongInputMode);
        }
        let session_key = self.keys.session_key.ok_or(ClientError::NoSessionKey)?;
        let inner = Envelope::new(&self.username, Body::ChatMessage { message: plaintext.to_string() });
        let frame = crypto::encrypt(&session_key, inner.to_json().as_bytes());
        self.send(Body::EncryptedMessage {
            target,
            payload_b64: BASE64.encode(frame),
        });
        Ok(())
    }

    pub fn request_user_list(&self) {
        self.send(Body::SystemRequest {
            need: "list_users".to_string(),
        });
    }

    // ── Inbound envelopes ───────────────────────────────────────

    /// Advances the state machine on one inbound envelope and reports what
    /// happened. `envelope.sender` is trusted here because the server
    /// overwrites it with the authoritative username before forwarding.
    pub fn handle_envelope(&mut self, envelope: Envelope) -> SessionEvent {
        match envelope.body {
            Body::ConnectRequest { message, .. } => self.on_connect_request(envelope.sender, message),
            Body::ConnectAccept { message, .. } => self.on_connect_accept(envelope.sender, message),
            Body::ConnectDeny { message, .. } => {
                self.reset_to_idle();
                SessionEvent::Denied { message }
            }
            Body::ConnectBusy { message, .. } => {
                self.reset_to_idle();
                SessionEvent::PeerBusy { message }
            }
            Body::ConnectError { message } => {
                if matches!(self.state, ConnectionState::RequestSent { .. }) {
                    self.reset_to_idle();
                }
                SessionEvent::Error { message }
            }
            Body::TunnelValidate { message } => self.on_tunnel_validate(message),
            Body::TunnelOkKeyInit { message } => self.on_tunnel_ok_key_init(message),
            Body::TunnelFailed { message } => {
                self.reset_to_idle();
                SessionEvent::TunnelFailed { message }
            }
            Body::KeyShare { key, .. } => self.on_key_share(key),
            Body::EncryptedMessage { payload_b64, .. } => self.on_encrypted_message(envelope.sender, payload_b64),
            Body::TunnelExit { message, .. } => {
                self.reset_to_idle();
                SessionEvent::PeerLeftTunnel { message }
            }
            Body::UserDisconnected { username, message } => self.on_user_disconnected(username, message),
            Body::ChatMessage { message } => SessionEvent::Broadcast {
                from: envelope.sender,
                message,
            },
            Body::SystemMessage { message } => SessionEvent::SystemMessage { message },
            Body::SystemResponse { response_need, res_info } => {
                if response_need.as_deref() == Some("list_users") {
                    let users = res_info
                        .as_ref()
                        .and_then(Value::as_array)
                        .map(|values| {
                            values
                                .iter()
                                .filter_map(|v| v.as_str().map(str::to_string))
                                .collect()
                        })
                        .unwrap_or_default();
                    SessionEvent::UserList { users }
                } else {
                    SessionEvent::SystemResponse {
                        need: response_need,
                        info: res_info,
                    }
                }
            }
            Body::RegisterError { message } => SessionEvent::Error { message },
            _ => SessionEvent::Ignored,
        }
    }

    fn on_connect_request(&mut self, requester: String, message: String) -> SessionEvent {
        if self.state != ConnectionState::Idle {
            self.send(Body::ConnectBusy {
                target: requester.clone(),
                message: "busy with another connection".to_string(),
            });
            return SessionEvent::IncomingRequestRejected { from: requester };
        }
        self.state = ConnectionState::RequestReceived {
            target: requester.clone(),
        };
        SessionEvent::IncomingRequest { from: requester, message }
    }

    fn on_connect_accept(&mut self, acceptor: String, message: String) -> SessionEvent {
        if let ConnectionState::RequestSent { target } = &self.state {
            if *target == acceptor {
                self.state = ConnectionState::WaitTunnelTrigger { target: acceptor.clone() };
                return SessionEvent::Accepted { by: acceptor, message };
            }
        }
        SessionEvent::Ignored
    }

    fn on_tunnel_validate(&mut self, message: String) -> SessionEvent {
        let target = match &self.state {
            ConnectionState::WaitTunnelTrigger { target } => target.clone(),
            _ => return SessionEvent::Ignored,
        };
        self.state = ConnectionState::TunnelValidating { target };
        self.mode = InputMode::Psk;
        SessionEvent::ValidatePrompt { message }
    }

    fn on_tunnel_ok_key_init(&mut self, _message: String) -> SessionEvent {
        let target = match &self.state {
            ConnectionState::TunnelValidating { target } => target.clone(),
            _ => return SessionEvent::Ignored,
        };
        self.state = ConnectionState::TunnelActive { target: target.clone() };
        // Neutral, non-sending mode until the peer's key_share actually
        // arrives (spec.md §9 Open Question 1) — never assume "chat" here.
        self.mode = InputMode::Locked;

        let keypair = crypto::generate_keypair();
        let public_bytes = keypair.public_bytes();
        self.keys.keypair = Some(keypair);
        self.send(Body::KeyShare {
            target: target.clone(),
            key: BASE64.encode(public_bytes),
            message: "key exchange".to_string(),
        });
        SessionEvent::TunnelActive { peer: target }
    }

    fn on_key_share(&mut self, key_b64: String) -> SessionEvent {
        if !matches!(self.state, ConnectionState::TunnelActive { .. }) {
            return SessionEvent::Ignored;
        }
        let Some(keypair) = self.keys.keypair.take() else {
            return SessionEvent::Ignored;
        };
        let Ok(peer_public_bytes) = BASE64.decode(&key_b64) else {
            return SessionEvent::Error {
                message: "malformed key_share payload".to_string(),
            };
        };
        let Ok(peer_public): Result<[u8; 32], _> = peer_public_bytes.try_into() else {
            return SessionEvent::Error {
                message: "key_share public key was not 32 bytes".to_string(),
            };
        };
        let Some(psk_hash) = self.keys.psk_hash else {
            return SessionEvent::Error {
                message: "key_share arrived before a pre-shared key was derived".to_string(),
            };
        };

        let shared_secret = keypair.diffie_hellman(&peer_public);
        let session_key = crypto::derive_session_key(&shared_secret, &psk_hash);
        self.keys.peer_public = Some(peer_public);
        self.keys.shared_secret = Some(shared_secret);
        self.keys.session_key = Some(session_key);
        self.mode = InputMode::Encrypted;
        SessionEvent::TunnelEncrypted
    }

    fn on_encrypted_message(&mut self, _target_field_sender: String, payload_b64: String) -> SessionEvent {
        let Some(session_key) = self.keys.session_key else {
            return SessionEvent::Error {
                message: "received an encrypted message with no session key derived".to_string(),
            };
        };
        let Ok(frame) = BASE64.decode(&payload_b64) else {
            return SessionEvent::Error {
                message: "malformed encrypted payload".to_string(),
            };
        };
        match crypto::decrypt(&session_key, &frame) {
            Ok(plaintext) => {
                let inner = Envelope::from_json(&String::from_utf8_lossy(&plaintext));
                let message = match inner.body {
                    Body::ChatMessage { message } => message,
                    _ => String::from_utf8_lossy(&plaintext).to_string(),
                };
                SessionEvent::DecryptedMessage {
                    from: inner.sender,
                    message,
                }
            }
            // Per spec.md §4.4: a single bad frame is not a compromise
            // signal; the tunnel stays up.
            Err(_) => SessionEvent::CryptoFailure,
        }
    }

    fn on_user_disconnected(&mut self, username: String, message: String) -> SessionEvent {
        if self.state.target() == Some(username.as_str()) {
            self.reset_to_idle();
        }
        SessionEvent::PeerDisconnected { username, message }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> (ClientSession, mpsc::UnboundedReceiver<Envelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ClientSession::new("alice".to_string(), tx), rx)
    }

    #[test]
    fn connect_rejects_self_target() {
        let (mut session, _rx) = session();
        assert!(matches!(session.connect("alice".to_string()), Err(ClientError::SelfTarget)));
    }

    #[test]
    fn connect_rejects_when_not_idle() {
        let (mut session, _rx) = session();
        session.connect("bob".to_string()).unwrap();
        assert!(matches!(session.connect("carol".to_string()), Err(ClientError::NotIdle)));
    }

    #[test]
    fn incoming_request_while_busy_replies_busy_and_stays_in_current_state() {
        let (mut session, mut rx) = session();
        session.connect("bob".to_string()).unwrap();
        rx.try_recv().unwrap();

        let event = session.handle_envelope(Envelope::new(
            "carol",
            Body::ConnectRequest {
                target: "alice".to_string(),
                message: "hi".to_string(),
            },
        ));
        assert!(matches!(event, SessionEvent::IncomingRequestRejected { .. }));
        assert_eq!(session.state, ConnectionState::RequestSent { target: "bob".to_string() });
        match rx.try_recv().unwrap().body {
            Body::ConnectBusy { target, .. } => assert_eq!(target, "carol"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn full_handshake_reaches_encrypted_mode_and_round_trips_a_message() {
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        let mut alice = ClientSession::new("alice".to_string(), tx_a);
        let mut bob = ClientSession::new("bob".to_string(), tx_b);

        alice.connect("bob".to_string()).unwrap();
        rx_a.try_recv().unwrap();

        bob.handle_envelope(Envelope::new(
            "alice",
            Body::ConnectRequest { target: "bob".to_string(), message: "hi".to_string() },
        ));
        bob.accept().unwrap();
        rx_b.try_recv().unwrap();

        alice.handle_envelope(Envelope::new(
            "bob",
            Body::ConnectAccept { target: "alice".to_string(), message: "ok".to_string() },
        ));

        alice.handle_envelope(Envelope::from_server(Body::TunnelValidate {
            message: "submit psk".to_string(),
        }));
        bob.handle_envelope(Envelope::from_server(Body::TunnelValidate {
            message: "submit psk".to_string(),
        }));
        assert_eq!(alice.mode, InputMode::Psk);

        alice.submit_psk("swordfish").unwrap();
        rx_a.try_recv().unwrap();
        bob.submit_psk("swordfish").unwrap();
        rx_b.try_recv().unwrap();

        alice.handle_envelope(Envelope::from_server(Body::TunnelOkKeyInit {
            message: "go".to_string(),
        }));
        bob.handle_envelope(Envelope::from_server(Body::TunnelOkKeyInit {
            message: "go".to_string(),
        }));
        assert_eq!(alice.mode, InputMode::Locked);

        let alice_key_share = rx_a.try_recv().unwrap();
        let bob_key_share = rx_b.try_recv().unwrap();

        bob.handle_envelope(alice_key_share);
        alice.handle_envelope(bob_key_share);
        assert_eq!(alice.mode, InputMode::Encrypted);
        assert_eq!(bob.mode, InputMode::Encrypted);
        assert_eq!(alice.keys.session_key, bob.keys.session_key);

        alice.send_encrypted("hi bob").unwrap();
        let relayed = rx_a.try_recv().unwrap();
        let event = bob.handle_envelope(relayed);
        match event {
            SessionEvent::DecryptedMessage { from, message } => {
                assert_eq!(from, "alice");
                assert_eq!(message, "hi bob");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn locked_mode_refuses_to_send_encrypted_chat() {
        let (mut session, _rx) = session();
        session.state = ConnectionState::TunnelActive { target: "bob".to_string() };
        session.mode = InputMode::Locked;
        assert!(matches!(session.send_encrypted("hi"), Err(ClientError::WrongInputMode)));
    }

    #[test]
    fn user_disconnected_for_current_peer_resets_to_idle() {
        let (mut session, _rx) = session();
        session.state = ConnectionState::TunnelActive { target: "bob".to_string() };
        session.mode = InputMode::Encrypted;
        session.handle_envelope(Envelope::from_server(Body::UserDisconnected {
            username: "bob".to_string(),
            message: "bob disconnected".to_string(),
        }));
        assert_eq!(session.state, ConnectionState::Idle);
        assert_eq!(session.mode, InputMode::Chat);
    }
}
