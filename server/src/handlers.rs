//! # WebSocket Handlers
//!
//! The connection lifecycle (upgrade → registration → dispatch loop →
//! cleanup) and the per-message-type mediation logic of spec.md §4.2.

use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tunnel_protocol::{Body, Envelope};
use uuid::Uuid;

use crate::auth;
use crate::registration;
use crate::state::{AppState, Outbound};

const VALIDATION_TIMEOUT: Duration = Duration::from_secs(10);

/// `GET /ws` — gated by the invite-token check, then upgraded.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Response {
    match auth::authorize(&state, &headers) {
        Ok(invite_token) => ws
            .on_upgrade(move |socket| handle_connection(socket, state, invite_token))
            .into_response(),
        Err(status) => status.into_response(),
    }
}

async fn handle_connection(socket: WebSocket, state: AppState, invite_token: Option<String>) {
    let conn_id = Uuid::new_v4();
    info!(%conn_id, "new connection");

    let (mut ws_sink, mut ws_stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();

    let outbound_task = tokio::spawn(async move {
        while let Some(item) = rx.recv().await {
            match item {
                Outbound::Envelope(envelope) => {
                    if ws_sink.send(Message::Text(envelope.to_json().into())).await.is_err() {
                        break;
                    }
                }
                Outbound::Close => {
                    let _ = ws_sink.close().await;
                    break;
                }
            }
        }
    });

    let outcome = registration::run(
        &state,
        conn_id,
        &tx,
        &mut ws_stream,
        invite_token.as_deref(),
    )
    .await;

    let username = match outcome {
        registration::Outcome::Registered { username } => username,
        registration::Outcome::Rejected => {
            drop(tx);
            let _ = tokio::time::timeout(Duration::from_secs(2), outbound_task).await;
            return;
        }
    };
    info!(%conn_id, %username, "registered");

    while let Some(frame) = ws_stream.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                let envelope = Envelope::from_json(&text);
                dispatch(&state, &username, &tx, envelope).await;
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(_) => break,
        }
    }

    info!(%conn_id, %username, "disconnecting");
    drop(tx);
    let _ = tokio::time::timeout(Duration::from_secs(2), outbound_task).await;

    if let Some(username) = state.remove_connection(conn_id) {
        state.remove_tunnel_containing(&username);
        state.broadcast_excluding_tunneled(
            &username,
            &Envelope::from_server(Body::UserDisconnected {
                username: username.clone(),
                message: format!("{username} disconnected"),
            }),
        );
    }
}

fn decode_psk_hash(secret_b64: &str) -> Option<[u8; 32]> {
    let bytes = BASE64.decode(secret_b64).ok()?;
    bytes.try_into().ok()
}

/// Handles a single post-registration message from `sender`, per spec.md
/// §4.2. `sender` is always the connection's own registered username, never
/// whatever the inbound envelope's `sender` field claims — forwarded
/// envelopes are rebuilt with the authoritative username.
async fn dispatch(state: &AppState, sender: &str, tx: &mpsc::UnboundedSender<Outbound>, envelope: Envelope) {
    match envelope.body {
        Body::ConnectRequest { target, message } => {
            if !state.is_registered(&target) {
                let _ = tx.send(Outbound::Envelope(Envelope::from_server(Body::ConnectError {
                    message: format!("user '{target}' is not registered"),
                })));
                return;
            }
            info!(%sender, %target, "connect request");
            state.send_to(
                &target,
                Envelope::new(sender, Body::ConnectRequest { target, message }),
            );
        }

        Body::ConnectBusy { target, message } => {
            state.send_to(&target, Envelope::new(sender, Body::ConnectBusy { target, message }));
        }

        Body::ConnectDeny { target, message } => {
            state.send_to(&target, Envelope::new(sender, Body::ConnectDeny { target, message }));
        }

        Body::ConnectAccept { target, message } => {
            let requester = target.clone();
            let responder = sender.to_string();
            info!(%requester, %responder, "connect accepted, starting PSK validation");
            state.send_to(
                &requester,
                Envelope::new(sender, Body::ConnectAccept { target, message }),
            );

            state.insert_pending(&requester, &responder, Instant::now() + VALIDATION_TIMEOUT);
            let prompt = Envelope::from_server(Body::TunnelValidate {
                message: "submit your pre-shared key".to_string(),
            });
            state.send_to(&requester, prompt.clone());
            state.send_to(&responder, prompt);
        }

        Body::TunnelSecret { secret } => {
            let Some(hash) = decode_psk_hash(&secret) else {
                warn!(%sender, "tunnel_secret with unparsable hash");
                return;
            };
            let Some(outcome) = state.submit_secret(sender, hash) else {
                return;
            };
            state.remove_pending(&outcome.pair);
            let (a, b) = &outcome.pair;
            if outcome.matched {
                info!(peer_a = %a, peer_b = %b, "tunnel validated");
                state.insert_tunnel(a, b);
                let ok = Envelope::from_server(Body::TunnelOkKeyInit {
                    message: "tunnel validated".to_string(),
                });
                state.send_to(a, ok.clone());
                state.send_to(b, ok);
            } else {
                info!(peer_a = %a, peer_b = %b, "PSK mismatch, blocking both");
                state.block(a);
                state.block(b);
                let failed = Envelope::from_server(Body::TunnelFailed {
                    message: "pre-shared key mismatch".to_string(),
                });
                state.send_to(a, failed.clone());
                state.send_to(b, failed);
                state.close(a);
                state.close(b);
            }
        }

        Body::KeyShare { target, key, message } => {
            if !state.is_registered(&target) {
                let _ = tx.send(Outbound::Envelope(Envelope::from_server(Body::ConnectError {
                    message: format!("user '{target}' is not registered"),
                })));
                return;
            }
            state.send_to(&target, Envelope::new(sender, Body::KeyShare { target, key, message }));
        }

        Body::EncryptedMessage { target, payload_b64 } => {
            if !state.tunnel_contains(sender, &target) {
                let _ = tx.send(Outbound::Envelope(Envelope::from_server(Body::ConnectError {
                    message: "no active tunnel with that user".to_string(),
                })));
                return;
            }
            state.send_to(
                &target,
                Envelope::new(sender, Body::EncryptedMessage { target, payload_b64 }),
            );
        }

        Body::TunnelExit { target, message } => {
            info!(%sender, %target, "tunnel exit");
            state.send_to(&target, Envelope::new(sender, Body::TunnelExit { target, message }));
            state.remove_tunnel_containing(sender);
        }

        Body::SystemRequest { need } if need == "list_users" => {
            let users = state.usernames_snapshot();
            let _ = tx.send(Outbound::Envelope(Envelope::from_server(Body::SystemResponse {
                response_need: Some(need),
                res_info: Some(serde_json::json!(users)),
            })));
        }

        Body::ChatMessage { message } => {
            state.broadcast_excluding_tunneled(sender, &Envelope::new(sender, Body::ChatMessage { message }));
        }

        // Protocol errors (message valid but inappropriate here) are
        // silently ignored, per spec.md §7 item 3.
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tunnel_protocol::crypto;

    fn channel() -> (mpsc::UnboundedSender<Outbound>, mpsc::UnboundedReceiver<Outbound>) {
        mpsc::unbounded_channel()
    }

    fn recv_envelope(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> Envelope {
        match rx.try_recv().expect("expected a queued message") {
            Outbound::Envelope(envelope) => envelope,
            Outbound::Close => panic!("expected an envelope, got a close directive"),
        }
    }

    fn register(state: &AppState, username: &str) -> (Uuid, mpsc::UnboundedSender<Outbound>, mpsc::UnboundedReceiver<Outbound>) {
        let conn_id = Uuid::new_v4();
        let (tx, rx) = channel();
        state.register(conn_id, username, tx.clone());
        (conn_id, tx, rx)
    }

    #[tokio::test]
    async fn connect_request_is_forwarded_with_authoritative_sender() {
        let state = AppState::new(false);
        let (_, _alice_tx, _alice_rx) = register(&state, "alice");
        let (_, bob_tx, mut bob_rx) = register(&state, "bob");

        dispatch(
            &state,
            "alice",
            &bob_tx,
            Envelope::new(
                "alice",
                Body::ConnectRequest {
                    target: "bob".to_string(),
                    message: "hi".to_string(),
                },
            ),
        )
        .await;

        let forwarded = recv_envelope(&mut bob_rx);
        assert_eq!(forwarded.sender, "alice");
        match forwarded.body {
            Body::ConnectRequest { target, .. } => assert_eq!(target, "bob"),
            other => panic!("unexpected body: {other:?}"),
        }
    }

    #[tokio::test]
    async fn connect_request_to_unregistered_target_gets_connect_error() {
        let state = AppState::new(false);
        let (_, alice_tx, mut alice_rx) = register(&state, "alice");

        dispatch(
            &state,
            "alice",
            &alice_tx,
            Envelope::new(
                "alice",
                Body::ConnectRequest {
                    target: "ghost".to_string(),
                    message: "hi".to_string(),
                },
            ),
        )
        .await;

        let reply = recv_envelope(&mut alice_rx);
        assert!(matches!(reply.body, Body::ConnectError { .. }));
    }

    #[tokio::test]
    async fn matching_psk_hashes_open_a_tunnel() {
        let state = AppState::new(false);
        let (_, _, mut alice_rx) = register(&state, "alice");
        let (_, bob_tx, mut bob_rx) = register(&state, "bob");

        state.insert_pending("alice", "bob", Instant::now() + Duration::from_secs(10));
        let hash = crypto::hash_psk("swordfish");

        dispatch(&state, "alice", &bob_tx, tunnel_secret(&hash)).await;
        dispatch(&state, "bob", &bob_tx, tunnel_secret(&hash)).await;

        assert!(state.tunnel_contains("alice", "bob"));
        assert!(matches!(recv_envelope(&mut alice_rx).body, Body::TunnelOkKeyInit { .. }));
        assert!(matches!(recv_envelope(&mut bob_rx).body, Body::TunnelOkKeyInit { .. }));
    }

    #[tokio::test]
    async fn mismatched_psk_hashes_block_and_close_both() {
        let state = AppState::new(false);
        let (_, _, mut alice_rx) = register(&state, "alice");
        let (_, bob_tx, mut bob_rx) = register(&state, "bob");

        state.insert_pending("alice", "bob", Instant::now() + Duration::from_secs(10));

        dispatch(&state, "alice", &bob_tx, tunnel_secret(&crypto::hash_psk("a"))).await;
        dispatch(&state, "bob", &bob_tx, tunnel_secret(&crypto::hash_psk("b"))).await;

        assert!(!state.tunnel_contains("alice", "bob"));
        assert!(state.is_blocked("alice"));
        assert!(state.is_blocked("bob"));

        assert!(matches!(recv_envelope(&mut alice_rx).body, Body::TunnelFailed { .. }));
        assert!(matches!(alice_rx.try_recv(), Ok(Outbound::Close)));
        assert!(matches!(recv_envelope(&mut bob_rx).body, Body::TunnelFailed { .. }));
        assert!(matches!(bob_rx.try_recv(), Ok(Outbound::Close)));
    }

    fn tunnel_secret(hash: &[u8; 32]) -> Envelope {
        Envelope::new(
            "unused",
            Body::TunnelSecret {
                secret: BASE64.encode(hash),
            },
        )
    }

    #[tokio::test]
    async fn chat_message_excludes_tunneled_peers() {
        let state = AppState::new(false);
        let (_, _, mut alice_rx) = register(&state, "alice");
        let (_, _, mut bob_rx) = register(&state, "bob");
        let (_, carol_tx, _carol_rx) = register(&state, "carol");
        state.insert_tunnel("alice", "bob");

        dispatch(
            &state,
            "carol",
            &carol_tx,
            Envelope::new("carol", Body::ChatMessage { message: "hi all".to_string() }),
        )
        .await;

        assert!(alice_rx.try_recv().is_err());
        assert!(bob_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn encrypted_message_requires_an_active_tunnel() {
        let state = AppState::new(false);
        let (_, alice_tx, mut alice_rx) = register(&state, "alice");
        let (_, _, _bob_rx) = register(&state, "bob");

        dispatch(
            &state,
            "alice",
            &alice_tx,
            Envelope::new(
                "alice",
                Body::EncryptedMessage {
                    target: "bob".to_string(),
                    payload_b64: "does-not-matter".to_string(),
                },
            ),
        )
        .await;

        assert!(matches!(recv_envelope(&mut alice_rx).body, Body::ConnectError { .. }));
    }
}
