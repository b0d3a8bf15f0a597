//! Registration protocol (spec.md §4.3).
//!
//! Bounded by `REGISTRATION_TIMEOUT` total and `MAX_ATTEMPTS` malformed or
//! invalid-format submissions. "Taken", "blocked", and "wrong-bound-token"
//! rejections are re-prompted without counting against the attempt budget —
//! this keeps a user who mistypes a taken name from being kicked off.

use std::time::{Duration, Instant};

use axum::extract::ws::Message;
use futures::stream::Stream;
use futures::StreamExt;
use tunnel_protocol::{username, Body, Envelope};

use crate::state::{AppState, ClientTx, ConnectionId, InviteOutcome, Outbound};

pub const REGISTRATION_TIMEOUT: Duration = Duration::from_secs(10);
pub const MAX_ATTEMPTS: u32 = 4;

pub enum Outcome {
    Registered { username: String },
    Rejected,
}

fn reply_error(tx: &ClientTx, message: impl Into<String>) {
    let _ = tx.send(Outbound::Envelope(Envelope::from_server(Body::RegisterError {
        message: message.into(),
    })));
}

/// Drives one connection through the registration handshake.
///
/// `ws_stream` must yield the raw inbound frames of the connection; this
/// function only reads, leaving outbound delivery to the caller's `tx`/sink
/// pairing so the same channel keeps working once registration succeeds.
pub async fn run<S>(
    state: &AppState,
    conn_id: ConnectionId,
    tx: &ClientTx,
    ws_stream: &mut S,
    invite_token: Option<&str>,
) -> Outcome
where
    S: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    let deadline = Instant::now() + REGISTRATION_TIMEOUT;
    let mut attempts = 0u32;

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            reply_error(tx, "registration timed out");
            return Outcome::Rejected;
        }

        let text = match tokio::time::timeout(remaining, ws_stream.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => text,
            Ok(Some(Ok(Message::Close(_)))) | Ok(None) => return Outcome::Rejected,
            Ok(Some(Ok(_))) => continue,
            Ok(Some(Err(_))) => return Outcome::Rejected,
            Err(_) => {
                reply_error(tx, "registration timed out");
                return Outcome::Rejected;
            }
        };

        let envelope = match Envelope::try_from_json(&text) {
            Ok(envelope) => envelope,
            Err(_) => {
                attempts += 1;
                reply_error(tx, "malformed registration message");
                if attempts >= MAX_ATTEMPTS {
                    return Outcome::Rejected;
                }
                continue;
            }
        };

        let candidate = match envelope.body {
            Body::Register { username } => username,
            _ => {
                attempts += 1;
                reply_error(tx, "expected a register message");
                if attempts >= MAX_ATTEMPTS {
                    return Outcome::Rejected;
                }
                continue;
            }
        };

        if let Err(reason) = username::validate(&candidate) {
            attempts += 1;
            reply_error(tx, reason.to_string());
            if attempts >= MAX_ATTEMPTS {
                return Outcome::Rejected;
            }
            continue;
        }

        if state.is_registered(&candidate) {
            reply_error(tx, "username is already registered");
            continue;
        }
        if state.is_blocked(&candidate) {
            reply_error(tx, "username is blocked");
            continue;
        }
        if let Some(token) = invite_token {
            if let InviteOutcome::WrongBoundUser = state.check_invite_for_username(token, &candidate) {
                reply_error(tx, "invite token is bound to a different username");
                continue;
            }
        }

        state.register(conn_id, &candidate, tx.clone());
        if let Some(token) = invite_token {
            state.consume_invite(token);
        }
        let _ = tx.send(Outbound::Envelope(Envelope::from_server(Body::Register {
            username: candidate.clone(),
        })));
        return Outcome::Registered { username: candidate };
    }
}
