//! Connects to the relay, completes registration, and then exposes a raw
//! inbound-envelope stream plus an outbound queue, following the shape of
//! the teacher's `run_agent_loop` (split socket, spawned outbound sender,
//! inbound dispatch loop) minus auto-reconnect and heartbeat — this
//! protocol has neither.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tracing::{info, warn};
use tunnel_protocol::{Body, Envelope};

use crate::error::ClientError;
use crate::session::ClientSession;

const REGISTRATION_TIMEOUT: Duration = Duration::from_secs(10);

pub struct Connection {
    pub session: ClientSession,
    pub inbound: mpsc::UnboundedReceiver<Envelope>,
    outbound_task: tokio::task::JoinHandle<()>,
    inbound_task: tokio::task::JoinHandle<()>,
}

impl Connection {
    /// Shuts down the background tasks driving this connection. Safe to
    /// call more than once.
    pub async fn close(self) {
        self.outbound_task.abort();
        self.inbound_task.abort();
    }
}

/// Connects to `server_url`, presenting `authorization` (an invite token) in
/// the handshake if given, and completes registration as `username`.
pub async fn connect(server_url: &str, authorization: Option<&str>, username: &str) -> Result<Connection, ClientError> {
    let mut request = server_url
        .into_client_request()
        .map_err(|_| ClientError::Connect)?;
    if let Some(token) = authorization {
        let value = HeaderValue::from_str(token).map_err(|_| ClientError::Connect)?;
        request.headers_mut().insert(header::AUTHORIZATION, value);
    }

    let (ws_stream, _) = tokio_tungstenite::connect_async(request)
        .await
        .map_err(|_| ClientError::Connect)?;
    info!(%server_url, "connected to relay");

    let (mut ws_sink, mut ws_stream) = ws_stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();

    let register_envelope = Envelope::new(username, Body::Register { username: username.to_string() });
    ws_sink
        .send(Message::Text(register_envelope.to_json().into()))
        .await
        .map_err(|_| ClientError::Connect)?;

    let registration = tokio::time::timeout(REGISTRATION_TIMEOUT, async {
        loop {
            match ws_stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    let envelope = Envelope::from_json(&text);
                    match envelope.body {
                        Body::Register { .. } => return Ok(()),
                        Body::RegisterError { message } => return Err(ClientError::Registration(message)),
                        _ => continue,
                    }
                }
                Some(Ok(Message::Close(_))) | None => return Err(ClientError::Connect),
                Some(Ok(_)) => continue,
                Some(Err(_)) => return Err(ClientError::Connect),
            }
        }
    })
    .await
    .map_err(|_| ClientError::Connect)??;
    let _ = registration;
    info!(%username, "registered");

    // ── Outbound sender task ──
    let outbound_task = tokio::spawn(async move {
        while let Some(envelope) = rx.recv().await {
            if ws_sink.send(Message::Text(envelope.to_json().into())).await.is_err() {
                break;
            }
        }
    });

    // ── Inbound decode task ──
    // Only decodes frames into envelopes; the state machine itself runs on
    // the caller's task so it can be interleaved with local command input.
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<Envelope>();
    let inbound_task = tokio::spawn(async move {
        while let Some(frame) = ws_stream.next().await {
            match frame {
                Ok(Message::Text(text)) => {
                    if inbound_tx.send(Envelope::from_json(&text)).is_err() {
                        break;
                    }
                }
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    warn!("websocket read error: {e}");
                    break;
                }
            }
        }
    });

    let session = ClientSession::new(username.to_string(), tx);
    Ok(Connection {
        session,
        inbound: inbound_rx,
        outbound_task,
        inbound_task,
    })
}
