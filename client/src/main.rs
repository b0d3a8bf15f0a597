//! # Secure Chat Relay Client
//!
//! Connects to a relay server, registers, and drives the connection/tunnel
//! state machine from local commands and inbound envelopes. The interactive
//! terminal UI (password masking, line history, colorized rendering) is out
//! of scope; this is a minimal line-oriented driver over [`StdinInputSource`].
//!
//! ## Modules
//!
//! - [`cli`] — command-line surface
//! - [`connection`] — WebSocket connect/register, outbound/inbound tasks
//! - [`session`] — the client connection/tunnel state machine
//! - [`state`] — state machine types and per-tunnel key material
//! - [`input`] — the single-input-task/`request_input` redesign
//! - [`error`] — client-local error type

mod cli;
mod connection;
mod error;
mod input;
mod session;
mod state;

use std::time::Duration;

use clap::Parser;
use tracing::{error, info};

use cli::Args;
use input::{InputKind, InputSource, StdinInputSource};
use session::SessionEvent;
use state::InputMode;

const CHAT_INPUT_TIMEOUT: Duration = Duration::from_secs(3600);
const PSK_INPUT_TIMEOUT: Duration = Duration::from_secs(15);

fn render(event: SessionEvent) {
    match event {
        SessionEvent::IncomingRequest { from, message } => {
            println!("[{from}] wants to connect: {message} (use /accept or /deny)")
        }
        SessionEvent::IncomingRequestRejected { from } => println!("(auto-declined {from}, already busy)"),
        SessionEvent::Accepted { by, message } => println!("{by} accepted: {message}"),
        SessionEvent::Denied { message } => println!("request denied: {message}"),
        SessionEvent::PeerBusy { message } => println!("peer busy: {message}"),
        SessionEvent::ValidatePrompt { message } => println!("{message} (enter the shared pre-shared key)"),
        SessionEvent::TunnelActive { peer } => println!("tunnel with {peer} is up, exchanging keys..."),
        SessionEvent::TunnelEncrypted => println!("end-to-end encryption established"),
        SessionEvent::TunnelFailed { message } => println!("tunnel failed: {message}"),
        SessionEvent::PeerLeftTunnel { message } => println!("{message}"),
        SessionEvent::PeerDisconnected { username, message } => println!("{username} disconnected: {message}"),
        SessionEvent::Broadcast { from, message } => println!("{from}: {message}"),
        SessionEvent::DecryptedMessage { from, message } => println!("(encrypted) {from}: {message}"),
        SessionEvent::CryptoFailure => println!("[dropped a message that failed to decrypt]"),
        SessionEvent::SystemMessage { message } => println!("* {message}"),
        SessionEvent::UserList { users } => println!("connected users: {}", users.join(", ")),
        SessionEvent::SystemResponse { need, info } => {
            println!("system response (need={need:?}): {info:?}")
        }
        SessionEvent::Error { message } => println!("error: {message}"),
        SessionEvent::Ignored => {}
    }
}

fn dispatch_command(session: &mut session::ClientSession, line: &str) {
    let result = if let Some(target) = line.strip_prefix("/connect ") {
        session.connect(target.trim().to_string())
    } else if line == "/accept" {
        session.accept()
    } else if line == "/deny" {
        session.deny()
    } else if line == "/exit_tunnel" {
        session.exit_tunnel()
    } else if line == "/list_users" {
        session.request_user_list();
        Ok(())
    } else if session.mode == InputMode::Encrypted {
        session.send_encrypted(line)
    } else if session.mode == InputMode::Locked {
        println!("still exchanging keys, hold on...");
        Ok(())
    } else {
        session.send_chat(line.to_string())
    };
    if let Err(e) = result {
        println!("error: {e}");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tunnel_client=info".into()),
        )
        .init();

    let args = Args::parse();
    let mut conn = connection::connect(&args.server, args.token.as_deref(), &args.username).await?;
    info!(username = %args.username, "ready");

    let input_source = StdinInputSource::new();

    loop {
        let (kind, timeout) = match conn.session.mode {
            InputMode::Psk => (InputKind::Psk, PSK_INPUT_TIMEOUT),
            InputMode::Locked => (InputKind::Chat, PSK_INPUT_TIMEOUT),
            InputMode::Chat | InputMode::Encrypted => (InputKind::Chat, CHAT_INPUT_TIMEOUT),
        };

        tokio::select! {
            envelope = conn.inbound.recv() => {
                match envelope {
                    Some(envelope) => render(conn.session.handle_envelope(envelope)),
                    None => {
                        error!("connection to relay closed");
                        break;
                    }
                }
            }
            line = input_source.request_input(kind, timeout) => {
                match line {
                    Ok(line) if line.is_empty() => {}
                    Ok(line) if kind == InputKind::Psk => {
                        if let Err(e) = conn.session.submit_psk(&line) {
                            println!("error: {e}");
                        }
                    }
                    Ok(line) => dispatch_command(&mut conn.session, &line),
                    Err(_) => continue,
                }
            }
        }
    }

    conn.close().await;
    Ok(())
}
