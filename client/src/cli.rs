//! Command-line surface for the chat client.

use clap::Parser;

/// Secure end-to-end encrypted chat relay client.
#[derive(Parser, Debug)]
#[command(name = "tunnel-client", about = "Secure end-to-end chat relay client")]
pub struct Args {
    /// WebSocket URL of the relay server, e.g. ws://127.0.0.1:8765/ws.
    #[arg(long)]
    pub server: String,

    /// Username to register under.
    #[arg(long)]
    pub username: String,

    /// Invite token, required if the server was started with `--invite-token`.
    #[arg(long)]
    pub token: Option<String>,
}
