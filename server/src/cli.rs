//! Command-line surface (spec.md §6).

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use rand::distributions::Alphanumeric;
use rand::Rng;

use crate::error::ServerError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum HostMode {
    Local,
    Public,
}

/// Secure chat relay server.
#[derive(Parser, Debug)]
#[command(name = "tunnel-server", about = "Secure end-to-end chat relay server")]
pub struct Args {
    /// Whether to bind for local-only access or to advertise a public endpoint.
    #[arg(long, value_enum)]
    pub host: HostMode,

    /// Port to listen on.
    #[arg(long, default_value_t = 8765)]
    pub port: u16,

    /// Require a valid invite token in the WebSocket handshake's
    /// `Authorization` header before the upgrade completes.
    #[arg(long)]
    pub invite_token: bool,

    /// Pre-create a token bound to each given username (requires `--invite-token`).
    #[arg(long, num_args = 0.., value_name = "USERNAME")]
    pub bind: Vec<String>,

    /// Additionally create unbound tokens, for a total issued count of at
    /// least this many (must be >= the number of `--bind` users).
    #[arg(long, value_name = "N")]
    pub token_count: Option<usize>,

    /// Disable the default 10-minute invite-token expiry.
    #[arg(long)]
    pub no_expiry: bool,

    /// TLS certificate (PEM). Must be given together with `--tls-key`.
    #[arg(long)]
    pub tls_cert: Option<PathBuf>,

    /// TLS private key (PEM). Must be given together with `--tls-cert`.
    #[arg(long)]
    pub tls_key: Option<PathBuf>,
}

impl Args {
    pub fn validate(&self) -> Result<(), ServerError> {
        if !self.bind.is_empty() && !self.invite_token {
            return Err(ServerError::BindRequiresInviteToken);
        }
        if let Some(token_count) = self.token_count {
            if token_count < self.bind.len() {
                return Err(ServerError::TokenCountBelowBindCount {
                    token_count,
                    bind_count: self.bind.len(),
                });
            }
        }
        if self.tls_cert.is_some() != self.tls_key.is_some() {
            return Err(ServerError::IncompleteTlsConfig);
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> SocketAddr {
        match self.host {
            HostMode::Local => SocketAddr::from(([127, 0, 0, 1], self.port)),
            HostMode::Public => SocketAddr::from(([0, 0, 0, 0], self.port)),
        }
    }

    pub fn tls_paths(&self) -> Option<(&PathBuf, &PathBuf)> {
        match (&self.tls_cert, &self.tls_key) {
            (Some(cert), Some(key)) => Some((cert, key)),
            _ => None,
        }
    }
}

/// Generates a single-use invite token, following the original's practice of
/// printing freshly minted tokens for an operator to hand out out-of-band.
pub fn generate_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(24)
        .map(char::from)
        .collect()
}
