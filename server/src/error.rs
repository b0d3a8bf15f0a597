use std::net::SocketAddr;
use std::path::PathBuf;

use thiserror::Error;

/// Startup-time failures: bad CLI argument combinations or a listener that
/// refused to bind. Everything here is fatal — the server exits non-zero
/// (spec.md §6 CLI exit-code contract).
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("--bind requires --invite-token")]
    BindRequiresInviteToken,
    #[error("--token-count ({token_count}) must be >= the number of --bind users ({bind_count})")]
    TokenCountBelowBindCount { token_count: usize, bind_count: usize },
    #[error("--tls-cert and --tls-key must both be given, or neither")]
    IncompleteTlsConfig,
    #[error("invalid TLS certificate/key at {cert:?} / {key:?}: {source}")]
    TlsConfig {
        cert: PathBuf,
        key: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to bind listener on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}
