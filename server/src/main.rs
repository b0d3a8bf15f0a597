//! # Secure Chat Relay Server
//!
//! Mediates user registration, peer discovery, connection requests, and the
//! establishment of pairwise end-to-end encrypted tunnels. Once a tunnel is
//! validated the server relays opaque ciphertext between the two peers; it
//! never holds the session key.
//!
//! ## Modules
//!
//! - [`cli`] — command-line surface and invite-token generation
//! - [`auth`] — the HTTP 401 invite-token gate, checked pre-upgrade
//! - [`state`] — shared registry/blocked/pending/tunnels/invites tables
//! - [`registration`] — the timed, retry-bounded registration handshake
//! - [`handlers`] — WebSocket connection lifecycle and message dispatch
//! - [`sweeper`] — the ~1 Hz PSK-timeout and invite-expiry sweep
//! - [`error`] — startup-time error types

mod auth;
mod cli;
mod error;
mod handlers;
mod registration;
mod state;
mod sweeper;

use std::time::{Duration, Instant};

use axum::routing::get;
use axum::Router;
use clap::Parser;
use tower_http::cors::CorsLayer;
use tracing::info;

use cli::{Args, HostMode};
use state::AppState;

const DEFAULT_INVITE_TTL: Duration = Duration::from_secs(600);

fn seed_invites(state: &AppState, args: &Args) {
    let expiry = if args.no_expiry {
        None
    } else {
        Some(Instant::now() + DEFAULT_INVITE_TTL)
    };

    for username in &args.bind {
        let token = cli::generate_token();
        state.insert_invite(token.clone(), Some(username.clone()), expiry);
        println!("invite token for '{username}': {token}");
    }

    let unbound_count = args
        .token_count
        .map(|total| total.saturating_sub(args.bind.len()))
        .unwrap_or(0);
    for _ in 0..unbound_count {
        let token = cli::generate_token();
        state.insert_invite(token.clone(), None, expiry);
        println!("invite token (unbound): {token}");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tunnel_server=info".into()),
        )
        .init();

    let args = Args::parse();
    args.validate()?;

    if args.host == HostMode::Public {
        info!("--host public was requested, but the outbound public-tunnel helper is out of scope; binding locally only");
    }

    let state = AppState::new(args.invite_token);
    if args.invite_token {
        seed_invites(&state, &args);
    }

    tokio::spawn(sweeper::run(state.clone()));

    let app = Router::new()
        .route("/ws", get(handlers::ws_handler))
        .layer(CorsLayer::permissive())
        .with_state(state);

    let addr = args.bind_addr();

    if let Some((cert, key)) = args.tls_paths() {
        info!(%addr, "listening (TLS)");
        let tls_config = axum_server::tls_rustls::RustlsConfig::from_pem_file(cert, key)
            .await
            .map_err(|source| error::ServerError::TlsConfig {
                cert: cert.clone(),
                key: key.clone(),
                source,
            })?;
        axum_server::bind_rustls(addr, tls_config)
            .serve(app.into_make_service())
            .await
            .map_err(|source| error::ServerError::Bind { addr, source })?;
    } else {
        info!(%addr, "listening");
        axum_server::bind(addr)
            .serve(app.into_make_service())
            .await
            .map_err(|source| error::ServerError::Bind { addr, source })?;
    }

    Ok(())
}
