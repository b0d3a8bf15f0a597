//! Invite-token authorization gate (spec.md §6).
//!
//! Runs before the WebSocket upgrade completes. The original Python server
//! hooks this into `websockets`' `process_request`; axum has no direct
//! equivalent, so the check is done inline in [`crate::handlers::ws_handler`]
//! using the plain request headers.

use axum::http::{header, HeaderMap, StatusCode};

use crate::state::AppState;

/// Returns `Ok(Some(token))` if a token was required and presented (so the
/// caller can pass it on to the registration step), `Ok(None)` if the server
/// isn't running in invite-token mode, or `Err(401)` if a token was required
/// but missing or unrecognized.
pub fn authorize(state: &AppState, headers: &HeaderMap) -> Result<Option<String>, StatusCode> {
    if !state.invite_token_mode {
        return Ok(None);
    }
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    match token {
        Some(token) if state.token_exists(&token) => Ok(Some(token)),
        _ => Err(StatusCode::UNAUTHORIZED),
    }
}
