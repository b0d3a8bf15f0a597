//! # Server State
//!
//! Holds the shared application state for the relay server: the registry of
//! connected users, the blocked-username set, pending PSK validations, active
//! tunnel pairs, and the invite-token table (spec.md §3).
//!
//! All registries use [`DashMap`]/[`DashSet`] for lock-free concurrent
//! access, since every connected client is driven by its own task.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use dashmap::{DashMap, DashSet};
use tokio::sync::mpsc;
use tunnel_protocol::Envelope;
use uuid::Uuid;

/// A server-generated handle for one WebSocket connection. Distinct from the
/// username so the registry can be expressed as two maps kept in sync,
/// mirroring the original's `user_registry_by_id` / `_by_websocket` split.
pub type ConnectionId = Uuid;

/// Either an envelope to deliver, or a directive to close the connection
/// after flushing whatever is already queued ahead of it.
#[derive(Debug, Clone)]
pub enum Outbound {
    Envelope(Envelope),
    Close,
}

pub type ClientTx = mpsc::UnboundedSender<Outbound>;

#[derive(Clone)]
pub struct ConnectionHandle {
    pub username: String,
    pub tx: ClientTx,
}

/// An unordered pair of usernames, normalized so `(a, b)` and `(b, a)` hash
/// and compare equal.
pub type Pair = (String, String);

pub fn pair_key(a: &str, b: &str) -> Pair {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

pub struct PendingValidation {
    pub pair: Pair,
    pub secrets: HashMap<String, [u8; 32]>,
    pub deadline: Instant,
}

/// Outcome of a `tunnel_secret` submission once both sides have reported in.
pub struct SubmitOutcome {
    pub pair: Pair,
    pub matched: bool,
}

pub struct InviteToken {
    pub bound_username: Option<String>,
    pub expires_at: Option<Instant>,
}

pub enum InviteOutcome {
    Allowed,
    WrongBoundUser,
}

/// Shared application state, cloned and passed to each connection task.
#[derive(Clone)]
pub struct AppState {
    pub usernames: Arc<DashMap<String, ConnectionId>>,
    pub connections: Arc<DashMap<ConnectionId, ConnectionHandle>>,
    pub blocked: Arc<DashSet<String>>,
    pub pending: Arc<DashMap<Pair, PendingValidation>>,
    pub tunnels: Arc<DashSet<Pair>>,
    pub invites: Arc<DashMap<String, InviteToken>>,
    pub invite_token_mode: bool,
}

impl AppState {
    pub fn new(invite_token_mode: bool) -> Self {
        Self {
            usernames: Arc::new(DashMap::new()),
            connections: Arc::new(DashMap::new()),
            blocked: Arc::new(DashSet::new()),
            pending: Arc::new(DashMap::new()),
            tunnels: Arc::new(DashSet::new()),
            invites: Arc::new(DashMap::new()),
            invite_token_mode,
        }
    }

    // ── Registry ────────────────────────────────────────────────

    pub fn is_registered(&self, username: &str) -> bool {
        self.usernames.contains_key(username)
    }

    pub fn is_blocked(&self, username: &str) -> bool {
        self.blocked.contains(username)
    }

    pub fn register(&self, conn_id: ConnectionId, username: &str, tx: ClientTx) {
        self.usernames.insert(username.to_string(), conn_id);
        self.connections.insert(
            conn_id,
            ConnectionHandle {
                username: username.to_string(),
                tx,
            },
        );
    }

    /// Removes a disconnected connection, returning its username if it had
    /// completed registration before the stream ended.
    pub fn remove_connection(&self, conn_id: ConnectionId) -> Option<String> {
        let (_, handle) = self.connections.remove(&conn_id)?;
        self.usernames.remove(&handle.username);
        Some(handle.username)
    }

    fn tx_for(&self, username: &str) -> Option<ClientTx> {
        let conn_id = *self.usernames.get(username)?;
        Some(self.connections.get(&conn_id)?.tx.clone())
    }

    /// Sends an envelope to `username`, tolerating a racing disconnect by
    /// simply dropping the message (spec.md §5).
    pub fn send_to(&self, username: &str, envelope: Envelope) {
        if let Some(tx) = self.tx_for(username) {
            let _ = tx.send(Outbound::Envelope(envelope));
        }
    }

    /// Requests that `username`'s connection be closed once its outbound
    /// queue has drained.
    pub fn close(&self, username: &str) {
        if let Some(tx) = self.tx_for(username) {
            let _ = tx.send(Outbound::Close);
        }
    }

    pub fn usernames_snapshot(&self) -> Vec<String> {
        self.usernames.iter().map(|e| e.key().clone()).collect()
    }

    pub fn block(&self, username: &str) {
        self.blocked.insert(username.to_string());
    }

    // ── Tunnels ─────────────────────────────────────────────────

    pub fn is_tunneled(&self, username: &str) -> bool {
        self.tunnels
            .iter()
            .any(|pair| pair.0 == username || pair.1 == username)
    }

    pub fn insert_tunnel(&self, a: &str, b: &str) {
        self.tunnels.insert(pair_key(a, b));
    }

    pub fn tunnel_contains(&self, a: &str, b: &str) -> bool {
        self.tunnels.contains(&pair_key(a, b))
    }

    /// Removes the tunnel pair containing `username`, if any, returning it.
    pub fn remove_tunnel_containing(&self, username: &str) -> Option<Pair> {
        let key = self
            .tunnels
            .iter()
            .find(|p| p.0 == username || p.1 == username)
            .map(|p| p.clone());
        if let Some(k) = &key {
            self.tunnels.remove(k);
        }
        key
    }

    /// Sends `envelope` to every registered user except `exclude`, skipping
    /// anyone currently in a tunnel (spec.md §4.2 `chat_message` fan-out).
    pub fn broadcast_excluding_tunneled(&self, exclude: &str, envelope: &Envelope) {
        for entry in self.connections.iter() {
            let handle = entry.value();
            if handle.username == exclude {
                continue;
            }
            if self.is_tunneled(&handle.username) {
                continue;
            }
            let _ = handle.tx.send(Outbound::Envelope(envelope.clone()));
        }
    }

    // ── Pending validation ──────────────────────────────────────

    pub fn insert_pending(&self, a: &str, b: &str, deadline: Instant) {
        let key = pair_key(a, b);
        self.pending.insert(
            key.clone(),
            PendingValidation {
                pair: key,
                secrets: HashMap::new(),
                deadline,
            },
        );
    }

    fn pending_containing(&self, username: &str) -> Option<Pair> {
        self.pending
            .iter()
            .find(|e| e.key().0 == username || e.key().1 == username)
            .map(|e| e.key().clone())
    }

    /// Records `username`'s submitted PSK hash. Once both sides of the pair
    /// have submitted, returns the match outcome; otherwise `None`.
    pub fn submit_secret(&self, username: &str, hash: [u8; 32]) -> Option<SubmitOutcome> {
        let key = self.pending_containing(username)?;
        let mut entry = self.pending.get_mut(&key)?;
        entry.secrets.insert(username.to_string(), hash);
        if entry.secrets.len() < 2 {
            return None;
        }
        let matched = {
            let mut values = entry.secrets.values();
            let first = *values.next().expect("just confirmed len >= 2");
            values.all(|h| *h == first)
        };
        Some(SubmitOutcome { pair: key, matched })
    }

    pub fn remove_pending(&self, key: &Pair) {
        self.pending.remove(key);
    }

    pub fn expired_pending(&self, now: Instant) -> Vec<Pair> {
        self.pending
            .iter()
            .filter(|e| now >= e.deadline)
            .map(|e| e.key().clone())
            .collect()
    }

    // ── Invite tokens ───────────────────────────────────────────

    pub fn insert_invite(&self, token: String, bound_username: Option<String>, expires_at: Option<Instant>) {
        self.invites.insert(
            token,
            InviteToken {
                bound_username,
                expires_at,
            },
        );
    }

    /// Whether `token` currently exists and has not expired; used by the
    /// HTTP 401 gate before the WebSocket upgrade completes.
    pub fn token_exists(&self, token: &str) -> bool {
        match self.invites.get(token) {
            Some(entry) => match entry.expires_at {
                Some(exp) => Instant::now() < exp,
                None => true,
            },
            None => false,
        }
    }

    /// Checks whether `username` may redeem `token`. Assumes `token_exists`
    /// already passed at the HTTP layer.
    pub fn check_invite_for_username(&self, token: &str, username: &str) -> InviteOutcome {
        match self.invites.get(token) {
            Some(entry) => match &entry.bound_username {
                Some(bound) if bound != username => InviteOutcome::WrongBoundUser,
                _ => InviteOutcome::Allowed,
            },
            None => InviteOutcome::Allowed,
        }
    }

    pub fn consume_invite(&self, token: &str) {
        self.invites.remove(token);
    }

    pub fn purge_expired_invites(&self, now: Instant) {
        self.invites
            .retain(|_, entry| entry.expires_at.map_or(true, |exp| now < exp));
    }
}
