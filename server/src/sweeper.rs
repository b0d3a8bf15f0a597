//! Periodic timeout sweeper (spec.md §4.2).
//!
//! Runs at roughly 1 Hz: any `pending` PSK validation past its deadline is
//! treated exactly like a PSK mismatch (both peers blocked and closed), and
//! expired invite tokens are purged.

use std::time::{Duration, Instant};

use tracing::info;
use tunnel_protocol::{Body, Envelope};

use crate::state::AppState;

const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

pub async fn run(state: AppState) {
    let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
    loop {
        ticker.tick().await;
        let now = Instant::now();

        for (a, b) in state.expired_pending(now) {
            info!(peer_a = %a, peer_b = %b, "PSK validation timed out");
            state.remove_pending(&(a.clone(), b.clone()));
            state.block(&a);
            state.block(&b);
            let timeout_msg = Envelope::from_server(Body::TunnelFailed {
                message: "pre-shared key validation timed out".to_string(),
            });
            state.send_to(&a, timeout_msg.clone());
            state.send_to(&b, timeout_msg);
            state.close(&a);
            state.close(&b);
        }

        state.purge_expired_invites(now);
    }
}
