//! Optional background key-health sweep (§4.2a). Off by default; never
//! load-bearing for the selection algorithm's correctness, only a way
//! to catch disabled/expired keys before a client request hits them.
//!
//! Grounded on the teacher's `discovery::poller::run_poller` — same
//! run-immediately-then-interval shape, narrowed to a lightweight probe
//! per key instead of a full usage scan.

use std::sync::Arc;
use std::time::Duration;

use tokio::time;
use tracing::{info, warn};

use super::Pool;

/// Runs until the process exits. Call from `main` only when
/// `keyHealthSweep` is enabled in configuration.
pub async fn run_sweep(pool: Arc<Pool>, interval: Duration) {
    info!("key health sweep starting");
    sweep_once(&pool).await;

    let mut ticker = time::interval(interval);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        sweep_once(&pool).await;
    }
}

async fn sweep_once(pool: &Pool) {
    for key in pool.list() {
        if key.is_disabled() {
            continue;
        }
        match probe_key(key).await {
            Ok(()) => pool.update_checked(key).await,
            Err(e) => warn!(key_hash = %key.hash(), error = %e, "key health probe failed"),
        }
    }
}

/// Placeholder health check: a real deployment would call each
/// provider's lightweight models-list or usage endpoint. Kept
/// deliberately minimal here since the spec carries no endpoint table
/// for this — the sweep's contract is "feeds `disable`/`update`", not
/// any particular wire call.
async fn probe_key(key: &super::Key) -> anyhow::Result<()> {
    let _ = key.secret.expose();
    Ok(())
}
