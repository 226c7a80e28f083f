use std::sync::Arc;

use log::{debug, info, warn};
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;

use crate::tracker::TrackerShared;

/// Periodic sweep over assets flagged `needs_retry`.
///
/// The check queue hands exhausted assets over with the flag set; this loop
/// re-attempts them outside the queue's attempt budget, one single lookup
/// per asset per tick, forever. There is deliberately no cap on sweep
/// attempts - a permanently missing derived file is retried at low frequency
/// until it appears or the asset is deleted.
///
/// The first tick fires right after the startup delay, covering assets that
/// finished degrading just before a reload.
pub(crate) async fn run_sweep_loop(
    shared: Arc<TrackerShared>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    tokio::select! {
        _ = tokio::time::sleep(shared.config.sweep.startup_delay()) => {}
        _ = shutdown_rx.recv() => return,
    }

    let mut interval = tokio::time::interval(shared.config.sweep.interval());
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                if !sweep_tick(&shared, &mut shutdown_rx).await {
                    return;
                }
            }
            _ = shutdown_rx.recv() => return,
        }
    }
}

/// One sweep pass. Returns false when shutdown interrupted the pass.
async fn sweep_tick(
    shared: &Arc<TrackerShared>,
    shutdown_rx: &mut broadcast::Receiver<()>,
) -> bool {
    let flagged = shared.store.flagged_ids();
    if flagged.is_empty() {
        return true;
    }
    debug!("Sweep: {} asset(s) flagged for retry", flagged.len());

    for id in flagged {
        let Some(photo) = shared.store.photo(id) else {
            continue;
        };
        // Resolved or deleted since the scan
        if !photo.needs_retry {
            continue;
        }
        // Whoever holds the lock (queue or an earlier tick) owns this check
        let Some(guard) = shared.locks.guard(id) else {
            debug!("Sweep: asset {} is mid-check, skipping", id);
            continue;
        };

        let found = shared.lookup.check(&photo.storage_path).await;
        if found.is_empty() {
            debug!("Sweep: asset {} still has no derived files", id);
        } else {
            shared.store.apply_resolved(id, &found);
            info!("Sweep: recovered {} derived URL(s) for asset {}", found.len(), id);
        }
        drop(guard);

        // Spread flagged assets out instead of bursting the backend
        tokio::select! {
            _ = tokio::time::sleep(shared.config.sweep.item_delay()) => {}
            _ = shutdown_rx.recv() => return false,
        }
    }

    true
}

/// One-shot backstop fired once after a long timeout from tracker start.
///
/// An asset with no derived URLs and no retry flag at this point was never
/// enqueued at all (e.g. the upload notification was lost). It gets the
/// original URL as a stand-in so consumers always have something to display.
/// The flag is *not* set: the asset fell outside the tracking path and the
/// sweep has no business with it.
pub(crate) async fn run_emergency_fallback(
    shared: Arc<TrackerShared>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    tokio::select! {
        _ = tokio::time::sleep(shared.config.fallback.delay()) => {}
        _ = shutdown_rx.recv() => return,
    }

    let stranded = shared.store.untracked_ids();
    if stranded.is_empty() {
        debug!("Emergency fallback: all assets are tracked, nothing to do");
        return;
    }

    warn!(
        "Emergency fallback: {} asset(s) never reached the check queue",
        stranded.len()
    );
    for id in stranded {
        if shared.store.apply_fallback(id, false) {
            info!("Emergency fallback: original URL stands in for asset {}", id);
        }
    }
}
