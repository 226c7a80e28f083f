use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;

use tokio::sync::Notify;

use crate::asset::AssetId;

/// One queued completion check. Local to the queue, never persisted; the
/// attempt counter drives the give-up policy.
#[derive(Debug, Clone, Copy)]
pub(crate) struct QueueItem {
    pub asset_id: AssetId,
    pub attempts: u32,
}

struct PendingState {
    items: VecDeque<QueueItem>,
    // Mirrors `items` for O(1) duplicate detection on enqueue
    ids: HashSet<AssetId>,
}

/// FIFO of assets awaiting a completion check.
///
/// Holds no policy beyond duplicate suppression: batching, concurrency caps,
/// delays and attempt budgets live in the drain loop. On process restart the
/// queue starts empty; the sweep and the emergency fallback recover anything
/// that was in flight, driven by the persisted `needs_retry` flags.
pub(crate) struct CheckQueue {
    pending: Mutex<PendingState>,
    wake: Notify,
}

impl CheckQueue {
    pub fn new() -> Self {
        CheckQueue {
            pending: Mutex::new(PendingState {
                items: VecDeque::new(),
                ids: HashSet::new(),
            }),
            wake: Notify::new(),
        }
    }

    /// Queue a fresh check. Returns false when the asset is already queued;
    /// callers handle the locked and resolved cases before calling.
    pub fn push_new(&self, asset_id: AssetId) -> bool {
        {
            let mut pending = self.pending.lock().unwrap();
            if !pending.ids.insert(asset_id) {
                return false;
            }
            pending.items.push_back(QueueItem {
                asset_id,
                attempts: 0,
            });
        }
        self.wake.notify_one();
        true
    }

    /// Re-queue an item after a failed attempt. Callers invoke this while
    /// still holding the asset's check lock, so a racing `push_new` cannot
    /// slip in between the failed check and the re-queue; if an entry
    /// somehow exists anyway, the retry is dropped in its favor.
    pub fn push_retry(&self, item: QueueItem) {
        {
            let mut pending = self.pending.lock().unwrap();
            if !pending.ids.insert(item.asset_id) {
                return;
            }
            pending.items.push_back(item);
        }
        self.wake.notify_one();
    }

    /// Remove up to `max` items as one batch. Batch size is capped
    /// independently of queue length.
    pub fn pop_batch(&self, max: usize) -> Vec<QueueItem> {
        let mut pending = self.pending.lock().unwrap();
        let take = max.min(pending.items.len());
        let mut batch = Vec::with_capacity(take);
        for _ in 0..take {
            if let Some(item) = pending.items.pop_front() {
                pending.ids.remove(&item.asset_id);
                batch.push(item);
            }
        }
        batch
    }

    pub fn is_queued(&self, asset_id: AssetId) -> bool {
        self.pending.lock().unwrap().ids.contains(&asset_id)
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().unwrap().items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pending.lock().unwrap().items.len()
    }

    /// Wait until something is queued. A push that happened before this call
    /// is not lost - the notify permit is stored.
    pub async fn wait_for_work(&self) {
        self.wake.notified().await;
    }
}
