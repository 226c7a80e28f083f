use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use crate::asset::AssetId;

/// Set of asset ids currently undergoing a completion check.
///
/// Presence in the set is the sole mutual-exclusion mechanism shared by the
/// check queue, the periodic sweep, and manual re-check triggers: at most one
/// check may be in flight per asset at any instant. The set serializes
/// *checks*, not record writes - writes are idempotent and monotonic, so they
/// need no broader lock.
pub struct ActiveChecks {
    inner: Mutex<HashSet<AssetId>>,
}

impl ActiveChecks {
    pub fn new() -> Self {
        ActiveChecks {
            inner: Mutex::new(HashSet::new()),
        }
    }

    /// Attempt to claim an id for checking. Returns false when some other
    /// check already holds it.
    pub fn try_acquire(&self, id: AssetId) -> bool {
        self.inner.lock().unwrap().insert(id)
    }

    /// Release a previously claimed id. Releasing an id that is not held is
    /// a no-op.
    pub fn release(&self, id: AssetId) {
        self.inner.lock().unwrap().remove(&id);
    }

    pub fn is_locked(&self, id: AssetId) -> bool {
        self.inner.lock().unwrap().contains(&id)
    }

    /// RAII acquisition: the returned guard releases the id when dropped, on
    /// every exit path. `None` means the id is already being checked.
    pub fn guard(self: &Arc<Self>, id: AssetId) -> Option<CheckGuard> {
        if self.try_acquire(id) {
            Some(CheckGuard {
                set: Arc::clone(self),
                id,
            })
        } else {
            None
        }
    }
}

impl Default for ActiveChecks {
    fn default() -> Self {
        Self::new()
    }
}

/// Holds an entry in the active-check set for the duration of one check.
pub struct CheckGuard {
    set: Arc<ActiveChecks>,
    id: AssetId,
}

impl Drop for CheckGuard {
    fn drop(&mut self) {
        self.set.release(self.id);
    }
}
