use std::sync::{Arc, Mutex};

use log::{debug, info, warn};
use tokio::sync::broadcast;
use tokio::task::{JoinHandle, JoinSet};

use crate::asset::{AlbumId, AssetId};
use crate::config::TrackerConfig;
use crate::locks::ActiveChecks;
use crate::paths::{DerivedLookup, ObjectStore};
use crate::queue::{CheckQueue, QueueItem};
use crate::store::{AssetStore, PersistenceSink};
use crate::sweep;

/// State shared by the tracker's background tasks.
pub(crate) struct TrackerShared {
    pub(crate) config: TrackerConfig,
    pub(crate) store: Arc<AssetStore>,
    pub(crate) locks: Arc<ActiveChecks>,
    pub(crate) queue: CheckQueue,
    pub(crate) lookup: DerivedLookup,
}

/// Derived-asset completion tracker.
///
/// After an upload, the rendition pipeline writes derived files out-of-band
/// with no completion notification, so the tracker polls the object store
/// under bounded concurrency until every asset reaches a stable terminal
/// state: real derived URLs, or the original standing in as a degraded
/// fallback. It never blocks display and never issues two in-flight checks
/// for the same asset.
///
/// One instance per tenant session; `start()` spawns the background tasks
/// (queue drain, periodic sweep, emergency fallback, debounced persistence)
/// and `stop()` shuts them down and flushes.
pub struct AssetTracker {
    shared: Arc<TrackerShared>,
    sink: Arc<dyn PersistenceSink>,
    shutdown_tx: broadcast::Sender<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl AssetTracker {
    pub fn new(
        config: TrackerConfig,
        store: Arc<AssetStore>,
        object_store: Arc<dyn ObjectStore>,
        sink: Arc<dyn PersistenceSink>,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel::<()>(4);
        AssetTracker {
            shared: Arc::new(TrackerShared {
                config,
                store,
                locks: Arc::new(ActiveChecks::new()),
                queue: CheckQueue::new(),
                lookup: DerivedLookup::new(object_store),
            }),
            sink,
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn store(&self) -> &Arc<AssetStore> {
        &self.shared.store
    }

    /// Spawn the background tasks. Calling `start` twice is a no-op.
    pub fn start(&self) {
        let mut tasks = self.tasks.lock().unwrap();
        if !tasks.is_empty() {
            warn!("Tracker already started");
            return;
        }

        info!("Starting asset completion tracker");
        tasks.push(tokio::spawn(run_drain_loop(
            Arc::clone(&self.shared),
            self.shutdown_tx.subscribe(),
        )));
        tasks.push(tokio::spawn(sweep::run_sweep_loop(
            Arc::clone(&self.shared),
            self.shutdown_tx.subscribe(),
        )));
        tasks.push(tokio::spawn(sweep::run_emergency_fallback(
            Arc::clone(&self.shared),
            self.shutdown_tx.subscribe(),
        )));
        tasks.push(tokio::spawn(Arc::clone(&self.shared.store).run_flush_loop(
            Arc::clone(&self.sink),
            self.shared.config.persistence.debounce(),
            self.shutdown_tx.subscribe(),
        )));
    }

    /// Signal every background task and wait for them to finish. Outstanding
    /// lookups complete; their findings land in the store as usual. The
    /// persistence loop flushes once more before exiting.
    pub async fn stop(&self) {
        let handles: Vec<JoinHandle<()>> = {
            let mut tasks = self.tasks.lock().unwrap();
            tasks.drain(..).collect()
        };
        if handles.is_empty() {
            return;
        }

        info!("Stopping asset completion tracker");
        let _ = self.shutdown_tx.send(());
        for handle in handles {
            let _ = handle.await;
        }
        info!("Asset completion tracker stopped");
    }

    /// Notify the tracker that an asset may have derived files to check.
    ///
    /// Idempotent: an asset that is already queued, already mid-check, or
    /// already resolved is silently left alone - no duplicate work.
    pub fn enqueue(&self, asset_id: AssetId) {
        let Some(photo) = self.shared.store.photo(asset_id) else {
            warn!("Enqueue requested for unknown asset {}", asset_id);
            return;
        };
        if photo.is_resolved() {
            return;
        }
        if self.shared.queue.is_queued(asset_id) || self.shared.locks.is_locked(asset_id) {
            return;
        }
        if self.shared.queue.push_new(asset_id) {
            debug!("Asset {} queued for completion check", asset_id);
        }
    }

    /// Bulk form of `enqueue`, for batch uploads.
    pub fn enqueue_all<I>(&self, asset_ids: I)
    where
        I: IntoIterator<Item = AssetId>,
    {
        for id in asset_ids {
            self.enqueue(id);
        }
    }

    /// Manual refresh: re-check every unresolved asset in an album. Assets
    /// flagged `needs_retry` get a fresh full attempt budget.
    pub fn recheck_album(&self, album_id: AlbumId) {
        let ids = self.shared.store.album_photo_ids(album_id);
        info!("Re-checking {} asset(s) in album {}", ids.len(), album_id);
        self.enqueue_all(ids);
    }
}

/// Queue drain loop: pulls capped-size batches, checks each batch
/// concurrently, and waits a fixed delay between batches to bound load on
/// the object store. Batches never overlap in time; only checks within one
/// batch race each other.
async fn run_drain_loop(shared: Arc<TrackerShared>, mut shutdown_rx: broadcast::Receiver<()>) {
    loop {
        tokio::select! {
            _ = shared.queue.wait_for_work() => {}
            _ = shutdown_rx.recv() => break,
        }

        loop {
            let batch = shared.queue.pop_batch(shared.config.queue.max_concurrent());
            if batch.is_empty() {
                break;
            }
            debug!(
                "Checking batch of {} asset(s), {} still queued",
                batch.len(),
                shared.queue.len()
            );

            let mut checks = JoinSet::new();
            for item in batch {
                let shared = Arc::clone(&shared);
                checks.spawn(async move { check_one(&shared, item).await });
            }
            while checks.join_next().await.is_some() {}

            if shared.queue.is_empty() {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(shared.config.queue.batch_delay()) => {}
                _ = shutdown_rx.recv() => return,
            }
        }
    }
}

/// One completion check. Failures never escape: a lookup error counts as
/// not-ready and the asset either re-queues or degrades to fallback. The
/// check guard releases the lock on every path out.
async fn check_one(shared: &TrackerShared, item: QueueItem) {
    let Some(photo) = shared.store.photo(item.asset_id) else {
        debug!("Asset {} no longer exists, dropping check", item.asset_id);
        return;
    };

    // Another writer may have finished the job while this item sat queued
    if photo.is_resolved() {
        return;
    }

    // Contention is a silent skip: whoever holds the lock owns this round
    let Some(guard) = shared.locks.guard(item.asset_id) else {
        debug!("Asset {} is already being checked, skipping", item.asset_id);
        return;
    };

    let found = shared.lookup.check(&photo.storage_path).await;
    let attempt = item.attempts + 1;
    let max_attempts = shared.config.queue.max_attempts();

    if !found.is_empty() {
        shared.store.apply_resolved(item.asset_id, &found);
        info!(
            "Asset {} resolved {} derived URL(s) on attempt {}",
            item.asset_id,
            found.len(),
            attempt
        );
    } else if attempt < max_attempts {
        // Re-queue while still holding the lock so a racing enqueue cannot
        // double-book the asset
        shared.queue.push_retry(QueueItem {
            asset_id: item.asset_id,
            attempts: attempt,
        });
        debug!(
            "Asset {} not ready (attempt {} of {})",
            item.asset_id, attempt, max_attempts
        );
    } else {
        shared.store.apply_fallback(item.asset_id, true);
        info!(
            "Asset {} exhausted {} attempt(s); serving original until the sweep recovers it",
            item.asset_id, attempt
        );
    }

    drop(guard);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asset::{Album, DerivedKind, PhotoAsset};
    use crate::config::{FallbackConfig, PersistenceConfig, QueueConfig, SweepConfig};
    use crate::error::AssetPulseError;
    use crate::paths::derived_path;
    use crate::store::GallerySnapshot;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::time::Duration;

    /// Object store double with a switchable answer and per-path call counts.
    struct ScriptedStore {
        mode: Mutex<Mode>,
        calls: Mutex<HashMap<String, u32>>,
        latency: Duration,
    }

    #[derive(Clone, Copy)]
    enum Mode {
        NeverReady,
        AlwaysError,
        Ready,
    }

    impl ScriptedStore {
        fn new(mode: Mode) -> Arc<Self> {
            Arc::new(ScriptedStore {
                mode: Mutex::new(mode),
                calls: Mutex::new(HashMap::new()),
                latency: Duration::ZERO,
            })
        }

        fn with_latency(mode: Mode, latency: Duration) -> Arc<Self> {
            Arc::new(ScriptedStore {
                mode: Mutex::new(mode),
                calls: Mutex::new(HashMap::new()),
                latency,
            })
        }

        fn set_mode(&self, mode: Mode) {
            *self.mode.lock().unwrap() = mode;
        }

        fn calls_for(&self, path: &str) -> u32 {
            self.calls.lock().unwrap().get(path).copied().unwrap_or(0)
        }

        fn total_calls(&self) -> u32 {
            self.calls.lock().unwrap().values().sum()
        }
    }

    #[async_trait]
    impl crate::paths::ObjectStore for ScriptedStore {
        async fn resolve_url(&self, path: &str) -> Result<Option<String>, AssetPulseError> {
            if !self.latency.is_zero() {
                tokio::time::sleep(self.latency).await;
            }
            *self.calls.lock().unwrap().entry(path.to_string()).or_insert(0) += 1;
            match *self.mode.lock().unwrap() {
                Mode::NeverReady => Ok(None),
                Mode::AlwaysError => Err(AssetPulseError::Storage("bucket unreachable".into())),
                Mode::Ready => Ok(Some(format!("https://cdn/{}", path))),
            }
        }
    }

    struct NullSink;

    #[async_trait]
    impl PersistenceSink for NullSink {
        async fn save(&self, _snapshot: &GallerySnapshot) -> Result<(), AssetPulseError> {
            Ok(())
        }
    }

    /// Fast queue, sweep and fallback pushed far out so tests exercise one
    /// mechanism at a time.
    fn queue_only_config() -> TrackerConfig {
        TrackerConfig {
            queue: QueueConfig::new(4, 3, 100),
            sweep: SweepConfig::new(3600, 3600, 10),
            fallback: FallbackConfig::new(86_400),
            persistence: PersistenceConfig::new(50),
        }
    }

    fn tracker_with(
        config: TrackerConfig,
        object_store: Arc<ScriptedStore>,
    ) -> (AssetTracker, AssetId, String) {
        let store = Arc::new(AssetStore::new());
        let album = Album::new("Vacation");
        let photo = PhotoAsset::new(album.id, "https://cdn/orig.jpg", "u1/a1/orig.jpg");
        let id = photo.id;
        let storage_path = photo.storage_path.clone();
        store.insert_album(album);
        store.insert_photo(photo);

        let tracker = AssetTracker::new(config, store, object_store, Arc::new(NullSink));
        (tracker, id, storage_path)
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolves_when_derived_files_exist() {
        let object_store = ScriptedStore::new(Mode::Ready);
        let (tracker, id, storage_path) = tracker_with(queue_only_config(), object_store.clone());
        tracker.start();

        tracker.enqueue(id);
        tokio::time::sleep(Duration::from_secs(1)).await;

        let photo = tracker.store().photo(id).unwrap();
        assert!(photo.is_resolved());
        for kind in [DerivedKind::Optimized, DerivedKind::ThumbSmall, DerivedKind::ThumbMedium] {
            let expected = format!("https://cdn/{}", derived_path(&storage_path, kind));
            assert_eq!(photo.derived_url(kind), Some(expected.as_str()));
            assert_eq!(object_store.calls_for(&derived_path(&storage_path, kind)), 1);
        }

        tracker.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausts_after_exactly_max_attempts() {
        let object_store = ScriptedStore::new(Mode::NeverReady);
        let (tracker, id, storage_path) = tracker_with(queue_only_config(), object_store.clone());
        tracker.start();

        tracker.enqueue(id);
        tokio::time::sleep(Duration::from_secs(10)).await;

        // Exactly 3 lookups per derived path, then degraded fallback
        for kind in [DerivedKind::Optimized, DerivedKind::ThumbSmall, DerivedKind::ThumbMedium] {
            assert_eq!(object_store.calls_for(&derived_path(&storage_path, kind)), 3);
        }
        let photo = tracker.store().photo(id).unwrap();
        assert!(photo.needs_retry);
        for kind in [DerivedKind::Optimized, DerivedKind::ThumbSmall, DerivedKind::ThumbMedium] {
            assert_eq!(photo.derived_url(kind), Some("https://cdn/orig.jpg"));
        }

        // The queue is done with this asset; no further lookups happen
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(object_store.total_calls(), 9);

        tracker.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_enqueue_is_idempotent() {
        let object_store = ScriptedStore::new(Mode::Ready);
        let (tracker, id, storage_path) = tracker_with(queue_only_config(), object_store.clone());
        tracker.start();

        tracker.enqueue(id);
        tracker.enqueue(id);
        tracker.enqueue(id);
        tokio::time::sleep(Duration::from_secs(1)).await;

        let optimized = derived_path(&storage_path, DerivedKind::Optimized);
        assert_eq!(object_store.calls_for(&optimized), 1);

        // Enqueue on a resolved asset is a no-op
        tracker.enqueue(id);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(object_store.calls_for(&optimized), 1);

        tracker.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_enqueue_during_inflight_check_is_skipped() {
        let object_store =
            ScriptedStore::with_latency(Mode::Ready, Duration::from_secs(1));
        let (tracker, id, storage_path) = tracker_with(queue_only_config(), object_store.clone());
        tracker.start();

        tracker.enqueue(id);
        // Let the check start and park inside the store's latency
        tokio::time::sleep(Duration::from_millis(50)).await;
        tracker.enqueue(id);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(
            object_store.calls_for(&derived_path(&storage_path, DerivedKind::Optimized)),
            1
        );
        assert!(tracker.store().photo(id).unwrap().is_resolved());

        tracker.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_lookup_errors_degrade_and_release_lock() {
        let object_store = ScriptedStore::new(Mode::AlwaysError);
        let mut config = queue_only_config();
        config.queue = QueueConfig::new(4, 1, 100);
        let (tracker, id, _) = tracker_with(config, object_store.clone());
        tracker.start();

        tracker.enqueue(id);
        tokio::time::sleep(Duration::from_secs(1)).await;

        let photo = tracker.store().photo(id).unwrap();
        assert!(photo.needs_retry);
        assert_eq!(photo.derived_url(DerivedKind::Optimized), Some("https://cdn/orig.jpg"));
        // The lock did not leak: an immediate acquire succeeds
        assert!(tracker.shared.locks.try_acquire(id));
        tracker.shared.locks.release(id);

        tracker.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_recovers_degraded_asset() {
        let object_store = ScriptedStore::new(Mode::NeverReady);
        let config = TrackerConfig {
            queue: QueueConfig::new(4, 1, 100),
            sweep: SweepConfig::new(5, 1, 10),
            fallback: FallbackConfig::new(86_400),
            persistence: PersistenceConfig::new(50),
        };
        let (tracker, id, storage_path) = tracker_with(config, object_store.clone());
        tracker.start();

        tracker.enqueue(id);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(tracker.store().photo(id).unwrap().needs_retry);

        // The pipeline finally writes the derived files
        object_store.set_mode(Mode::Ready);
        tokio::time::sleep(Duration::from_secs(10)).await;

        let photo = tracker.store().photo(id).unwrap();
        assert!(!photo.needs_retry);
        assert!(photo.is_resolved());
        for kind in [DerivedKind::Optimized, DerivedKind::ThumbSmall, DerivedKind::ThumbMedium] {
            let expected = format!("https://cdn/{}", derived_path(&storage_path, kind));
            assert_eq!(photo.derived_url(kind), Some(expected.as_str()));
        }

        tracker.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_emergency_fallback_covers_untracked_assets() {
        let object_store = ScriptedStore::new(Mode::Ready);
        let config = TrackerConfig {
            queue: QueueConfig::new(4, 3, 100),
            sweep: SweepConfig::new(3600, 3600, 10),
            fallback: FallbackConfig::new(60),
            persistence: PersistenceConfig::new(50),
        };
        let (tracker, id, _) = tracker_with(config, object_store.clone());
        tracker.start();

        // Never enqueued - simulates a lost upload notification
        tokio::time::sleep(Duration::from_secs(70)).await;

        let photo = tracker.store().photo(id).unwrap();
        for kind in [DerivedKind::Optimized, DerivedKind::ThumbSmall, DerivedKind::ThumbMedium] {
            assert_eq!(photo.derived_url(kind), Some("https://cdn/orig.jpg"));
        }
        // A backstop, not a retry mechanism
        assert!(!photo.needs_retry);
        assert_eq!(object_store.total_calls(), 0);

        tracker.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_recheck_album_skips_resolved_assets() {
        let object_store = ScriptedStore::new(Mode::Ready);
        let (tracker, pending_id, _) = tracker_with(queue_only_config(), object_store.clone());

        let album_id = tracker.store().photo(pending_id).unwrap().album_id;
        let resolved = PhotoAsset::new(album_id, "https://cdn/r.jpg", "u1/a1/r.jpg");
        let resolved_id = resolved.id;
        let resolved_path = resolved.storage_path.clone();
        tracker.store().insert_photo(resolved);
        tracker.store().apply_resolved(
            resolved_id,
            &[(DerivedKind::Optimized, "https://cdn/r-optimized.webp".to_string())],
        );
        tracker.start();

        tracker.recheck_album(album_id);
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert!(tracker.store().photo(pending_id).unwrap().is_resolved());
        // The already-resolved asset produced no lookups
        assert_eq!(
            object_store.calls_for(&derived_path(&resolved_path, DerivedKind::Optimized)),
            0
        );

        tracker.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_bulk_enqueue_reaches_terminal_state_for_all() {
        let object_store = ScriptedStore::new(Mode::Ready);
        let config = TrackerConfig {
            queue: QueueConfig::new(2, 3, 100),
            sweep: SweepConfig::new(3600, 3600, 10),
            fallback: FallbackConfig::new(86_400),
            persistence: PersistenceConfig::new(50),
        };
        let store = Arc::new(AssetStore::new());
        let album = Album::new("Batch");
        let album_id = album.id;
        store.insert_album(album);
        let mut ids = Vec::new();
        for i in 0..10 {
            let photo = PhotoAsset::new(
                album_id,
                &format!("https://cdn/p{}.jpg", i),
                &format!("u1/b/p{}.jpg", i),
            );
            ids.push(photo.id);
            store.insert_photo(photo);
        }
        let tracker = AssetTracker::new(config, store, object_store, Arc::new(NullSink));
        tracker.start();

        tracker.enqueue_all(ids.clone());
        tokio::time::sleep(Duration::from_secs(5)).await;

        for id in ids {
            assert!(tracker.store().photo(id).unwrap().is_resolved());
        }

        tracker.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_idempotent_and_terminates() {
        let object_store = ScriptedStore::new(Mode::Ready);
        let (tracker, id, _) = tracker_with(queue_only_config(), object_store);
        tracker.start();
        tracker.enqueue(id);

        tracker.stop().await;
        tracker.stop().await;
        // Enqueue after stop just accumulates; nothing panics
        tracker.enqueue(id);
    }
}
