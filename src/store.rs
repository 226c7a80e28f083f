use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, error, info};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Notify};

use crate::asset::{Album, AlbumId, AssetId, DerivedKind, PhotoAsset};
use crate::error::AssetPulseError;

/// Full record set handed to the persistence sink on each flush. Saves are
/// whole-snapshot, not per-field; a crash between an in-memory write and the
/// next flush loses at most the latest discovery, which the tracker simply
/// re-discovers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GallerySnapshot {
    pub albums: Vec<Album>,
    pub photos: Vec<PhotoAsset>,
    pub saved_at: DateTime<Utc>,
}

/// Durable storage for the gallery records.
#[async_trait]
pub trait PersistenceSink: Send + Sync {
    async fn save(&self, snapshot: &GallerySnapshot) -> Result<(), AssetPulseError>;
}

/// Sink that writes the snapshot as pretty JSON, via a temp file and rename
/// so a crash mid-write never leaves a truncated snapshot behind.
pub struct JsonFileSink {
    path: PathBuf,
}

impl JsonFileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        JsonFileSink { path: path.into() }
    }
}

#[async_trait]
impl PersistenceSink for JsonFileSink {
    async fn save(&self, snapshot: &GallerySnapshot) -> Result<(), AssetPulseError> {
        let bytes = serde_json::to_vec_pretty(snapshot)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

struct GalleryState {
    albums: HashMap<AlbumId, Album>,
    photos: HashMap<AssetId, PhotoAsset>,
}

/// In-memory collection of albums and photo records.
///
/// The single mutable resource shared by the check queue, the sweep, and the
/// emergency fallback timer. All derived-URL writes are last-write-wins and
/// monotonic, so concurrent writers never need more coordination than the
/// short internal mutex; checks themselves are serialized per asset by
/// `ActiveChecks`, not here.
pub struct AssetStore {
    state: Mutex<GalleryState>,
    changed: Notify,
}

impl AssetStore {
    pub fn new() -> Self {
        AssetStore {
            state: Mutex::new(GalleryState {
                albums: HashMap::new(),
                photos: HashMap::new(),
            }),
            changed: Notify::new(),
        }
    }

    /// Restore a store from a previously persisted snapshot.
    pub fn from_snapshot(snapshot: GallerySnapshot) -> Self {
        let store = AssetStore::new();
        {
            let mut state = store.state.lock().unwrap();
            for album in snapshot.albums {
                state.albums.insert(album.id, album);
            }
            for photo in snapshot.photos {
                state.photos.insert(photo.id, photo);
            }
        }
        store
    }

    fn mark_changed(&self) {
        // One stored permit is enough; changes coalesce into one flush
        self.changed.notify_one();
    }

    pub fn insert_album(&self, album: Album) {
        self.state.lock().unwrap().albums.insert(album.id, album);
        self.mark_changed();
    }

    pub fn insert_photo(&self, photo: PhotoAsset) {
        self.state.lock().unwrap().photos.insert(photo.id, photo);
        self.mark_changed();
    }

    pub fn photo(&self, id: AssetId) -> Option<PhotoAsset> {
        self.state.lock().unwrap().photos.get(&id).cloned()
    }

    pub fn photo_count(&self) -> usize {
        self.state.lock().unwrap().photos.len()
    }

    pub fn photo_ids(&self) -> Vec<AssetId> {
        self.state.lock().unwrap().photos.keys().copied().collect()
    }

    pub fn album_photo_ids(&self, album_id: AlbumId) -> Vec<AssetId> {
        self.state
            .lock()
            .unwrap()
            .photos
            .values()
            .filter(|p| p.album_id == album_id)
            .map(|p| p.id)
            .collect()
    }

    /// Ids currently flagged `needs_retry` - the sweep's candidates.
    pub fn flagged_ids(&self) -> Vec<AssetId> {
        self.state
            .lock()
            .unwrap()
            .photos
            .values()
            .filter(|p| p.needs_retry)
            .map(|p| p.id)
            .collect()
    }

    /// Ids with no derived URLs at all and no retry flag. These fell outside
    /// the normal tracking path entirely (e.g. a lost enqueue) and are the
    /// emergency fallback's candidates.
    pub fn untracked_ids(&self) -> Vec<AssetId> {
        self.state
            .lock()
            .unwrap()
            .photos
            .values()
            .filter(|p| !p.has_any_derived() && !p.needs_retry)
            .map(|p| p.id)
            .collect()
    }

    /// Write discovered derived URLs and clear the retry flag.
    ///
    /// Last-write-wins per slot: rewriting a slot that already holds the
    /// same derived URL is harmless, and a real derived URL overwrites a
    /// fallback original. Returns false when the asset no longer exists.
    pub fn apply_resolved(&self, id: AssetId, found: &[(DerivedKind, String)]) -> bool {
        let mut state = self.state.lock().unwrap();
        let Some(photo) = state.photos.get_mut(&id) else {
            debug!("Discarding resolved URLs for removed asset {}", id);
            return false;
        };

        for (kind, url) in found {
            *photo.derived_slot_mut(*kind) = Some(url.clone());
        }
        photo.needs_retry = false;

        drop(state);
        self.mark_changed();
        true
    }

    /// Copy the original URL into every still-empty derived slot.
    ///
    /// Queue exhaustion passes `flag_retry = true` so the sweep keeps trying;
    /// the emergency fallback passes false - an asset that was never tracked
    /// gets a stand-in, not a retry loop. Slots already holding a value are
    /// left alone (derived URLs are monotonic).
    pub fn apply_fallback(&self, id: AssetId, flag_retry: bool) -> bool {
        let mut state = self.state.lock().unwrap();
        let Some(photo) = state.photos.get_mut(&id) else {
            return false;
        };

        let original = photo.original_url.clone();
        for kind in [
            DerivedKind::Optimized,
            DerivedKind::ThumbSmall,
            DerivedKind::ThumbMedium,
        ] {
            let slot = photo.derived_slot_mut(kind);
            if slot.is_none() {
                *slot = Some(original.clone());
            }
        }
        if flag_retry {
            photo.needs_retry = true;
        }

        drop(state);
        self.mark_changed();
        true
    }

    pub fn snapshot(&self) -> GallerySnapshot {
        let state = self.state.lock().unwrap();
        GallerySnapshot {
            albums: state.albums.values().cloned().collect(),
            photos: state.photos.values().cloned().collect(),
            saved_at: Utc::now(),
        }
    }

    /// Debounced persistence loop: waits for a change, lets further changes
    /// coalesce for the debounce window, then hands one snapshot to the sink.
    /// A final flush runs on shutdown.
    pub(crate) async fn run_flush_loop(
        self: Arc<Self>,
        sink: Arc<dyn PersistenceSink>,
        debounce: Duration,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                _ = self.changed.notified() => {
                    tokio::time::sleep(debounce).await;
                    let snapshot = self.snapshot();
                    if let Err(e) = sink.save(&snapshot).await {
                        error!("Failed to persist gallery snapshot: {}", e);
                    } else {
                        debug!("Persisted gallery snapshot ({} photos)", snapshot.photos.len());
                    }
                }
                _ = shutdown_rx.recv() => {
                    let snapshot = self.snapshot();
                    if let Err(e) = sink.save(&snapshot).await {
                        error!("Failed final gallery flush: {}", e);
                    } else {
                        info!("Final gallery flush complete ({} photos)", snapshot.photos.len());
                    }
                    break;
                }
            }
        }
    }
}

impl Default for AssetStore {
    fn default() -> Self {
        Self::new()
    }
}
