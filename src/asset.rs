use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter};
use uuid::Uuid;

/// Opaque photo identity, generated at upload time. Uuid v4 so rapid
/// concurrent uploads can mint ids without coordination.
pub type AssetId = Uuid;

/// Album identity.
pub type AlbumId = Uuid;

/// The three renditions the server-side pipeline produces for every upload.
///
/// Derived files land next to the original at a predictable path: the
/// original's extension is replaced by the rendition suffix plus the fixed
/// derived format extension (see `paths::derived_path`).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Display, EnumIter, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DerivedKind {
    #[strum(serialize = "optimized")]
    Optimized,
    #[strum(serialize = "thumb-small")]
    ThumbSmall,
    #[strum(serialize = "thumb-medium")]
    ThumbMedium,
}

impl DerivedKind {
    /// Path suffix inserted before the derived extension.
    pub fn suffix(&self) -> &'static str {
        match self {
            DerivedKind::Optimized => "-optimized",
            DerivedKind::ThumbSmall => "-thumb-small",
            DerivedKind::ThumbMedium => "-thumb-medium",
        }
    }
}

/// A photo record as the tracker sees it.
///
/// The original URL is immutable after creation. Derived URLs are monotonic:
/// the tracker sets them when discovered and never clears them. The only
/// writer that places a non-derived value into a derived slot is the
/// fallback path, which copies the original URL into *empty* slots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhotoAsset {
    pub id: AssetId,
    pub album_id: AlbumId,
    /// Always present once uploaded; never rewritten by the tracker.
    pub original_url: String,
    /// Storage path of the original file; derived paths are computed from it.
    pub storage_path: String,
    #[serde(default)]
    pub optimized_url: Option<String>,
    #[serde(default)]
    pub thumb_small_url: Option<String>,
    #[serde(default)]
    pub thumb_medium_url: Option<String>,
    /// Set when the check queue exhausted its attempts and served the
    /// original as a stand-in. Cleared the moment a real derived URL lands.
    #[serde(default)]
    pub needs_retry: bool,
    pub uploaded_at: DateTime<Utc>,
}

impl PhotoAsset {
    pub fn new(album_id: AlbumId, original_url: &str, storage_path: &str) -> Self {
        PhotoAsset {
            id: Uuid::new_v4(),
            album_id,
            original_url: original_url.to_string(),
            storage_path: storage_path.to_string(),
            optimized_url: None,
            thumb_small_url: None,
            thumb_medium_url: None,
            needs_retry: false,
            uploaded_at: Utc::now(),
        }
    }

    pub fn derived_url(&self, kind: DerivedKind) -> Option<&str> {
        self.derived_slot(kind).as_deref()
    }

    fn derived_slot(&self, kind: DerivedKind) -> &Option<String> {
        match kind {
            DerivedKind::Optimized => &self.optimized_url,
            DerivedKind::ThumbSmall => &self.thumb_small_url,
            DerivedKind::ThumbMedium => &self.thumb_medium_url,
        }
    }

    pub(crate) fn derived_slot_mut(&mut self, kind: DerivedKind) -> &mut Option<String> {
        match kind {
            DerivedKind::Optimized => &mut self.optimized_url,
            DerivedKind::ThumbSmall => &mut self.thumb_small_url,
            DerivedKind::ThumbMedium => &mut self.thumb_medium_url,
        }
    }

    pub fn has_any_derived(&self) -> bool {
        self.optimized_url.is_some()
            || self.thumb_small_url.is_some()
            || self.thumb_medium_url.is_some()
    }

    /// Terminal from the tracker's point of view: at least one derived URL
    /// landed and no retry is pending. Degraded-fallback assets are *not*
    /// resolved - their slots hold the original URL and `needs_retry` is set.
    pub fn is_resolved(&self) -> bool {
        self.has_any_derived() && !self.needs_retry
    }

    /// Display URL for a rendition: the derived URL when present, otherwise
    /// the original. Consumers never block on the tracker.
    pub fn display_url(&self, kind: DerivedKind) -> &str {
        self.derived_url(kind).unwrap_or(&self.original_url)
    }
}

/// An album groups photos; the tracker only reads its id for bulk re-checks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Album {
    pub id: AlbumId,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

impl Album {
    pub fn new(name: &str) -> Self {
        Album {
            id: Uuid::new_v4(),
            name: name.to_string(),
            created_at: Utc::now(),
        }
    }
}
