use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, warn};
use strum::IntoEnumIterator;

use crate::asset::DerivedKind;
use crate::error::AssetPulseError;

/// Format the rendition pipeline writes for every derived file.
pub const DERIVED_EXT: &str = "webp";

/// Compute the expected storage path of one derived rendition.
///
/// The pipeline writes derived files next to the original, replacing the
/// original's extension with the rendition suffix plus the derived format
/// extension:
///
/// `u1/a7/beach.jpg` -> `u1/a7/beach-optimized.webp`
///
/// Paths without an extension keep the full name as the stem. This is a pure
/// function; it never consults the object store.
pub fn derived_path(original_path: &str, kind: DerivedKind) -> String {
    let stem = match original_path.rsplit_once('.') {
        // A '.' inside a directory component is not an extension separator
        Some((stem, ext)) if !stem.is_empty() && !ext.contains('/') => stem,
        _ => original_path,
    };
    format!("{}{}.{}", stem, kind.suffix(), DERIVED_EXT)
}

/// All three expected derived paths for an original, in `DerivedKind` order.
pub fn derived_paths(original_path: &str) -> Vec<(DerivedKind, String)> {
    DerivedKind::iter()
        .map(|kind| (kind, derived_path(original_path, kind)))
        .collect()
}

/// The object store that holds original and derived files.
///
/// `Ok(None)` is the ordinary "not yet generated" answer and must not be
/// reported as an error by implementations; the rendition pipeline runs
/// out-of-band and absence is expected until it finishes.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn resolve_url(&self, path: &str) -> Result<Option<String>, AssetPulseError>;
}

/// Lookup layer over the object store for one asset's derived renditions.
///
/// Swallows lookup failures: both not-yet-generated and genuine store errors
/// surface to callers as absence. They differ only in diagnostics - absence
/// is routine (debug), errors are worth a warning. Retry policy lives
/// entirely in the check queue, never here.
pub struct DerivedLookup {
    store: Arc<dyn ObjectStore>,
}

impl DerivedLookup {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        DerivedLookup { store }
    }

    /// Resolve whichever derived renditions exist right now for an original.
    /// Returns only the renditions that resolved; an empty vec means none
    /// are available yet.
    pub async fn check(&self, storage_path: &str) -> Vec<(DerivedKind, String)> {
        let mut found = Vec::new();

        for (kind, path) in derived_paths(storage_path) {
            match self.store.resolve_url(&path).await {
                Ok(Some(url)) => found.push((kind, url)),
                Ok(None) => {
                    debug!("Derived file not yet available: {}", path);
                }
                Err(e) => {
                    warn!("Lookup failed for {}: {}", path, e);
                }
            }
        }

        found
    }
}
