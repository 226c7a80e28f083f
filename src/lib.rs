//! assetpulse tracks derived-asset completion for photo gallery services.
//!
//! After a photo's original file is uploaded, a server-side pipeline
//! generates optimized and thumbnail renditions out-of-band, with no
//! completion notification. This crate polls the object store for those
//! derived files under bounded concurrency, with retry, deduplication, and
//! bounded-time fallback, guaranteeing that every asset eventually reaches a
//! stable terminal state: real derived URLs, or the original URL standing in
//! as a degraded fallback that a low-frequency sweep keeps trying to repair.
//!
//! The host application supplies an [`ObjectStore`] for lookups and a
//! [`PersistenceSink`] for durable snapshots, then drives one
//! [`AssetTracker`] per tenant session.

pub mod asset;
pub mod config;
pub mod error;
pub mod locks;
pub mod paths;
mod queue;
pub mod store;
mod sweep;
pub mod tracker;

pub use asset::{Album, AlbumId, AssetId, DerivedKind, PhotoAsset};
pub use config::TrackerConfig;
pub use error::AssetPulseError;
pub use paths::{derived_path, derived_paths, ObjectStore};
pub use store::{AssetStore, GallerySnapshot, JsonFileSink, PersistenceSink};
pub use tracker::AssetTracker;
