//! Core data model definitions shared across Weft crates.
#![allow(missing_docs)]

pub mod files;
pub mod folder;
pub mod ids;

// Intentionally curated re-exports for downstream consumers.
pub use files::{
    BlockInfo, Counter, FileInfo, FileType, LocalFlags, VersionOrdering,
    VersionVector, blocks_hash,
};
pub use folder::{FolderConfig, FolderType};
pub use ids::{DeviceId, FolderId, ShortDeviceId};
