//! Contract for the durable index ("file set") the controller reconciles
//! scan results against.
//!
//! The index engine itself lives outside this crate; the controller only
//! needs point-in-time snapshots and batched updates. A snapshot is released
//! by dropping it.

use weft_model::{DeviceId, FileInfo};

use crate::error::Result;

/// Durable per-folder index of file metadata across all devices.
pub trait FileSet: Send + Sync {
    /// Point-in-time view of the index. Dropped to release.
    fn snapshot(&self) -> Result<Box<dyn IndexSnapshot>>;

    /// Commit a batch of entries for `device`, assigning sequence numbers.
    fn update(&self, device: DeviceId, files: Vec<FileInfo>) -> Result<()>;

    /// Highest sequence number recorded for `device`.
    fn sequence(&self, device: DeviceId) -> u64;
}

/// Consistent view of the index at one point in time.
///
/// Iteration callbacks return `true` to continue and `false` to stop early.
pub trait IndexSnapshot: Send {
    /// Entry for `name` as known for `device`.
    fn get(&self, device: DeviceId, name: &str) -> Option<FileInfo>;

    /// Reconciled best-known version of `name` across all devices.
    fn get_global(&self, name: &str) -> Option<FileInfo>;

    /// Whether `device` has any entry for `name`.
    fn have(&self, device: DeviceId, name: &str) -> bool;

    /// Entries `device` lacks or has in an older version than the global
    /// view.
    fn with_need(
        &self,
        device: DeviceId,
        cb: &mut dyn FnMut(&FileInfo) -> bool,
    );

    /// Entries `device` has under `prefix`, in lexicographic name order.
    /// An empty prefix iterates the whole folder.
    fn with_have_prefixed(
        &self,
        device: DeviceId,
        prefix: &str,
        cb: &mut dyn FnMut(&FileInfo) -> bool,
    );

    /// Non-deleted entries whose block-list digest equals `hash`.
    fn with_blocks_hash(
        &self,
        hash: &[u8],
        cb: &mut dyn FnMut(&FileInfo) -> bool,
    );

    /// Devices announcing a usable copy of `name`.
    fn availability(&self, name: &str) -> Vec<DeviceId>;

    /// Highest sequence number for `device` as of this snapshot.
    fn sequence(&self, device: DeviceId) -> u64;
}
