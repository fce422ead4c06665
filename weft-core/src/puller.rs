//! Contract for the component that fetches missing content from peers.

use async_trait::async_trait;

/// Retrieves needed files from remote devices and writes them locally.
///
/// The controller gates invocations on folder health and the initial scan;
/// the puller only has to move bytes and report whether the attempt left
/// anything behind.
#[async_trait]
pub trait Puller: Send + Sync {
    /// One pull attempt over the current set of needed files. Returns
    /// `true` when nothing remains to retry soon.
    async fn pull(&self) -> bool;
}
