//! Contract for the directory walker and block hasher.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use weft_model::FileInfo;

use crate::error::Result;
use crate::matcher::Matcher;

/// Parameters for one walk over the folder (or a set of subtrees).
#[derive(Clone)]
pub struct WalkRequest {
    /// Canonical subtree roots to visit; empty means the whole folder.
    pub subs: Vec<String>,
    /// Matcher consulted to skip ignored entries during the walk.
    pub matcher: Arc<dyn Matcher>,
    /// Whether permission bits should be ignored when comparing entries.
    pub ignore_perms: bool,
    /// Whether the walker should repair denormalized UTF-8 in names.
    pub auto_normalize: bool,
}

impl fmt::Debug for WalkRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WalkRequest")
            .field("subs", &self.subs)
            .field("ignore_perms", &self.ignore_perms)
            .field("auto_normalize", &self.auto_normalize)
            .finish()
    }
}

/// One item from the scanner's result stream.
#[derive(Debug, Clone)]
pub enum ScanEntry {
    /// A new or changed entry, including deletions the walker noticed
    /// itself.
    File(FileInfo),
    /// A path that could not be scanned; the scan continues past it.
    Error { path: String, error: String },
}

/// Walks the folder and produces changed entries relative to the index.
///
/// The result channel is closed when the walk finishes or is cancelled;
/// consumers must drain it to completion so the walker never blocks on its
/// output.
#[async_trait]
pub trait Scanner: Send + Sync {
    /// Full walk with block hashing.
    async fn walk(
        &self,
        cancel: CancellationToken,
        req: WalkRequest,
    ) -> Result<mpsc::Receiver<ScanEntry>>;

    /// Metadata-only walk, used for folders storing encrypted data the
    /// local device cannot hash meaningfully.
    async fn walk_without_hashing(
        &self,
        cancel: CancellationToken,
        req: WalkRequest,
    ) -> Result<mpsc::Receiver<ScanEntry>>;
}
