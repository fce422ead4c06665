//! Contract for the compiled ignore-pattern matcher.

use std::path::Path;

use crate::error::Result;

/// Classifies folder-relative paths against the folder's ignore patterns.
///
/// Implementations are expected to reload cheaply and to change their
/// [`hash`](Matcher::hash) whenever the effective pattern set changes; the
/// controller compares hashes around scans and pulls to detect edits.
pub trait Matcher: Send + Sync {
    /// (Re)load patterns from `path`. A missing file is not an error and
    /// yields an empty pattern set.
    fn load(&self, path: &Path) -> Result<()>;

    /// Fingerprint of the currently loaded pattern set.
    fn hash(&self) -> String;

    /// Whether `name` matches the ignore patterns.
    fn is_ignored(&self, name: &str) -> bool;
}
