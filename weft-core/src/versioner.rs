//! Contract for the version-history garbage collector.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::Result;

/// Retains or prunes old versions of changed files.
#[async_trait]
pub trait Versioner: Send + Sync {
    /// Remove expired versions. Honors `cancel` for early termination.
    async fn clean(&self, cancel: CancellationToken) -> Result<()>;
}
