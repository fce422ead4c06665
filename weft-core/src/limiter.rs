//! Process-wide gate that bounds concurrent heavy I/O across all folders.

use std::fmt;
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::error::{Result, SyncError};

/// Token semaphore shared by every folder controller in the process. Scans
/// and pulls each hold one token while they touch the disk; send-only pulls
/// skip acquisition entirely.
#[derive(Clone)]
pub struct IoLimiter {
    semaphore: Arc<Semaphore>,
    tokens: usize,
}

impl IoLimiter {
    pub fn new(tokens: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(tokens.max(1))),
            tokens: tokens.max(1),
        }
    }

    /// Wait for a token. Returns [`SyncError::Cancelled`] when `cancel`
    /// fires first; the permit releases its token on drop.
    pub async fn acquire(
        &self,
        cancel: &CancellationToken,
    ) -> Result<OwnedSemaphorePermit> {
        tokio::select! {
            _ = cancel.cancelled() => Err(SyncError::Cancelled),
            permit = Arc::clone(&self.semaphore).acquire_owned() => {
                permit.map_err(|_| SyncError::Cancelled)
            }
        }
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}

impl Default for IoLimiter {
    fn default() -> Self {
        Self::new(2)
    }
}

impl fmt::Debug for IoLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoLimiter")
            .field("tokens", &self.tokens)
            .field("available", &self.semaphore.available_permits())
            .finish()
    }
}
