use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("folder path missing or not a directory: {0}")]
    PathMissing(String),

    #[error("insufficient space on {path}: {free} bytes free")]
    InsufficientSpace { path: String, free: u64 },

    #[error("loading ignore patterns: {0}")]
    IgnoreLoad(String),

    #[error("watching filesystem: {0}")]
    Watch(String),

    #[error("event outside folder root: {0}")]
    WatchOutsideRoot(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

impl SyncError {
    /// Health errors block both scanning and pulling until the condition
    /// clears; they are latched on the folder state rather than returned to
    /// callers.
    pub fn is_health(&self) -> bool {
        matches!(
            self,
            SyncError::PathMissing(_) | SyncError::InsufficientSpace { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
