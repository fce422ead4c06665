//! Coarse folder state tracking and per-path error journals.

use std::fmt;
use std::sync::Mutex;

use serde::Serialize;
use tracing::{debug, info};
use weft_model::FolderId;

use crate::error::SyncError;
use crate::events::{Event, EventLogger};

/// Coarse lifecycle states surfaced to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FolderState {
    Idle,
    Scanning,
    /// Scan queued, waiting for an I/O token.
    ScanWaiting,
    /// Pull queued, waiting for an I/O token.
    SyncWaiting,
    Syncing,
    /// Version cleanup queued, waiting for an I/O token.
    CleanWaiting,
    Cleaning,
    Error,
}

impl FolderState {
    pub fn as_str(&self) -> &'static str {
        match self {
            FolderState::Idle => "idle",
            FolderState::Scanning => "scanning",
            FolderState::ScanWaiting => "scan-waiting",
            FolderState::SyncWaiting => "sync-waiting",
            FolderState::Syncing => "syncing",
            FolderState::CleanWaiting => "clean-waiting",
            FolderState::Cleaning => "cleaning",
            FolderState::Error => "error",
        }
    }
}

impl fmt::Display for FolderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

struct TrackerInner {
    state: FolderState,
    error: Option<String>,
}

/// Records the folder's coarse state plus the latest sticky error and emits
/// a state-change event on every transition. Sticky errors are de-duplicated
/// by text.
pub struct StateTracker {
    folder: FolderId,
    logger: EventLogger,
    inner: Mutex<TrackerInner>,
}

impl StateTracker {
    pub fn new(folder: FolderId, logger: EventLogger) -> Self {
        Self {
            folder,
            logger,
            inner: Mutex::new(TrackerInner {
                state: FolderState::Idle,
                error: None,
            }),
        }
    }

    pub fn state(&self) -> FolderState {
        self.inner.lock().unwrap().state
    }

    pub fn error(&self) -> Option<String> {
        self.inner.lock().unwrap().error.clone()
    }

    /// Move to `to` unless a sticky error is latched.
    pub fn set_state(&self, to: FolderState) {
        let mut inner = self.inner.lock().unwrap();
        if inner.error.is_some() || inner.state == to {
            return;
        }
        let from = inner.state;
        inner.state = to;
        let error = inner.error.clone();
        drop(inner);

        debug!(target: "folder", folder = %self.folder, %from, %to, "state changed");
        self.logger.log(Event::StateChanged {
            folder: self.folder.clone(),
            from,
            to,
            error,
        });
    }

    /// Latch `err` (transitioning to [`FolderState::Error`]) or clear the
    /// latched error (returning to [`FolderState::Idle`]). Latching the
    /// same error text twice is a no-op.
    pub fn set_error(&self, err: Option<&SyncError>) {
        let text = err.map(|e| e.to_string());
        let mut inner = self.inner.lock().unwrap();
        if inner.error == text {
            return;
        }
        let from = inner.state;
        inner.state = match text {
            Some(_) => FolderState::Error,
            None => FolderState::Idle,
        };
        let to = inner.state;
        inner.error = text.clone();
        drop(inner);

        match &text {
            Some(message) => {
                info!(target: "folder", folder = %self.folder, error = %message, "folder error")
            }
            None => {
                info!(target: "folder", folder = %self.folder, "folder error cleared")
            }
        }
        self.logger.log(Event::StateChanged {
            folder: self.folder.clone(),
            from,
            to,
            error: text,
        });
    }
}

impl fmt::Debug for StateTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("StateTracker");
        debug.field("folder", &self.folder);
        match self.inner.try_lock() {
            Ok(inner) => {
                debug
                    .field("state", &inner.state)
                    .field("error", &inner.error);
            }
            Err(_) => {
                debug.field("inner", &"<locked>");
            }
        }
        debug.finish()
    }
}

/// One failed path with the error text that applied to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileError {
    pub path: String,
    pub error: String,
}

/// Accumulates per-path scan and pull errors between successful passes.
#[derive(Default)]
pub struct ErrorJournal {
    scan: Mutex<Vec<FileError>>,
    pull: Mutex<Vec<FileError>>,
}

impl ErrorJournal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append_scan(&self, path: impl Into<String>, error: impl Into<String>) {
        let entry = FileError {
            path: path.into(),
            error: error.into(),
        };
        debug!(target: "folder::scan", path = %entry.path, error = %entry.error, "scan error");
        let mut scan = self.scan.lock().unwrap();
        if !scan.contains(&entry) {
            scan.push(entry);
        }
    }

    pub fn append_pull(&self, path: impl Into<String>, error: impl Into<String>) {
        self.pull.lock().unwrap().push(FileError {
            path: path.into(),
            error: error.into(),
        });
    }

    /// Drop scan errors for the subtrees about to be rescanned; an empty
    /// `subs` clears everything.
    pub fn clear_scan(&self, subs: &[String]) {
        let mut scan = self.scan.lock().unwrap();
        if subs.is_empty() {
            scan.clear();
            return;
        }
        scan.retain(|entry| {
            !subs.iter().any(|sub| {
                entry.path == *sub
                    || entry
                        .path
                        .strip_prefix(sub.as_str())
                        .is_some_and(|rest| rest.starts_with('/'))
            })
        });
    }

    pub fn clear_pull(&self) {
        self.pull.lock().unwrap().clear();
    }

    /// Scan errors followed by pull errors, sorted by path ascending.
    pub fn all(&self) -> Vec<FileError> {
        let mut scan = self.scan.lock().unwrap().clone();
        let mut pull = self.pull.lock().unwrap().clone();
        scan.sort_by(|a, b| a.path.cmp(&b.path));
        pull.sort_by(|a, b| a.path.cmp(&b.path));
        scan.extend(pull);
        scan
    }
}

impl fmt::Debug for ErrorJournal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorJournal")
            .field("scan_errors", &self.scan.lock().unwrap().len())
            .field("pull_errors", &self.pull.lock().unwrap().len())
            .finish()
    }
}
