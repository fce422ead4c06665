//! Observability events emitted by folder controllers.
//!
//! A lightweight in-process bus fans controller notifications out to
//! observers (UI, audit log, metrics). Logging is fire-and-forget: events
//! published with no subscribers are dropped.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use weft_model::{FileType, FolderId, ShortDeviceId};

use crate::folder::state::FolderState;

/// What happened to an entry that a scan or a remote update touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeAction {
    Modified,
    Deleted,
}

impl ChangeAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeAction::Modified => "modified",
            ChangeAction::Deleted => "deleted",
        }
    }
}

/// Controller notifications, one variant per observable transition.
#[derive(Debug, Clone, Serialize)]
pub enum Event {
    /// A batch of locally detected changes was committed to the index.
    LocalIndexUpdated {
        folder: FolderId,
        label: String,
        items: usize,
        /// Names from the committed batch, capped for payload size.
        filenames: Vec<String>,
        sequence: u64,
    },
    /// One entry changed on disk and was recorded by a scan.
    LocalChangeDetected {
        folder: FolderId,
        label: String,
        action: ChangeAction,
        entry_type: FileType,
        /// Path in native separators.
        path: String,
        modified_by: ShortDeviceId,
    },
    /// One entry changed because a remote version was adopted.
    RemoteChangeDetected {
        folder: FolderId,
        label: String,
        action: ChangeAction,
        entry_type: FileType,
        path: String,
        modified_by: ShortDeviceId,
    },
    /// The filesystem watcher's error state changed.
    FolderWatchStateChanged {
        folder: FolderId,
        from: Option<String>,
        to: Option<String>,
    },
    /// A non-fatal failure worth surfacing to the user.
    Failure { error: String },
    /// Post-scan folder summary.
    FolderSummary {
        folder: FolderId,
        sequence: u64,
        scanned_at: DateTime<Utc>,
    },
    /// The folder's coarse state changed.
    StateChanged {
        folder: FolderId,
        from: FolderState,
        to: FolderState,
        error: Option<String>,
    },
}

/// In-process broadcast bus for [`Event`]s.
#[derive(Clone)]
pub struct EventLogger {
    sender: broadcast::Sender<Event>,
    capacity: usize,
}

impl EventLogger {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender, capacity }
    }

    /// Fire-and-forget publish.
    pub fn log(&self, event: Event) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }
}

impl Default for EventLogger {
    fn default() -> Self {
        Self::new(256)
    }
}

impl fmt::Debug for EventLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLogger")
            .field("capacity", &self.capacity)
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}
