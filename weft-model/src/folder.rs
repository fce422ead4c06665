//! Folder descriptor: identity, type, and tuning knobs for one shared folder.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::files::LocalFlags;
use crate::ids::{FolderId, ShortDeviceId};

/// Synchronization behaviour of a folder.
#[derive(
    Debug,
    Default,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum FolderType {
    /// Send local changes, apply remote changes.
    #[default]
    SendReceive,
    /// Send local changes, never apply remote changes.
    SendOnly,
    /// Apply remote changes, keep local changes quarantined.
    ReceiveOnly,
    /// Store remote data without the keys to decrypt it.
    ReceiveEncrypted,
}

impl FolderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FolderType::SendReceive => "sendreceive",
            FolderType::SendOnly => "sendonly",
            FolderType::ReceiveOnly => "receiveonly",
            FolderType::ReceiveEncrypted => "receiveencrypted",
        }
    }
}

/// Immutable descriptor a folder controller is bound to at construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FolderConfig {
    pub id: FolderId,
    pub label: String,
    pub folder_type: FolderType,
    /// Folder root on the local filesystem.
    pub path: PathBuf,
    /// Interval between timed full rescans; zero disables the timer.
    pub rescan_interval: Duration,
    /// Base pause between failed pull attempts; backoff doubles it up to
    /// sixty times this value.
    pub pull_pause_base: Duration,
    /// Interval between version-cleanup runs; zero disables cleanup.
    pub clean_interval: Duration,
    pub watcher_enabled: bool,
    pub ignore_perms: bool,
    pub auto_normalize: bool,
    /// Modification times within this window compare as equal.
    pub mtime_window: Duration,
    /// Flag mask stamped on entries produced by local scans.
    #[serde(skip)]
    pub local_flags: LocalFlags,
    /// Short identifier of the local device.
    pub short_id: ShortDeviceId,
}

impl FolderConfig {
    pub fn new(id: impl Into<FolderId>, path: impl Into<PathBuf>) -> Self {
        FolderConfig {
            id: id.into(),
            label: String::new(),
            folder_type: FolderType::default(),
            path: path.into(),
            rescan_interval: Duration::from_secs(3600),
            pull_pause_base: Duration::from_secs(60),
            clean_interval: Duration::from_secs(3600),
            watcher_enabled: false,
            ignore_perms: false,
            auto_normalize: true,
            mtime_window: Duration::from_secs(2),
            local_flags: LocalFlags::empty(),
            short_id: ShortDeviceId::default(),
        }
    }

    /// Label when set, otherwise the folder id.
    pub fn display_name(&self) -> &str {
        if self.label.is_empty() {
            self.id.as_str()
        } else {
            &self.label
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_name_falls_back_to_id() {
        let mut cfg = FolderConfig::new("docs", "/srv/docs");
        assert_eq!(cfg.display_name(), "docs");
        cfg.label = "Documents".to_string();
        assert_eq!(cfg.display_name(), "Documents");
    }

    #[test]
    fn folder_type_round_trips_through_serde() {
        let json = serde_json::to_string(&FolderType::ReceiveOnly).unwrap();
        assert_eq!(json, "\"receive-only\"");
        let back: FolderType = serde_json::from_str(&json).unwrap();
        assert_eq!(back, FolderType::ReceiveOnly);
    }
}
