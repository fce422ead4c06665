//! Index entry model: file metadata, version vectors, and local-only flags.

use std::fmt;
use std::time::Duration;

use bitflags::bitflags;
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::ShortDeviceId;

bitflags! {
    /// Per-entry bits for conditions that exist only on this device and are
    /// never exchanged with peers.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
    pub struct LocalFlags: u32 {
        /// The entry was changed locally in a receive-only folder and
        /// diverges from the global version.
        const RECEIVE_ONLY = 1 << 0;
        /// The entry matches the current ignore patterns.
        const IGNORED = 1 << 1;
        /// The entry must be re-hashed on the next scan that visits it.
        const MUST_RESCAN = 1 << 2;
    }
}

/// Kind of filesystem entry an index record describes.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    File,
    #[serde(rename = "dir")]
    Directory,
    Symlink,
}

impl FileType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileType::File => "file",
            FileType::Directory => "dir",
            FileType::Symlink => "symlink",
        }
    }
}

impl fmt::Display for FileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One device's change counter inside a version vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counter {
    pub id: ShortDeviceId,
    pub value: u64,
}

/// Outcome of comparing two version vectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionOrdering {
    Equal,
    Greater,
    Lesser,
    Concurrent,
}

/// Vector clock recording, per modifying device, how many changes it has
/// made to an entry.
#[derive(
    Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize,
)]
pub struct VersionVector(pub Vec<Counter>);

impl VersionVector {
    pub fn new() -> Self {
        VersionVector(Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Bump the counter for `id`, recording a new local change.
    pub fn update(&mut self, id: ShortDeviceId) {
        match self.0.iter_mut().find(|c| c.id == id) {
            Some(counter) => counter.value += 1,
            None => self.0.push(Counter { id, value: 1 }),
        }
        self.0.sort_by_key(|c| c.id);
    }

    fn value_for(&self, id: ShortDeviceId) -> u64 {
        self.0
            .iter()
            .find(|c| c.id == id)
            .map(|c| c.value)
            .unwrap_or(0)
    }

    /// Compare against `other` per vector-clock semantics.
    pub fn compare(&self, other: &VersionVector) -> VersionOrdering {
        let mut greater = false;
        let mut lesser = false;
        for counter in self.0.iter().chain(other.0.iter()) {
            let a = self.value_for(counter.id);
            let b = other.value_for(counter.id);
            if a > b {
                greater = true;
            } else if a < b {
                lesser = true;
            }
        }
        match (greater, lesser) {
            (false, false) => VersionOrdering::Equal,
            (true, false) => VersionOrdering::Greater,
            (false, true) => VersionOrdering::Lesser,
            (true, true) => VersionOrdering::Concurrent,
        }
    }
}

/// A single content block of a file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockInfo {
    pub offset: u64,
    pub size: u32,
    pub hash: Vec<u8>,
}

/// Digest over the concatenated block hashes. Entries with equal content
/// share this value, which makes it the lookup key for rename detection.
pub fn blocks_hash(blocks: &[BlockInfo]) -> Vec<u8> {
    use sha2::{Digest, Sha256};

    if blocks.is_empty() {
        return Vec::new();
    }
    let mut hasher = Sha256::new();
    for block in blocks {
        hasher.update(&block.hash);
    }
    hasher.finalize().to_vec()
}

/// Metadata record for one filesystem entry, as stored in the index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileInfo {
    /// Folder-relative path with `/` separators.
    pub name: String,
    pub file_type: FileType,
    pub size: u64,
    pub permissions: u32,
    pub modified: DateTime<Utc>,
    pub modified_by: ShortDeviceId,
    pub deleted: bool,
    /// Set on folders configured to ignore permission bits.
    pub no_permissions: bool,
    pub version: VersionVector,
    pub sequence: u64,
    pub blocks: Vec<BlockInfo>,
    /// Digest over the concatenated block hashes; empty when not hashed.
    pub blocks_hash: Vec<u8>,
    pub symlink_target: String,
    #[serde(skip)]
    pub local_flags: LocalFlags,
}

impl FileInfo {
    /// Minimal record for a regular file; scanners fill in the rest.
    pub fn new(name: impl Into<String>, file_type: FileType) -> Self {
        FileInfo {
            name: name.into(),
            file_type,
            size: 0,
            permissions: 0,
            modified: DateTime::<Utc>::UNIX_EPOCH,
            modified_by: ShortDeviceId::default(),
            deleted: false,
            no_permissions: false,
            version: VersionVector::new(),
            sequence: 0,
            blocks: Vec::new(),
            blocks_hash: Vec::new(),
            symlink_target: String::new(),
            local_flags: LocalFlags::empty(),
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    pub fn is_directory(&self) -> bool {
        self.file_type == FileType::Directory
    }

    pub fn is_ignored(&self) -> bool {
        self.local_flags.contains(LocalFlags::IGNORED)
    }

    pub fn is_receive_only_changed(&self) -> bool {
        self.local_flags.contains(LocalFlags::RECEIVE_ONLY)
    }

    pub fn must_rescan(&self) -> bool {
        self.local_flags.contains(LocalFlags::MUST_RESCAN)
    }

    /// Approximate in-memory weight, used for update batch sizing.
    pub fn weight(&self) -> usize {
        self.name.len()
            + self
                .blocks
                .iter()
                .map(|b| b.hash.len() + 16)
                .sum::<usize>()
            + self.blocks_hash.len()
            + 64
    }

    /// Turn this record into a deletion authored by `by`, carrying `flags`.
    pub fn into_deleted(
        mut self,
        by: ShortDeviceId,
        flags: LocalFlags,
    ) -> FileInfo {
        self.deleted = true;
        self.size = 0;
        self.blocks.clear();
        self.blocks_hash.clear();
        self.symlink_target.clear();
        self.modified = Utc::now();
        self.modified_by = by;
        self.version.update(by);
        self.local_flags = flags;
        self
    }

    /// Turn this record into an ignored entry authored by `by`.
    pub fn into_ignored(mut self, by: ShortDeviceId) -> FileInfo {
        self.modified_by = by;
        self.version.update(by);
        self.local_flags = LocalFlags::IGNORED;
        self
    }

    /// Turn this previously ignored record back into a tracked entry
    /// authored by `by`, flagged for re-hashing on the next scan that
    /// visits it.
    pub fn into_unignored(mut self, by: ShortDeviceId) -> FileInfo {
        self.modified_by = by;
        self.version.update(by);
        self.local_flags.remove(LocalFlags::IGNORED);
        self.local_flags.insert(LocalFlags::MUST_RESCAN);
        self
    }

    /// Whether `other` describes the same content and metadata, disregarding
    /// the receive-only flag and treating modification times within
    /// `mtime_window` as equal.
    pub fn is_equivalent_ignoring_receive_only(
        &self,
        other: &FileInfo,
        mtime_window: Duration,
        ignore_perms: bool,
    ) -> bool {
        if self.name != other.name
            || self.file_type != other.file_type
            || self.deleted != other.deleted
        {
            return false;
        }
        if self.file_type == FileType::File && !self.deleted {
            if self.size != other.size {
                return false;
            }
            if !self.blocks_hash.is_empty()
                && !other.blocks_hash.is_empty()
                && self.blocks_hash != other.blocks_hash
            {
                return false;
            }
            let window = TimeDelta::from_std(mtime_window)
                .unwrap_or_else(|_| TimeDelta::zero());
            if (self.modified - other.modified).abs() > window {
                return false;
            }
        }
        if self.file_type == FileType::Symlink
            && self.symlink_target != other.symlink_target
        {
            return false;
        }
        if !ignore_perms
            && !self.no_permissions
            && !other.no_permissions
            && self.permissions != other.permissions
        {
            return false;
        }
        true
    }
}
