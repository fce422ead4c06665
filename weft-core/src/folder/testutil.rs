//! Shared fakes for controller tests: an in-memory file set, scripted
//! scanner and puller, a table-driven matcher, and a scripted filesystem.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use weft_model::{BlockInfo, DeviceId, FileInfo, FileType, FolderId};

use crate::error::{Result, SyncError};
use crate::fs::{DiskUsage, FolderFilesystem, WatchStreams};
use crate::index::{FileSet, IndexSnapshot};
use crate::matcher::Matcher;
use crate::puller::Puller;
use crate::scanner::{ScanEntry, Scanner, WalkRequest};
use crate::versioner::Versioner;

use super::ControllerHost;
use super::subtrees::is_descendant;

pub(crate) fn file(name: &str, size: u64) -> FileInfo {
    let mut fi = FileInfo::new(name, FileType::File);
    fi.size = size;
    fi.modified = chrono::Utc::now();
    fi
}

pub(crate) fn file_with_blocks(
    name: &str,
    size: u64,
    block_hash: &[u8],
) -> FileInfo {
    let mut fi = file(name, size);
    fi.blocks = vec![BlockInfo {
        offset: 0,
        size: size as u32,
        hash: block_hash.to_vec(),
    }];
    fi.blocks_hash = weft_model::blocks_hash(&fi.blocks);
    fi
}

pub(crate) fn dir(name: &str) -> FileInfo {
    FileInfo::new(name, FileType::Directory)
}

#[derive(Default)]
struct MemIndex {
    local: BTreeMap<String, FileInfo>,
    global: BTreeMap<String, FileInfo>,
    sequence: u64,
}

/// In-memory [`FileSet`]. The global view is seeded explicitly by tests;
/// local updates do not touch it.
#[derive(Default)]
pub(crate) struct MemFileSet {
    inner: Mutex<MemIndex>,
    fail_updates: AtomicBool,
    updates: AtomicUsize,
}

impl MemFileSet {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert_local(&self, fi: FileInfo) {
        let mut inner = self.inner.lock().unwrap();
        inner.sequence += 1;
        let mut fi = fi;
        fi.sequence = inner.sequence;
        inner.local.insert(fi.name.clone(), fi);
    }

    pub(crate) fn insert_global(&self, fi: FileInfo) {
        let mut inner = self.inner.lock().unwrap();
        inner.global.insert(fi.name.clone(), fi);
    }

    pub(crate) fn get_local(&self, name: &str) -> Option<FileInfo> {
        self.inner.lock().unwrap().local.get(name).cloned()
    }

    pub(crate) fn local_names(&self) -> Vec<String> {
        self.inner.lock().unwrap().local.keys().cloned().collect()
    }

    pub(crate) fn set_fail_updates(&self, fail: bool) {
        self.fail_updates.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn update_count(&self) -> usize {
        self.updates.load(Ordering::SeqCst)
    }
}

impl FileSet for MemFileSet {
    fn snapshot(&self) -> Result<Box<dyn IndexSnapshot>> {
        let inner = self.inner.lock().unwrap();
        Ok(Box::new(MemSnapshot {
            local: inner.local.clone(),
            global: inner.global.clone(),
            sequence: inner.sequence,
        }))
    }

    fn update(&self, _device: DeviceId, files: Vec<FileInfo>) -> Result<()> {
        if self.fail_updates.load(Ordering::SeqCst) {
            return Err(SyncError::Internal("index update failed".into()));
        }
        self.updates.fetch_add(1, Ordering::SeqCst);
        let mut inner = self.inner.lock().unwrap();
        for mut fi in files {
            inner.sequence += 1;
            fi.sequence = inner.sequence;
            inner.local.insert(fi.name.clone(), fi);
        }
        Ok(())
    }

    fn sequence(&self, _device: DeviceId) -> u64 {
        self.inner.lock().unwrap().sequence
    }
}

struct MemSnapshot {
    local: BTreeMap<String, FileInfo>,
    global: BTreeMap<String, FileInfo>,
    sequence: u64,
}

impl IndexSnapshot for MemSnapshot {
    fn get(&self, _device: DeviceId, name: &str) -> Option<FileInfo> {
        self.local.get(name).cloned()
    }

    fn get_global(&self, name: &str) -> Option<FileInfo> {
        self.global
            .get(name)
            .or_else(|| self.local.get(name))
            .cloned()
    }

    fn have(&self, _device: DeviceId, name: &str) -> bool {
        self.local.contains_key(name)
    }

    fn with_need(
        &self,
        _device: DeviceId,
        cb: &mut dyn FnMut(&FileInfo) -> bool,
    ) {
        for (name, global) in &self.global {
            let needed = match self.local.get(name) {
                None => !global.is_deleted(),
                Some(local) => matches!(
                    local.version.compare(&global.version),
                    weft_model::VersionOrdering::Lesser
                ),
            };
            if needed && !cb(global) {
                return;
            }
        }
    }

    fn with_have_prefixed(
        &self,
        _device: DeviceId,
        prefix: &str,
        cb: &mut dyn FnMut(&FileInfo) -> bool,
    ) {
        for (name, fi) in &self.local {
            if !prefix.is_empty()
                && name != prefix
                && !is_descendant(name, prefix)
            {
                continue;
            }
            if !cb(fi) {
                return;
            }
        }
    }

    fn with_blocks_hash(
        &self,
        hash: &[u8],
        cb: &mut dyn FnMut(&FileInfo) -> bool,
    ) {
        for fi in self.local.values() {
            if !fi.is_deleted() && fi.blocks_hash == hash && !cb(fi) {
                return;
            }
        }
    }

    fn availability(&self, name: &str) -> Vec<DeviceId> {
        if self.global.contains_key(name) {
            vec![DeviceId::LOCAL]
        } else {
            Vec::new()
        }
    }

    fn sequence(&self, _device: DeviceId) -> u64 {
        self.sequence
    }
}

/// [`Scanner`] that plays back scripted walks in order; once the script is
/// exhausted every walk yields nothing.
#[derive(Default)]
pub(crate) struct ScriptedScanner {
    walks: Mutex<VecDeque<Vec<ScanEntry>>>,
    requests: Mutex<Vec<Vec<String>>>,
    cancels: Mutex<Vec<CancellationToken>>,
    hashless: AtomicUsize,
}

impl ScriptedScanner {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push_walk(&self, entries: Vec<ScanEntry>) {
        self.walks.lock().unwrap().push_back(entries);
    }

    /// Subtree lists of every walk requested so far.
    pub(crate) fn requests(&self) -> Vec<Vec<String>> {
        self.requests.lock().unwrap().clone()
    }

    pub(crate) fn walk_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub(crate) fn hashless_count(&self) -> usize {
        self.hashless.load(Ordering::SeqCst)
    }

    pub(crate) fn last_cancel(&self) -> Option<CancellationToken> {
        self.cancels.lock().unwrap().last().cloned()
    }

    fn start_walk(
        &self,
        cancel: CancellationToken,
        req: WalkRequest,
    ) -> mpsc::Receiver<ScanEntry> {
        self.requests.lock().unwrap().push(req.subs.clone());
        self.cancels.lock().unwrap().push(cancel);
        let entries = self
            .walks
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_default();
        let (tx, rx) = mpsc::channel(entries.len().max(1));
        for entry in entries {
            tx.try_send(entry).expect("walk channel sized to script");
        }
        rx
    }
}

#[async_trait]
impl Scanner for ScriptedScanner {
    async fn walk(
        &self,
        cancel: CancellationToken,
        req: WalkRequest,
    ) -> Result<mpsc::Receiver<ScanEntry>> {
        Ok(self.start_walk(cancel, req))
    }

    async fn walk_without_hashing(
        &self,
        cancel: CancellationToken,
        req: WalkRequest,
    ) -> Result<mpsc::Receiver<ScanEntry>> {
        self.hashless.fetch_add(1, Ordering::SeqCst);
        Ok(self.start_walk(cancel, req))
    }
}

/// Table-driven [`Matcher`]: a set of ignored roots with explicit
/// negations, plus a scriptable hash and load behaviour.
#[derive(Default)]
pub(crate) struct TableMatcher {
    ignored: Mutex<HashSet<String>>,
    negated: Mutex<HashSet<String>>,
    hash: Mutex<String>,
    hash_after_load: Mutex<Option<String>>,
    load_error: Mutex<Option<String>>,
    loads: AtomicUsize,
}

impl TableMatcher {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn ignore(&self, name: &str) {
        self.ignored.lock().unwrap().insert(name.to_string());
    }

    pub(crate) fn unignore(&self, name: &str) {
        self.ignored.lock().unwrap().remove(name);
    }

    /// Explicit `!` rule: `name` never matches, even under an ignored root.
    pub(crate) fn negate(&self, name: &str) {
        self.negated.lock().unwrap().insert(name.to_string());
    }

    pub(crate) fn set_hash(&self, hash: &str) {
        *self.hash.lock().unwrap() = hash.to_string();
    }

    /// The next `load` switches the hash, simulating an edited ignore file.
    pub(crate) fn set_hash_after_load(&self, hash: &str) {
        *self.hash_after_load.lock().unwrap() = Some(hash.to_string());
    }

    pub(crate) fn fail_loads(&self, error: &str) {
        *self.load_error.lock().unwrap() = Some(error.to_string());
    }

    pub(crate) fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

impl Matcher for TableMatcher {
    fn load(&self, _path: &Path) -> Result<()> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.load_error.lock().unwrap().clone() {
            return Err(SyncError::IgnoreLoad(error));
        }
        if let Some(hash) = self.hash_after_load.lock().unwrap().take() {
            *self.hash.lock().unwrap() = hash;
        }
        Ok(())
    }

    fn hash(&self) -> String {
        self.hash.lock().unwrap().clone()
    }

    fn is_ignored(&self, name: &str) -> bool {
        if self.negated.lock().unwrap().contains(name) {
            return false;
        }
        self.ignored
            .lock()
            .unwrap()
            .iter()
            .any(|root| name == root || is_descendant(name, root))
    }
}

/// [`Puller`] returning scripted results (default success), optionally
/// gated so tests can hold a pull attempt open.
pub(crate) struct ScriptedPuller {
    results: Mutex<VecDeque<bool>>,
    calls: AtomicUsize,
    gated: AtomicBool,
    gate: Semaphore,
}

impl Default for ScriptedPuller {
    fn default() -> Self {
        Self {
            results: Mutex::new(VecDeque::new()),
            calls: AtomicUsize::new(0),
            gated: AtomicBool::new(false),
            gate: Semaphore::new(0),
        }
    }
}

impl ScriptedPuller {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push_result(&self, success: bool) {
        self.results.lock().unwrap().push_back(success);
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Every subsequent pull blocks until [`release`](Self::release).
    pub(crate) fn hold(&self) {
        self.gated.store(true, Ordering::SeqCst);
    }

    pub(crate) fn release(&self, permits: usize) {
        self.gate.add_permits(permits);
    }
}

#[async_trait]
impl Puller for ScriptedPuller {
    async fn pull(&self) -> bool {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.gated.load(Ordering::SeqCst) {
            let _permit = self.gate.acquire().await;
        }
        self.results.lock().unwrap().pop_front().unwrap_or(true)
    }
}

/// Scripted [`FolderFilesystem`]: in-memory existence, directory listings,
/// disk usage, and watch subscriptions whose streams tests feed directly.
pub(crate) struct FakeFs {
    existing: Mutex<HashSet<String>>,
    listings: Mutex<HashMap<String, Vec<String>>>,
    removed: Mutex<Vec<String>>,
    usage: Mutex<DiskUsage>,
    root_ok: AtomicBool,
    fail_watch: AtomicBool,
    watch_calls: AtomicUsize,
    watch_handles: Mutex<Option<WatchHandles>>,
}

pub(crate) struct WatchHandles {
    pub(crate) events: mpsc::Sender<String>,
    pub(crate) errors: mpsc::Sender<SyncError>,
    pub(crate) cancel: CancellationToken,
}

impl Default for FakeFs {
    fn default() -> Self {
        Self {
            existing: Mutex::new(HashSet::new()),
            listings: Mutex::new(HashMap::new()),
            removed: Mutex::new(Vec::new()),
            usage: Mutex::new(DiskUsage {
                free: u64::MAX,
                total: u64::MAX,
            }),
            root_ok: AtomicBool::new(true),
            fail_watch: AtomicBool::new(false),
            watch_calls: AtomicUsize::new(0),
            watch_handles: Mutex::new(None),
        }
    }
}

impl FakeFs {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add(&self, name: &str) {
        self.existing.lock().unwrap().insert(name.to_string());
    }

    pub(crate) fn remove(&self, name: &str) {
        self.existing.lock().unwrap().remove(name);
    }

    pub(crate) fn set_listing(&self, name: &str, children: Vec<String>) {
        self.listings
            .lock()
            .unwrap()
            .insert(name.to_string(), children);
    }

    pub(crate) fn removed_dirs(&self) -> Vec<String> {
        self.removed.lock().unwrap().clone()
    }

    pub(crate) fn set_root_ok(&self, ok: bool) {
        self.root_ok.store(ok, Ordering::SeqCst);
    }

    pub(crate) fn set_usage(&self, usage: DiskUsage) {
        *self.usage.lock().unwrap() = usage;
    }

    pub(crate) fn set_fail_watch(&self, fail: bool) {
        self.fail_watch.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn watch_calls(&self) -> usize {
        self.watch_calls.load(Ordering::SeqCst)
    }

    /// Senders feeding the most recent watch subscription.
    pub(crate) fn watch_handles(&self) -> Option<WatchHandles> {
        let guard = self.watch_handles.lock().unwrap();
        guard.as_ref().map(|h| WatchHandles {
            events: h.events.clone(),
            errors: h.errors.clone(),
            cancel: h.cancel.clone(),
        })
    }
}

impl FolderFilesystem for FakeFs {
    fn exists(&self, name: &str) -> bool {
        if name.is_empty() {
            return self.root_ok.load(Ordering::SeqCst);
        }
        self.existing.lock().unwrap().contains(name)
    }

    fn is_dir(&self, name: &str) -> bool {
        self.exists(name)
    }

    fn dir_names(&self, name: &str) -> Result<Vec<String>> {
        Ok(self
            .listings
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .unwrap_or_default())
    }

    fn remove_dir(&self, name: &str) -> Result<()> {
        self.removed.lock().unwrap().push(name.to_string());
        self.existing.lock().unwrap().remove(name);
        Ok(())
    }

    fn usage(&self, _path: &Path) -> Result<DiskUsage> {
        Ok(*self.usage.lock().unwrap())
    }

    fn watch(
        &self,
        _matcher: Arc<dyn Matcher>,
        cancel: CancellationToken,
        _ignore_perms: bool,
    ) -> Result<WatchStreams> {
        self.watch_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_watch.load(Ordering::SeqCst) {
            return Err(SyncError::Watch("subscription refused".into()));
        }
        let (event_tx, event_rx) = mpsc::channel(64);
        let (error_tx, error_rx) = mpsc::channel(4);
        *self.watch_handles.lock().unwrap() = Some(WatchHandles {
            events: event_tx,
            errors: error_tx,
            cancel,
        });
        Ok(WatchStreams {
            events: event_rx,
            errors: error_rx,
        })
    }
}

/// [`ControllerHost`] counting running folder loops.
#[derive(Default)]
pub(crate) struct CountingHost {
    running: AtomicUsize,
    started: AtomicUsize,
}

impl CountingHost {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    pub(crate) fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }
}

impl ControllerHost for CountingHost {
    fn folder_started(&self, _folder: &FolderId) {
        self.running.fetch_add(1, Ordering::SeqCst);
        self.started.fetch_add(1, Ordering::SeqCst);
    }

    fn folder_stopped(&self, _folder: &FolderId) {
        self.running.fetch_sub(1, Ordering::SeqCst);
    }
}

/// [`Versioner`] counting clean invocations.
#[derive(Default)]
pub(crate) struct CountingVersioner {
    cleans: AtomicUsize,
}

impl CountingVersioner {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn cleans(&self) -> usize {
        self.cleans.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Versioner for CountingVersioner {
    async fn clean(&self, _cancel: CancellationToken) -> Result<()> {
        self.cleans.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
