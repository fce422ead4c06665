//! The per-folder synchronization controller.
//!
//! One [`Folder`] instance manages one shared folder: it detects local
//! filesystem changes, reconciles them with the durable index, and drives
//! the external puller that requests missing content from peers. All
//! stimuli (timers, watcher batches, configuration pokes, user-triggered
//! rescans) funnel through a single event-loop task; the loop is the sole
//! writer of scan/pull decision state, which replaces fine-grained locking
//! with serialization.

use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use tokio::sync::{mpsc, oneshot, watch as watch_ch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use weft_model::{DeviceId, FolderConfig, FolderId, FolderType, LocalFlags};

use crate::error::{Result, SyncError};
use crate::events::EventLogger;
use crate::fs::{FolderFilesystem, OsFilesystem};
use crate::index::FileSet;
use crate::limiter::IoLimiter;
use crate::matcher::Matcher;
use crate::puller::Puller;
use crate::scanner::Scanner;
use crate::versioner::Versioner;

pub mod state;

pub(crate) mod batch;
pub(crate) mod subtrees;
pub(crate) mod watch;

mod scan;
#[cfg(test)]
pub(crate) mod testutil;

pub use state::{ErrorJournal, FileError, FolderState, StateTracker};

use watch::WatchSupervisor;

/// Name of the ignore-pattern file at the folder root.
pub const IGNORE_FILE: &str = ".weftignore";

/// Minimum free space required on the database path before scans and pulls
/// run; the health check also requires one percent of the disk.
pub(crate) const MIN_FREE_BYTES: u64 = 64 << 20;

/// Consecutive pull failures double the pause up to this many times the
/// configured base.
const PULL_PAUSE_CAP_FACTOR: u32 = 60;

/// Marker in conflict-copy filenames; such entries never participate in
/// rename detection.
pub(crate) const CONFLICT_MARKER: &str = ".weft-conflict-";

/// Names carried on a `LocalIndexUpdated` event are capped at this.
pub(crate) const MAX_EVENT_FILENAMES: usize = 25;

/// Narrow, non-owning handle to the parent model. The registry owning the
/// controllers implements this; the controller only reports loop lifetime.
pub trait ControllerHost: Send + Sync {
    /// The controller's event loop has started.
    fn folder_started(&self, folder: &FolderId);
    /// The controller's event loop has exited.
    fn folder_stopped(&self, folder: &FolderId);
}

/// [`ControllerHost`] that ignores all notifications.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHost;

impl ControllerHost for NoopHost {
    fn folder_started(&self, _folder: &FolderId) {}
    fn folder_stopped(&self, _folder: &FolderId) {}
}

/// Work executed inside the event loop's serialization domain.
pub type InSyncWork = Box<dyn FnOnce(&mut Folder) -> Result<()> + Send>;

enum LoopRequest {
    Scan {
        subs: Vec<String>,
        reply: oneshot::Sender<Result<()>>,
    },
    InSync {
        work: InSyncWork,
        reply: oneshot::Sender<Result<()>>,
    },
}

impl fmt::Debug for LoopRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoopRequest::Scan { subs, .. } => f
                .debug_struct("LoopRequest::Scan")
                .field("subs", subs)
                .finish_non_exhaustive(),
            LoopRequest::InSync { .. } => {
                f.debug_struct("LoopRequest::InSync").finish_non_exhaustive()
            }
        }
    }
}

/// State reachable from outside the event loop. Fields mutated from
/// asynchronous entry points carry their own locks and are never held
/// across a suspension.
pub(crate) struct Shared {
    pub(crate) state: StateTracker,
    pub(crate) errors: ErrorJournal,
    pub(crate) watch: Arc<WatchSupervisor>,
    pub(crate) forced: Mutex<BTreeSet<String>>,
    pull_tx: mpsc::Sender<()>,
    forced_tx: mpsc::Sender<()>,
    delay_tx: mpsc::Sender<Duration>,
    request_tx: mpsc::Sender<LoopRequest>,
    initial_scan_tx: watch_ch::Sender<bool>,
    initial_scan_rx: watch_ch::Receiver<bool>,
    done_tx: watch_ch::Sender<bool>,
    done_rx: watch_ch::Receiver<bool>,
}

impl Shared {
    /// Edge-triggered, coalescing pull request.
    pub(crate) fn schedule_pull(&self) {
        let _ = self.pull_tx.try_send(());
    }
}

struct LoopChannels {
    pull_rx: mpsc::Receiver<()>,
    forced_rx: mpsc::Receiver<()>,
    restart_watch_rx: mpsc::Receiver<()>,
    delay_rx: mpsc::Receiver<Duration>,
    request_rx: mpsc::Receiver<LoopRequest>,
    watch_batch_rx: mpsc::Receiver<Vec<String>>,
}

/// Per-folder synchronization controller. Constructed through
/// [`FolderBuilder`], handed to a supervisor that calls [`Folder::serve`]
/// exactly once, and addressed from elsewhere through [`FolderHandle`].
pub struct Folder {
    cfg: FolderConfig,
    host: Arc<dyn ControllerHost>,
    fset: Arc<dyn FileSet>,
    matcher: Arc<dyn Matcher>,
    scanner: Arc<dyn Scanner>,
    puller: Arc<dyn Puller>,
    versioner: Option<Arc<dyn Versioner>>,
    fs: Arc<dyn FolderFilesystem>,
    logger: EventLogger,
    io_limiter: IoLimiter,
    db_path: PathBuf,

    shared: Arc<Shared>,
    cancel: CancellationToken,
    channels: Option<LoopChannels>,
}

impl fmt::Debug for Folder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Folder")
            .field("id", &self.cfg.id)
            .field("folder_type", &self.cfg.folder_type)
            .field("path", &self.cfg.path)
            .field("state", &self.shared.state.state())
            .finish_non_exhaustive()
    }
}

impl Folder {
    /// Start building a controller for `cfg`.
    pub fn builder(cfg: FolderConfig) -> FolderBuilder {
        FolderBuilder::new(cfg)
    }

    /// Cloneable external surface of this controller.
    pub fn handle(&self) -> FolderHandle {
        FolderHandle {
            id: self.cfg.id.clone(),
            rescan_interval: self.cfg.rescan_interval,
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn config(&self) -> &FolderConfig {
        &self.cfg
    }

    /// Run the controller until `cancel` fires. The `done` latch observable
    /// through the handle closes exactly once, on exit.
    pub async fn serve(mut self, cancel: CancellationToken) {
        self.cancel = cancel;
        self.host.folder_started(&self.cfg.id);
        info!(
            target: "folder",
            folder = %self.cfg.id,
            path = %self.cfg.path.display(),
            "ready to synchronize",
        );

        let mut ch = self
            .channels
            .take()
            .expect("serve is called exactly once");
        let cancel = self.cancel.clone();

        if self.cfg.watcher_enabled && self.health_check(false).is_ok() {
            self.shared.watch.start();
        }

        // The first rescan is unconditional.
        let mut scan_deadline: Option<Instant> = Some(Instant::now());
        let mut clean_deadline = match (&self.versioner, self.cfg.clean_interval)
        {
            (Some(_), interval) if !interval.is_zero() => {
                Some(Instant::now() + interval)
            }
            _ => None,
        };
        let mut pull_fail_deadline: Option<Instant> = None;
        let mut pull_pause = self.cfg.pull_pause_base;
        let mut initial_pull_pending = true;
        let mut initial_rx = self.shared.initial_scan_rx.clone();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,

                _ = sleep_until(&scan_deadline), if scan_deadline.is_some() => {
                    scan_deadline = None;
                    if let Err(err) = self.scan_subdirs(Vec::new()).await {
                        debug!(target: "folder::scan", folder = %self.cfg.id, error = %err, "timed scan failed");
                    }
                    self.mark_initial_scan_complete();
                    scan_deadline = self.next_scan_deadline();
                }

                _ = ch.pull_rx.recv() => {
                    self.pull(&mut pull_pause, &mut pull_fail_deadline).await;
                }

                _ = sleep_until(&pull_fail_deadline), if pull_fail_deadline.is_some() => {
                    pull_fail_deadline = None;
                    if !self.pull(&mut pull_pause, &mut pull_fail_deadline).await {
                        let cap = self.cfg.pull_pause_base * PULL_PAUSE_CAP_FACTOR;
                        if pull_pause < cap {
                            pull_pause = (pull_pause * 2).min(cap);
                        }
                    }
                }

                changed = initial_rx.changed(), if initial_pull_pending => {
                    initial_pull_pending = false;
                    if changed.is_ok() {
                        self.pull(&mut pull_pause, &mut pull_fail_deadline).await;
                    }
                }

                _ = ch.forced_rx.recv() => {
                    self.forced_rescan().await;
                    self.mark_initial_scan_complete();
                }

                Some(request) = ch.request_rx.recv() => {
                    match request {
                        LoopRequest::Scan { subs, reply } => {
                            let result = self.scan_subdirs(subs).await;
                            self.mark_initial_scan_complete();
                            let _ = reply.send(result);
                        }
                        LoopRequest::InSync { work, reply } => {
                            let _ = reply.send(work(&mut self));
                        }
                    }
                }

                Some(delay) = ch.delay_rx.recv() => {
                    scan_deadline = Some(Instant::now() + delay);
                }

                Some(paths) = ch.watch_batch_rx.recv() => {
                    if let Err(err) = self.scan_subdirs(paths).await {
                        debug!(target: "folder::scan", folder = %self.cfg.id, error = %err, "watch-triggered scan failed");
                    }
                    self.mark_initial_scan_complete();
                }

                _ = ch.restart_watch_rx.recv() => {
                    if self.cfg.watcher_enabled {
                        self.shared.watch.stop();
                        self.shared.watch.start();
                    }
                    if let Err(err) = self.scan_subdirs(Vec::new()).await {
                        debug!(target: "folder::scan", folder = %self.cfg.id, error = %err, "post-restart scan failed");
                    }
                    self.mark_initial_scan_complete();
                }

                _ = sleep_until(&clean_deadline), if clean_deadline.is_some() => {
                    clean_deadline = None;
                    self.clean_versions().await;
                    clean_deadline = Some(Instant::now() + self.cfg.clean_interval);
                }
            }
        }

        self.shared.watch.stop();
        self.shared.done_tx.send_replace(true);
        self.host.folder_stopped(&self.cfg.id);
        info!(target: "folder", folder = %self.cfg.id, "folder stopped");
    }

    fn mark_initial_scan_complete(&self) {
        self.shared.initial_scan_tx.send_if_modified(|open| {
            if *open {
                false
            } else {
                *open = true;
                true
            }
        });
    }

    fn next_scan_deadline(&self) -> Option<Instant> {
        jittered_rescan_interval(self.cfg.rescan_interval)
            .map(|delay| Instant::now() + delay)
    }

    /// One pull attempt, gated on readiness. Returns `true` when the
    /// attempt succeeded or there is nothing to do, `false` when the
    /// pull-fail timer was armed for a retry.
    async fn pull(
        &mut self,
        pull_pause: &mut Duration,
        fail_deadline: &mut Option<Instant>,
    ) -> bool {
        // Stop and drain the retry timer; a fresh one is armed on failure.
        *fail_deadline = None;

        if !*self.shared.initial_scan_rx.borrow() {
            // A pull is scheduled when the initial scan finishes.
            return true;
        }

        let start = Instant::now();

        let has_need = match self.fset.snapshot() {
            Ok(snap) => {
                let mut any = false;
                snap.with_need(DeviceId::LOCAL, &mut |_| {
                    any = true;
                    false
                });
                any
            }
            Err(err) => {
                self.shared.state.set_error(Some(&err));
                return false;
            }
        };
        if !has_need {
            self.shared.errors.clear_pull();
            return true;
        }

        if let Err(err) = self.health_check(false) {
            self.shared.state.set_error(Some(&err));
            return false;
        }
        self.shared.state.set_error(None);

        let _permit = if self.cfg.folder_type != FolderType::SendOnly {
            self.shared.state.set_state(FolderState::SyncWaiting);
            match self.io_limiter.acquire(&self.cancel).await {
                Ok(permit) => Some(permit),
                // Cancelled acquisition is normal shutdown, not a failure.
                Err(_) => return true,
            }
        } else {
            None
        };

        let ignores_before = self.matcher.hash();
        if let Err(err) = self.matcher.load(&self.cfg.path.join(IGNORE_FILE)) {
            let err = SyncError::IgnoreLoad(err.to_string());
            self.shared.state.set_error(Some(&err));
            return false;
        }

        self.shared.state.set_state(FolderState::Syncing);
        let success = self.puller.pull().await;
        self.shared.state.set_state(FolderState::Idle);

        if self.matcher.hash() != ignores_before {
            self.shared.schedule_pull();
        }

        if success {
            *pull_pause = self.cfg.pull_pause_base;
            return true;
        }

        let delay = *pull_pause + start.elapsed();
        info!(
            target: "folder::pull",
            folder = %self.cfg.id,
            retry_in = ?delay,
            "folder is not fully synchronized, retrying later",
        );
        *fail_deadline = Some(Instant::now() + delay);
        false
    }

    /// Drain the forced-rescan ledger: mark every known entry with a
    /// must-rescan flag, commit the marks, then run a targeted scan over
    /// the drained paths. Unknown paths are silently skipped.
    async fn forced_rescan(&mut self) {
        let paths: Vec<String> = {
            let forced = self.shared.forced.lock().unwrap();
            forced.iter().cloned().collect()
        };
        if paths.is_empty() {
            return;
        }
        debug!(
            target: "folder::scan",
            folder = %self.cfg.id,
            paths = paths.len(),
            "forced rescan",
        );

        let marked = match self.fset.snapshot() {
            Ok(snap) => {
                let mut marked = Vec::new();
                for path in &paths {
                    if let Some(mut fi) = snap.get(DeviceId::LOCAL, path) {
                        fi.local_flags.insert(LocalFlags::MUST_RESCAN);
                        marked.push(fi);
                    }
                }
                marked
            }
            Err(err) => {
                warn!(target: "folder::scan", folder = %self.cfg.id, error = %err, "forced rescan aborted");
                return;
            }
        };

        if !marked.is_empty() {
            // The marks must be committed before the scan snapshots the
            // index, or the scanner will not re-hash the entries.
            let fset = Arc::clone(&self.fset);
            let mut batch = batch::UpdateBatch::new(move |files| {
                fset.update(DeviceId::LOCAL, files)
            });
            for fi in marked {
                batch.append(fi);
                if let Err(err) = batch.flush_if_full() {
                    warn!(target: "folder::scan", folder = %self.cfg.id, error = %err, "forced rescan mark failed");
                    return;
                }
            }
            if let Err(err) = batch.flush() {
                warn!(target: "folder::scan", folder = %self.cfg.id, error = %err, "forced rescan mark failed");
                return;
            }
        }

        if let Err(err) = self.scan_subdirs(paths.clone()).await {
            debug!(target: "folder::scan", folder = %self.cfg.id, error = %err, "forced rescan failed");
        }

        // Entries the scan updated removed themselves; drop the rest so the
        // ledger does not grow without bound.
        let mut forced = self.shared.forced.lock().unwrap();
        for path in &paths {
            forced.remove(path);
        }
    }

    async fn clean_versions(&self) {
        let Some(versioner) = &self.versioner else {
            return;
        };
        self.shared.state.set_state(FolderState::CleanWaiting);
        let permit = match self.io_limiter.acquire(&self.cancel).await {
            Ok(permit) => permit,
            Err(_) => return,
        };
        self.shared.state.set_state(FolderState::Cleaning);
        if let Err(err) = versioner.clean(self.cancel.child_token()).await {
            warn!(target: "folder", folder = %self.cfg.id, error = %err, "version cleanup failed");
        }
        drop(permit);
        self.shared.state.set_state(FolderState::Idle);
    }
}

async fn sleep_until(deadline: &Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(*at).await,
        None => std::future::pending().await,
    }
}

/// Uniformly random delay in `[3/4 * interval, 5/4 * interval]`, or `None`
/// when timed rescans are disabled.
pub(crate) fn jittered_rescan_interval(
    interval: Duration,
) -> Option<Duration> {
    if interval.is_zero() {
        return None;
    }
    let lower = interval.mul_f64(0.75).as_secs_f64();
    let upper = interval.mul_f64(1.25).as_secs_f64();
    let jittered = rand::thread_rng().gen_range(lower..=upper);
    Some(Duration::from_secs_f64(jittered))
}

/// Cloneable external surface of a [`Folder`]. All methods are safe from
/// any task; they reach the loop only through coalescing signals, the
/// serialized request channel, and the `done` latch.
#[derive(Clone)]
pub struct FolderHandle {
    id: FolderId,
    rescan_interval: Duration,
    shared: Arc<Shared>,
}

impl FolderHandle {
    pub fn id(&self) -> &FolderId {
        &self.id
    }

    /// Ask for a pull soon. Any number of calls between loop turns
    /// collapse into one pending pull.
    pub fn schedule_pull(&self) {
        self.shared.schedule_pull();
    }

    /// Reset the rescan timer to fire after `delay`.
    pub fn delay_scan(&self, delay: Duration) {
        let _ = self.shared.delay_tx.try_send(delay);
    }

    /// Pick a fresh randomized rescan deadline.
    pub fn reschedule(&self) {
        if let Some(delay) = jittered_rescan_interval(self.rescan_interval) {
            self.delay_scan(delay);
        }
    }

    /// Remember `path` for re-hashing and wake the loop. The entry is
    /// dropped automatically once a scan or pull updates it.
    pub fn schedule_force_rescan(&self, path: impl Into<String>) {
        {
            let mut forced = self.shared.forced.lock().unwrap();
            forced.insert(path.into());
        }
        let _ = self.shared.forced_tx.try_send(());
    }

    /// Run a targeted scan inside the loop. Blocks until the initial scan
    /// has completed at least once, then until the requested scan finishes.
    /// Returns [`SyncError::Cancelled`] once the controller has stopped.
    pub async fn scan(&self, subs: Vec<String>) -> Result<()> {
        let mut initial = self.shared.initial_scan_rx.clone();
        let mut done = self.shared.done_rx.clone();
        tokio::select! {
            changed = initial.wait_for(|open| *open) => {
                if changed.is_err() {
                    return Err(SyncError::Cancelled);
                }
            }
            _ = done.wait_for(|closed| *closed) => {
                return Err(SyncError::Cancelled);
            }
        }
        self.request(|reply| LoopRequest::Scan { subs, reply }).await
    }

    /// Execute `work` inside the loop's serialization domain and return
    /// its result.
    pub async fn run_in_sync(
        &self,
        work: impl FnOnce(&mut Folder) -> Result<()> + Send + 'static,
    ) -> Result<()> {
        self.request(|reply| LoopRequest::InSync {
            work: Box::new(work),
            reply,
        })
        .await
    }

    async fn request(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<()>>) -> LoopRequest,
    ) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .shared
            .request_tx
            .send(make(reply_tx))
            .await
            .is_err()
        {
            return Err(SyncError::Cancelled);
        }
        reply_rx.await.unwrap_or(Err(SyncError::Cancelled))
    }

    /// Merged scan and pull errors, sorted by path.
    pub fn errors(&self) -> Vec<FileError> {
        self.shared.errors.all()
    }

    /// Latest recorded watcher error, if any.
    pub fn watch_error(&self) -> Option<String> {
        self.shared.watch.error()
    }

    /// Ask the loop to stop and restart the filesystem watcher.
    pub fn schedule_watch_restart(&self) {
        self.shared.watch.schedule_restart();
    }

    pub fn state(&self) -> FolderState {
        self.shared.state.state()
    }

    pub fn folder_error(&self) -> Option<String> {
        self.shared.state.error()
    }

    /// Resolves once the controller's event loop has exited.
    pub async fn terminated(&self) {
        let mut done = self.shared.done_rx.clone();
        let _ = done.wait_for(|closed| *closed).await;
    }
}

impl fmt::Debug for FolderHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FolderHandle")
            .field("id", &self.id)
            .field("state", &self.shared.state.state())
            .finish()
    }
}

/// Constructs a [`Folder`] from its collaborators, supplying defaults for
/// the optional ones.
pub struct FolderBuilder {
    cfg: FolderConfig,
    db_path: Option<PathBuf>,
    host: Option<Arc<dyn ControllerHost>>,
    fset: Option<Arc<dyn FileSet>>,
    matcher: Option<Arc<dyn Matcher>>,
    scanner: Option<Arc<dyn Scanner>>,
    puller: Option<Arc<dyn Puller>>,
    versioner: Option<Arc<dyn Versioner>>,
    fs: Option<Arc<dyn FolderFilesystem>>,
    logger: Option<EventLogger>,
    io_limiter: Option<IoLimiter>,
}

impl FolderBuilder {
    pub fn new(cfg: FolderConfig) -> Self {
        Self {
            cfg,
            db_path: None,
            host: None,
            fset: None,
            matcher: None,
            scanner: None,
            puller: None,
            versioner: None,
            fs: None,
            logger: None,
            io_limiter: None,
        }
    }

    pub fn with_host(mut self, host: Arc<dyn ControllerHost>) -> Self {
        self.host = Some(host);
        self
    }

    pub fn with_file_set(mut self, fset: Arc<dyn FileSet>) -> Self {
        self.fset = Some(fset);
        self
    }

    pub fn with_matcher(mut self, matcher: Arc<dyn Matcher>) -> Self {
        self.matcher = Some(matcher);
        self
    }

    pub fn with_scanner(mut self, scanner: Arc<dyn Scanner>) -> Self {
        self.scanner = Some(scanner);
        self
    }

    pub fn with_puller(mut self, puller: Arc<dyn Puller>) -> Self {
        self.puller = Some(puller);
        self
    }

    pub fn with_versioner(mut self, versioner: Arc<dyn Versioner>) -> Self {
        self.versioner = Some(versioner);
        self
    }

    pub fn with_filesystem(mut self, fs: Arc<dyn FolderFilesystem>) -> Self {
        self.fs = Some(fs);
        self
    }

    pub fn with_event_logger(mut self, logger: EventLogger) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn with_io_limiter(mut self, limiter: IoLimiter) -> Self {
        self.io_limiter = Some(limiter);
        self
    }

    /// Path whose filesystem must keep a minimum of free space for the
    /// index database. Defaults to the folder root.
    pub fn with_db_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.db_path = Some(path.into());
        self
    }

    pub fn build(self) -> Result<Folder> {
        let cfg = self.cfg;
        let fset = self
            .fset
            .ok_or_else(|| SyncError::Internal("file set missing".into()))?;
        let matcher = self
            .matcher
            .ok_or_else(|| SyncError::Internal("matcher missing".into()))?;
        let scanner = self
            .scanner
            .ok_or_else(|| SyncError::Internal("scanner missing".into()))?;
        let puller = self
            .puller
            .ok_or_else(|| SyncError::Internal("puller missing".into()))?;
        let host = self.host.unwrap_or_else(|| Arc::new(NoopHost));
        let fs: Arc<dyn FolderFilesystem> = self
            .fs
            .unwrap_or_else(|| Arc::new(OsFilesystem::new(&cfg.path)));
        let logger = self.logger.unwrap_or_default();
        let io_limiter = self.io_limiter.unwrap_or_default();
        let db_path = self.db_path.unwrap_or_else(|| cfg.path.clone());

        let (pull_tx, pull_rx) = mpsc::channel(1);
        let (forced_tx, forced_rx) = mpsc::channel(1);
        let (restart_tx, restart_watch_rx) = mpsc::channel(1);
        let (delay_tx, delay_rx) = mpsc::channel(1);
        let (request_tx, request_rx) = mpsc::channel(1);
        let (watch_batch_tx, watch_batch_rx) = mpsc::channel(1);
        let (initial_scan_tx, initial_scan_rx) = watch_ch::channel(false);
        let (done_tx, done_rx) = watch_ch::channel(false);

        let watch = Arc::new(WatchSupervisor::new(
            cfg.id.clone(),
            Arc::clone(&fs),
            Arc::clone(&matcher),
            logger.clone(),
            cfg.ignore_perms,
            watch_batch_tx,
            restart_tx,
        ));

        let shared = Arc::new(Shared {
            state: StateTracker::new(cfg.id.clone(), logger.clone()),
            errors: ErrorJournal::new(),
            watch,
            forced: Mutex::new(BTreeSet::new()),
            pull_tx,
            forced_tx,
            delay_tx,
            request_tx,
            initial_scan_tx,
            initial_scan_rx,
            done_tx,
            done_rx,
        });

        Ok(Folder {
            cfg,
            host,
            fset,
            matcher,
            scanner,
            puller,
            versioner: self.versioner,
            fs,
            logger,
            io_limiter,
            db_path,
            shared,
            cancel: CancellationToken::new(),
            channels: Some(LoopChannels {
                pull_rx,
                forced_rx,
                restart_watch_rx,
                delay_rx,
                request_rx,
                watch_batch_rx,
            }),
        })
    }
}

impl fmt::Debug for FolderBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FolderBuilder")
            .field("id", &self.cfg.id)
            .field("file_set_set", &self.fset.is_some())
            .field("matcher_set", &self.matcher.is_some())
            .field("scanner_set", &self.scanner.is_some())
            .field("puller_set", &self.puller.is_some())
            .field("versioner_set", &self.versioner.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::*;
    use super::*;
    use weft_model::ShortDeviceId;

    struct Harness {
        handle: FolderHandle,
        cancel: CancellationToken,
        serve: tokio::task::JoinHandle<()>,
        fset: Arc<MemFileSet>,
        scanner: Arc<ScriptedScanner>,
        puller: Arc<ScriptedPuller>,
        fs: Arc<FakeFs>,
        host: Arc<CountingHost>,
        versioner: Arc<CountingVersioner>,
    }

    struct Fixture {
        cfg: FolderConfig,
        fset: Arc<MemFileSet>,
        scanner: Arc<ScriptedScanner>,
        matcher: Arc<TableMatcher>,
        puller: Arc<ScriptedPuller>,
        fs: Arc<FakeFs>,
        host: Arc<CountingHost>,
        versioner: Arc<CountingVersioner>,
    }

    fn fixture() -> Fixture {
        let mut cfg = FolderConfig::new("loop-test", "/weft/loop-test");
        cfg.short_id = ShortDeviceId(42);
        cfg.rescan_interval = Duration::ZERO;
        cfg.clean_interval = Duration::ZERO;
        cfg.pull_pause_base = Duration::from_millis(100);
        Fixture {
            cfg,
            fset: Arc::new(MemFileSet::new()),
            scanner: Arc::new(ScriptedScanner::new()),
            matcher: Arc::new(TableMatcher::new()),
            puller: Arc::new(ScriptedPuller::new()),
            fs: Arc::new(FakeFs::new()),
            host: Arc::new(CountingHost::new()),
            versioner: Arc::new(CountingVersioner::new()),
        }
    }

    impl Fixture {
        fn build(self) -> (Folder, Harness) {
            let folder = Folder::builder(self.cfg)
                .with_host(Arc::clone(&self.host) as _)
                .with_file_set(Arc::clone(&self.fset) as _)
                .with_matcher(Arc::clone(&self.matcher) as _)
                .with_scanner(Arc::clone(&self.scanner) as _)
                .with_puller(Arc::clone(&self.puller) as _)
                .with_versioner(Arc::clone(&self.versioner) as _)
                .with_filesystem(Arc::clone(&self.fs) as _)
                .with_io_limiter(IoLimiter::new(2))
                .build()
                .unwrap();
            let handle = folder.handle();
            let cancel = CancellationToken::new();
            let harness = Harness {
                handle,
                cancel,
                serve: tokio::spawn(async {}),
                fset: self.fset,
                scanner: self.scanner,
                puller: self.puller,
                fs: self.fs,
                host: self.host,
                versioner: self.versioner,
            };
            (folder, harness)
        }

        fn spawn(self) -> Harness {
            let (folder, mut harness) = self.build();
            harness.serve =
                tokio::spawn(folder.serve(harness.cancel.clone()));
            harness
        }
    }

    /// Poll `cond` until it holds. The generous timeout doubles as the
    /// virtual-time budget for `start_paused` tests.
    async fn wait_for(mut cond: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(1800), async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    async fn shutdown(harness: Harness) {
        harness.cancel.cancel();
        harness.handle.terminated().await;
        let _ = harness.serve.await;
    }

    #[tokio::test(start_paused = true)]
    async fn first_run_scans_then_pulls() {
        let mut fx = fixture();
        fx.cfg.rescan_interval = Duration::from_secs(30);
        // One file is needed from the cluster, so the initial pull has
        // something to do.
        fx.fset.insert_global(file("needed.txt", 8));
        let h = fx.spawn();

        // Scan timer fires at once; the initial-scan latch opens and a
        // pull follows directly.
        wait_for(|| h.scanner.walk_count() >= 1).await;
        wait_for(|| h.puller.calls() >= 1).await;

        // The rescan timer keeps running on its jittered interval.
        wait_for(|| h.scanner.walk_count() >= 2).await;
        shutdown(h).await;
    }

    #[tokio::test]
    async fn scan_blocks_until_initial_scan_completed() {
        let (folder, h) = fixture().build();
        let waiter = {
            let handle = h.handle.clone();
            tokio::spawn(async move { handle.scan(Vec::new()).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(
            !waiter.is_finished(),
            "scan must block before the initial scan",
        );

        let serve = tokio::spawn(folder.serve(h.cancel.clone()));
        waiter.await.unwrap().unwrap();

        h.cancel.cancel();
        h.handle.terminated().await;
        let _ = serve.await;
    }

    #[tokio::test]
    async fn thousand_schedule_pulls_coalesce_into_one() {
        let fx = fixture();
        fx.fset.insert_global(file("needed.txt", 8));
        fx.puller.hold();
        let h = fx.spawn();

        // The initial pull is running, parked inside the puller.
        wait_for(|| h.puller.calls() == 1).await;
        for _ in 0..1000 {
            h.handle.schedule_pull();
        }
        h.puller.release(2000);

        wait_for(|| h.puller.calls() >= 2).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(
            h.puller.calls(),
            2,
            "1000 requests during one pull collapse into exactly one more",
        );
        shutdown(h).await;
    }

    #[tokio::test(start_paused = true)]
    async fn failed_pulls_retry_with_backoff_until_success() {
        let fx = fixture();
        fx.fset.insert_global(file("needed.txt", 8));
        for _ in 0..4 {
            fx.puller.push_result(false);
        }
        let h = fx.spawn();

        // Four failures re-arm the retry timer each time; the fifth
        // attempt (scripted default) succeeds without external prodding.
        wait_for(|| h.puller.calls() >= 5).await;
        shutdown(h).await;
    }

    #[tokio::test]
    async fn forced_rescan_marks_entries_before_the_targeted_scan() {
        let fx = fixture();
        fx.fset.insert_local(dir("a"));
        fx.fset.insert_local(file("a/file", 7));
        fx.fs.add("a");
        fx.fs.add("a/file");
        let h = fx.spawn();
        wait_for(|| h.scanner.walk_count() >= 1).await;

        h.handle.schedule_force_rescan("a/file");
        h.handle.schedule_force_rescan("ghost");

        wait_for(|| h.scanner.walk_count() >= 2).await;
        assert!(
            h.scanner
                .requests()
                .iter()
                .any(|subs| subs.contains(&"a/file".to_string())),
            "the targeted scan must cover the forced path",
        );
        assert!(
            h.fset.get_local("a/file").unwrap().must_rescan(),
            "the mark must be committed before the scan runs",
        );
        assert!(
            !h.fset.local_names().contains(&"ghost".to_string()),
            "paths without index entries are silently skipped",
        );
        wait_for(|| h.handle.shared.forced.lock().unwrap().is_empty()).await;
        shutdown(h).await;
    }

    #[tokio::test(start_paused = true)]
    async fn watch_batches_trigger_targeted_scans() {
        let mut fx = fixture();
        fx.cfg.watcher_enabled = true;
        let h = fx.spawn();

        wait_for(|| h.fs.watch_calls() >= 1).await;
        wait_for(|| h.scanner.walk_count() >= 1).await;

        let handles = h.fs.watch_handles().unwrap();
        handles.events.send("x/one".into()).await.unwrap();
        handles.events.send("x/two".into()).await.unwrap();

        // The aggregator debounces, dedupes, and the normalizer promotes
        // both paths to their unknown parent.
        wait_for(|| h.scanner.walk_count() >= 2).await;
        assert_eq!(
            h.scanner.requests().last().unwrap(),
            &vec!["x".to_string()],
        );
        shutdown(h).await;
    }

    #[tokio::test(start_paused = true)]
    async fn watcher_failures_retry_and_force_full_scans() {
        let mut fx = fixture();
        fx.cfg.watcher_enabled = true;
        fx.fs.set_fail_watch(true);
        let h = fx.spawn();

        wait_for(|| h.handle.watch_error().is_some()).await;
        // Retry backoff keeps resubscribing without outside help.
        wait_for(|| h.fs.watch_calls() >= 3).await;
        // The latched error forces full rescans so missed changes are
        // found.
        wait_for(|| h.scanner.walk_count() >= 2).await;
        assert_eq!(h.scanner.requests().last().unwrap().len(), 0);

        h.fs.set_fail_watch(false);
        wait_for(|| h.handle.watch_error().is_none()).await;
        shutdown(h).await;
    }

    #[tokio::test]
    async fn delay_scan_rearms_the_timer() {
        let fx = fixture();
        let h = fx.spawn();
        wait_for(|| h.scanner.walk_count() == 1).await;

        h.handle.delay_scan(Duration::from_millis(10));
        wait_for(|| h.scanner.walk_count() >= 2).await;
        shutdown(h).await;
    }

    #[tokio::test]
    async fn run_in_sync_executes_inside_the_loop() {
        let fx = fixture();
        let h = fx.spawn();

        h.handle
            .run_in_sync(|folder| {
                folder.shared.errors.append_pull("p", "left behind");
                Ok(())
            })
            .await
            .unwrap();
        assert_eq!(h.handle.errors().len(), 1);

        let err = h
            .handle
            .run_in_sync(|_| Err(SyncError::Internal("boom".into())))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Internal(_)));
        shutdown(h).await;
    }

    #[tokio::test(start_paused = true)]
    async fn version_cleanup_runs_on_its_interval() {
        let mut fx = fixture();
        fx.cfg.clean_interval = Duration::from_secs(300);
        let h = fx.spawn();

        wait_for(|| h.versioner.cleans() >= 2).await;
        shutdown(h).await;
    }

    #[tokio::test]
    async fn cancellation_closes_done_and_stops_auxiliaries() {
        let mut fx = fixture();
        fx.cfg.watcher_enabled = true;
        let h = fx.spawn();
        wait_for(|| h.host.running() == 1).await;
        wait_for(|| h.fs.watch_calls() >= 1).await;
        let watch_cancel = h.fs.watch_handles().unwrap().cancel;

        h.cancel.cancel();
        h.handle.terminated().await;

        assert_eq!(h.host.running(), 0);
        assert_eq!(h.host.started(), 1);
        assert!(watch_cancel.is_cancelled(), "watcher must be torn down");

        // The controller is gone; external calls observe cancellation.
        let err = h.handle.scan(Vec::new()).await.unwrap_err();
        assert!(matches!(err, SyncError::Cancelled));
        let _ = h.serve.await;
    }

    #[test]
    fn jittered_interval_stays_within_the_window() {
        assert_eq!(jittered_rescan_interval(Duration::ZERO), None);
        let interval = Duration::from_secs(30);
        for _ in 0..200 {
            let delay = jittered_rescan_interval(interval).unwrap();
            assert!(delay >= Duration::from_secs_f64(22.5), "{delay:?}");
            assert!(delay <= Duration::from_secs_f64(37.5), "{delay:?}");
        }
    }
}
