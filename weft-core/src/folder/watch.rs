//! Filesystem watch supervision: subscription lifecycle, event
//! aggregation, and capped retry backoff.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use weft_model::FolderId;

use crate::error::SyncError;
use crate::events::{Event, EventLogger};
use crate::fs::{FolderFilesystem, WatchStreams};
use crate::matcher::Matcher;

/// Retry pause after the first failure, and the floor it resets to after a
/// long-lived run.
pub(crate) const WATCH_RETRY_MIN: Duration = Duration::from_secs(60);
/// Cap for the doubling retry pause.
pub(crate) const WATCH_RETRY_MAX: Duration = Duration::from_secs(60 * 60);
/// Window during which raw watcher events coalesce into one batch.
pub(crate) const WATCH_DEBOUNCE: Duration = Duration::from_secs(1);
/// A batch exceeding this many paths flushes before the window closes.
pub(crate) const MAX_WATCH_BATCH: usize = 1024;

/// What to do after a delivery failure, given how long the run lasted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RetryPlan {
    Immediate,
    After(Duration),
}

struct WatchInner {
    cancel: Option<CancellationToken>,
    error: Option<String>,
    pause: Duration,
    started_at: Option<Instant>,
    warned_outside_root: bool,
}

/// Owns the watcher subscription for one folder: starts it, aggregates its
/// events into sorted path batches for the event loop, and retries failed
/// subscriptions with exponential backoff capped at one hour.
pub(crate) struct WatchSupervisor {
    folder: FolderId,
    fs: Arc<dyn FolderFilesystem>,
    matcher: Arc<dyn Matcher>,
    logger: EventLogger,
    ignore_perms: bool,
    batch_tx: mpsc::Sender<Vec<String>>,
    restart_tx: mpsc::Sender<()>,
    inner: Mutex<WatchInner>,
}

impl WatchSupervisor {
    pub(crate) fn new(
        folder: FolderId,
        fs: Arc<dyn FolderFilesystem>,
        matcher: Arc<dyn Matcher>,
        logger: EventLogger,
        ignore_perms: bool,
        batch_tx: mpsc::Sender<Vec<String>>,
        restart_tx: mpsc::Sender<()>,
    ) -> Self {
        Self {
            folder,
            fs,
            matcher,
            logger,
            ignore_perms,
            batch_tx,
            restart_tx,
            inner: Mutex::new(WatchInner {
                cancel: None,
                error: None,
                pause: WATCH_RETRY_MIN,
                started_at: None,
                warned_outside_root: false,
            }),
        }
    }

    /// Subscribe to the filesystem and begin aggregating events. Only
    /// called from the event loop; a previous subscription is torn down
    /// first.
    pub(crate) fn start(self: &Arc<Self>) {
        self.stop();
        let cancel = CancellationToken::new();
        {
            let mut inner = self.inner.lock().unwrap();
            inner.cancel = Some(cancel.clone());
            inner.started_at = Some(Instant::now());
        }

        match self.fs.watch(
            Arc::clone(&self.matcher),
            cancel.clone(),
            self.ignore_perms,
        ) {
            Ok(streams) => {
                debug!(target: "folder::watch", folder = %self.folder, "watching folder");
                self.record_error(None);
                Arc::clone(self).spawn_aggregator(cancel, streams);
            }
            Err(err) => self.start_failed(err),
        }
    }

    /// Cancel the current subscription, if any. Idempotent and safe from
    /// any task.
    pub(crate) fn stop(&self) {
        if let Some(cancel) = self.inner.lock().unwrap().cancel.take() {
            cancel.cancel();
        }
    }

    /// Coalesced wake asking the event loop to stop and restart the
    /// watcher.
    pub(crate) fn schedule_restart(&self) {
        let _ = self.restart_tx.try_send(());
    }

    /// Latest recorded subscription or delivery error.
    pub(crate) fn error(&self) -> Option<String> {
        self.inner.lock().unwrap().error.clone()
    }

    /// Request an immediate full scan when an error is latched, so changes
    /// the dead watcher missed are picked up.
    pub(crate) fn scan_on_error(&self) {
        if self.inner.lock().unwrap().error.is_some() {
            let _ = self.batch_tx.try_send(Vec::new());
        }
    }

    fn start_failed(self: &Arc<Self>, err: SyncError) {
        let delay = {
            let mut inner = self.inner.lock().unwrap();
            inner.cancel = None;
            let delay = inner.pause;
            inner.pause = (inner.pause * 2).min(WATCH_RETRY_MAX);
            delay
        };
        warn!(
            target: "folder::watch",
            folder = %self.folder,
            error = %err,
            retry_in = ?delay,
            "failed to start watching folder",
        );
        self.record_error(Some(err.to_string()));
        self.spawn_retry(delay);
    }

    fn run_failed(self: &Arc<Self>, err: SyncError) {
        self.stop();
        if matches!(err, SyncError::WatchOutsideRoot(_)) {
            let warned = {
                let mut inner = self.inner.lock().unwrap();
                std::mem::replace(&mut inner.warned_outside_root, true)
            };
            if !warned {
                warn!(
                    target: "folder::watch",
                    folder = %self.folder,
                    error = %err,
                    "watcher delivered an event outside the folder root",
                );
            }
            self.logger.log(Event::Failure {
                error: err.to_string(),
            });
        }
        self.record_error(Some(err.to_string()));

        match self.run_failure_plan(Instant::now()) {
            RetryPlan::Immediate => self.schedule_restart(),
            RetryPlan::After(delay) => {
                debug!(
                    target: "folder::watch",
                    folder = %self.folder,
                    retry_in = ?delay,
                    "watcher failed early, waiting out the pause",
                );
                self.spawn_retry(delay);
            }
        }
    }

    /// A run at least as long as the current pause earns an immediate
    /// restart with the pause reset; a shorter one waits out the remainder.
    fn run_failure_plan(&self, now: Instant) -> RetryPlan {
        let mut inner = self.inner.lock().unwrap();
        let elapsed = inner
            .started_at
            .map(|at| now.saturating_duration_since(at))
            .unwrap_or_default();
        if elapsed >= inner.pause {
            inner.pause = WATCH_RETRY_MIN;
            RetryPlan::Immediate
        } else {
            RetryPlan::After(inner.pause - elapsed)
        }
    }

    fn spawn_retry(self: &Arc<Self>, delay: Duration) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            this.schedule_restart();
        });
    }

    fn record_error(&self, new: Option<String>) {
        let previous = {
            let mut inner = self.inner.lock().unwrap();
            if inner.error == new {
                return;
            }
            std::mem::replace(&mut inner.error, new.clone())
        };
        info!(
            target: "folder::watch",
            folder = %self.folder,
            from = ?previous,
            to = ?new,
            "watcher state changed",
        );
        self.logger.log(Event::FolderWatchStateChanged {
            folder: self.folder.clone(),
            from: previous,
            to: new.clone(),
        });
        if new.is_some() {
            // Changes made while the watcher was down are only found by
            // rescanning everything.
            self.scan_on_error();
        }
    }

    fn spawn_aggregator(
        self: Arc<Self>,
        cancel: CancellationToken,
        mut streams: WatchStreams,
    ) {
        tokio::spawn(async move {
            enum Step {
                Path(Option<String>),
                Fail(Option<SyncError>),
                Flush,
            }

            let mut pending: BTreeSet<String> = BTreeSet::new();
            loop {
                if pending.len() >= MAX_WATCH_BATCH {
                    self.deliver(&mut pending, &cancel).await;
                }

                let step = if pending.is_empty() {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        path = streams.events.recv() => Step::Path(path),
                        err = streams.errors.recv() => Step::Fail(err),
                    }
                } else {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        path = timeout(WATCH_DEBOUNCE, streams.events.recv()) => {
                            match path {
                                Ok(path) => Step::Path(path),
                                Err(_) => Step::Flush,
                            }
                        }
                        err = streams.errors.recv() => Step::Fail(err),
                    }
                };

                match step {
                    Step::Path(Some(path)) => {
                        pending.insert(path);
                    }
                    Step::Flush => {
                        self.deliver(&mut pending, &cancel).await;
                    }
                    Step::Path(None) => {
                        if !cancel.is_cancelled() {
                            self.run_failed(SyncError::Watch(
                                "event stream closed".into(),
                            ));
                        }
                        return;
                    }
                    Step::Fail(err) => {
                        if !cancel.is_cancelled() {
                            self.run_failed(err.unwrap_or_else(|| {
                                SyncError::Watch(
                                    "error stream closed".into(),
                                )
                            }));
                        }
                        return;
                    }
                }
            }
        });
    }

    async fn deliver(
        &self,
        pending: &mut BTreeSet<String>,
        cancel: &CancellationToken,
    ) {
        if pending.is_empty() {
            return;
        }
        let batch: Vec<String> =
            std::mem::take(pending).into_iter().collect();
        debug!(
            target: "folder::watch",
            folder = %self.folder,
            paths = batch.len(),
            "delivering watch batch",
        );
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = self.batch_tx.send(batch) => {}
        }
    }
}

impl fmt::Debug for WatchSupervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("WatchSupervisor");
        debug.field("folder", &self.folder);
        match self.inner.try_lock() {
            Ok(inner) => {
                debug
                    .field("running", &inner.cancel.is_some())
                    .field("error", &inner.error)
                    .field("pause", &inner.pause);
            }
            Err(_) => {
                debug.field("inner", &"<locked>");
            }
        }
        debug.finish()
    }
}
