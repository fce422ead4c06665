//! Filesystem access for one folder root.
//!
//! The controller goes through [`FolderFilesystem`] for every disk probe so
//! tests can substitute a scripted filesystem. [`OsFilesystem`] is the real
//! adapter: std metadata calls plus a `notify` watch subscription bridged
//! into tokio channels.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::error::{Result, SyncError};
use crate::matcher::Matcher;

/// Free and total bytes on the filesystem backing a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskUsage {
    pub free: u64,
    pub total: u64,
}

/// Channels delivering one watch subscription's output. Paths are
/// folder-relative with `/` separators; the subscription ends when the
/// cancellation token supplied to [`FolderFilesystem::watch`] fires.
pub struct WatchStreams {
    pub events: mpsc::Receiver<String>,
    pub errors: mpsc::Receiver<SyncError>,
}

impl fmt::Debug for WatchStreams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchStreams").finish_non_exhaustive()
    }
}

/// Filesystem operations the controller needs against a folder root.
pub trait FolderFilesystem: Send + Sync {
    /// Whether `name` exists (without following a final symlink). The empty
    /// name addresses the folder root.
    fn exists(&self, name: &str) -> bool;

    /// Whether `name` is a directory.
    fn is_dir(&self, name: &str) -> bool;

    /// Child entry names of the directory `name`.
    fn dir_names(&self, name: &str) -> Result<Vec<String>>;

    /// Remove the (empty) directory `name`.
    fn remove_dir(&self, name: &str) -> Result<()>;

    /// Disk usage of the filesystem backing `path` (an absolute path, not
    /// necessarily under the folder root).
    fn usage(&self, path: &Path) -> Result<DiskUsage>;

    /// Subscribe to change notifications under the folder root. Events for
    /// paths the matcher ignores are filtered out; events that resolve
    /// outside the root surface as [`SyncError::WatchOutsideRoot`] on the
    /// error stream.
    fn watch(
        &self,
        matcher: Arc<dyn Matcher>,
        cancel: CancellationToken,
        ignore_perms: bool,
    ) -> Result<WatchStreams>;
}

/// [`FolderFilesystem`] backed by the operating system.
#[derive(Debug, Clone)]
pub struct OsFilesystem {
    root: PathBuf,
}

impl OsFilesystem {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, name: &str) -> PathBuf {
        let mut path = self.root.clone();
        for part in name.split('/').filter(|p| !p.is_empty() && *p != ".") {
            path.push(part);
        }
        path
    }
}

/// Folder-relative `/`-separated name for `path`, or `None` when `path`
/// does not lie under `root`.
fn relative_name(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let mut name = String::new();
    for component in rel.components() {
        match component {
            std::path::Component::Normal(seg) => {
                if !name.is_empty() {
                    name.push('/');
                }
                name.push_str(&seg.to_string_lossy());
            }
            std::path::Component::CurDir => {}
            _ => return None,
        }
    }
    Some(name)
}

impl FolderFilesystem for OsFilesystem {
    fn exists(&self, name: &str) -> bool {
        self.resolve(name).symlink_metadata().is_ok()
    }

    fn is_dir(&self, name: &str) -> bool {
        self.resolve(name).is_dir()
    }

    fn dir_names(&self, name: &str) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(self.resolve(name))? {
            names.push(entry?.file_name().to_string_lossy().into_owned());
        }
        names.sort_unstable();
        Ok(names)
    }

    fn remove_dir(&self, name: &str) -> Result<()> {
        std::fs::remove_dir(self.resolve(name))?;
        Ok(())
    }

    fn usage(&self, path: &Path) -> Result<DiskUsage> {
        Ok(DiskUsage {
            free: fs2::available_space(path)?,
            total: fs2::total_space(path)?,
        })
    }

    fn watch(
        &self,
        matcher: Arc<dyn Matcher>,
        cancel: CancellationToken,
        _ignore_perms: bool,
    ) -> Result<WatchStreams> {
        if !self.root.is_dir() {
            return Err(SyncError::PathMissing(
                self.root.display().to_string(),
            ));
        }

        let (event_tx, event_rx) = mpsc::channel::<String>(256);
        let (error_tx, error_rx) = mpsc::channel::<SyncError>(4);
        let root = self.root.clone();

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<notify::Event>| match res {
                Ok(event) => {
                    for path in &event.paths {
                        match relative_name(&root, path) {
                            Some(name) => {
                                if !matcher.is_ignored(&name) {
                                    let _ = event_tx.blocking_send(name);
                                }
                            }
                            None => {
                                let _ = error_tx.blocking_send(
                                    SyncError::WatchOutsideRoot(
                                        path.display().to_string(),
                                    ),
                                );
                            }
                        }
                    }
                }
                Err(err) => {
                    let _ = error_tx
                        .blocking_send(SyncError::Watch(err.to_string()));
                }
            },
            notify::Config::default(),
        )
        .map_err(|err| SyncError::Watch(err.to_string()))?;

        watcher
            .watch(&self.root, RecursiveMode::Recursive)
            .map_err(|err| SyncError::Watch(err.to_string()))?;

        let root = self.root.clone();
        tokio::spawn(async move {
            cancel.cancelled().await;
            trace!(target: "folder::watch", root = %root.display(), "dropping watch subscription");
            drop(watcher);
        });

        Ok(WatchStreams {
            events: event_rx,
            errors: error_rx,
        })
    }
}
