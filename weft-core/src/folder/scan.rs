//! The scan pipeline: health gating, walk consumption, folder-type
//! policies, rename detection, and deferred-ignore propagation.

use std::collections::HashSet;
use std::path::MAIN_SEPARATOR;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use tokio::sync::mpsc;
use tracing::{debug, info};
use weft_model::{DeviceId, FileInfo, FolderType, LocalFlags};

use crate::error::{Result, SyncError};
use crate::events::{ChangeAction, Event};
use crate::index::IndexSnapshot;
use crate::scanner::{ScanEntry, WalkRequest};

use super::batch::UpdateBatch;
use super::state::FolderState;
use super::subtrees::{is_descendant, normalize_subtrees};
use super::{CONFLICT_MARKER, Folder, IGNORE_FILE, MAX_EVENT_FILENAMES, MIN_FREE_BYTES};

impl Folder {
    /// The single scan entry point: full rescan when `subs` is empty,
    /// otherwise a targeted rescan of the given subtrees. Errors other
    /// than cancellation are latched on the folder state.
    pub(crate) async fn scan_subdirs(
        &mut self,
        subs: Vec<String>,
    ) -> Result<()> {
        let ignores_before = self.matcher.hash();
        let result = self.scan_inner(subs).await;
        // Edits to the ignore file picked up during the scan change what
        // the folder needs; always follow up with a pull.
        if self.matcher.hash() != ignores_before {
            self.shared.schedule_pull();
        }
        match &result {
            Ok(()) => self.shared.state.set_state(FolderState::Idle),
            Err(SyncError::Cancelled) => {}
            Err(err) => self.shared.state.set_error(Some(err)),
        }
        result
    }

    /// Folder reachable, database disk not full, and (optionally) ignore
    /// patterns loaded.
    pub(crate) fn health_check(&self, load_ignores: bool) -> Result<()> {
        if !self.fs.is_dir("") {
            return Err(SyncError::PathMissing(
                self.cfg.path.display().to_string(),
            ));
        }
        if let Ok(usage) = self.fs.usage(&self.db_path) {
            let min = MIN_FREE_BYTES.max(usage.total / 100);
            if usage.free < min {
                return Err(SyncError::InsufficientSpace {
                    path: self.db_path.display().to_string(),
                    free: usage.free,
                });
            }
        }
        if load_ignores {
            self.matcher
                .load(&self.cfg.path.join(IGNORE_FILE))
                .map_err(|err| SyncError::IgnoreLoad(err.to_string()))?;
        }
        Ok(())
    }

    async fn scan_inner(&mut self, subs: Vec<String>) -> Result<()> {
        if let Err(err) = self.health_check(true) {
            self.shared.state.set_error(Some(&err));
            return Err(err);
        }
        self.shared.state.set_error(None);

        self.shared.state.set_state(FolderState::ScanWaiting);
        let _permit = match self.io_limiter.acquire(&self.cancel).await {
            Ok(permit) => permit,
            Err(err) => {
                self.shared.state.set_state(FolderState::Idle);
                return Err(err);
            }
        };
        self.shared.state.set_state(FolderState::Scanning);

        let snap = self.fset.snapshot()?;
        let subs = normalize_subtrees(subs, &|name| {
            snap.have(DeviceId::LOCAL, name)
        });
        self.shared.errors.clear_scan(&subs);
        debug!(
            target: "folder::scan",
            folder = %self.cfg.id,
            subs = ?subs,
            "scanning",
        );

        let walk_cancel = self.cancel.child_token();
        let request = WalkRequest {
            subs: subs.clone(),
            matcher: Arc::clone(&self.matcher),
            ignore_perms: self.cfg.ignore_perms,
            auto_normalize: self.cfg.auto_normalize,
        };
        let mut stream = match self.cfg.folder_type {
            FolderType::ReceiveEncrypted => {
                self.scanner
                    .walk_without_hashing(walk_cancel.clone(), request)
                    .await?
            }
            _ => self.scanner.walk(walk_cancel.clone(), request).await?,
        };

        let changes = AtomicI64::new(0);
        let mut batch = self.update_batch();
        let mut already_used: HashSet<String> = HashSet::new();

        while let Some(entry) = stream.recv().await {
            match entry {
                ScanEntry::Error { path, error } => {
                    self.shared.errors.append_scan(path, error);
                }
                ScanEntry::File(file) => {
                    if let Err(err) = self.process_scanned(
                        snap.as_ref(),
                        &mut batch,
                        &changes,
                        &mut already_used,
                        file,
                    ) {
                        // The walker must never block on its output, even
                        // when the scan unwinds mid-stream.
                        walk_cancel.cancel();
                        drain(&mut stream).await;
                        return Err(err);
                    }
                }
            }
        }
        if self.cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }

        // Commit the walk before snapshotting again, so the deletion pass
        // sees the entries the walk already corrected.
        batch.flush()?;
        drop(snap);
        let snap = self.fset.snapshot()?;
        let prefixes: Vec<String> = if subs.is_empty() {
            vec![String::new()]
        } else {
            subs.clone()
        };
        for prefix in &prefixes {
            self.check_have_prefix(snap.as_ref(), &mut batch, &changes, prefix)?;
        }
        drop(snap);

        batch.flush()?;
        self.scan_completed();
        if changes.load(Ordering::SeqCst) > 0 {
            self.shared.schedule_pull();
        }
        info!(
            target: "folder::scan",
            folder = %self.cfg.id,
            changes = changes.load(Ordering::SeqCst),
            "completed scan",
        );
        Ok(())
    }

    /// Batch whose flush commits to the file set, announces the update,
    /// and releases touched entries from the forced-rescan ledger.
    fn update_batch(&self) -> UpdateBatch<'static> {
        let fset = Arc::clone(&self.fset);
        let shared = Arc::clone(&self.shared);
        let logger = self.logger.clone();
        let folder = self.cfg.id.clone();
        let label = self.cfg.display_name().to_string();
        UpdateBatch::new(move |files: Vec<FileInfo>| {
            let items = files.len();
            let filenames: Vec<String> = files
                .iter()
                .take(MAX_EVENT_FILENAMES)
                .map(|f| f.name.clone())
                .collect();
            {
                let mut forced = shared.forced.lock().unwrap();
                if !forced.is_empty() {
                    for file in &files {
                        forced.remove(&file.name);
                    }
                }
            }
            fset.update(DeviceId::LOCAL, files)?;
            logger.log(Event::LocalIndexUpdated {
                folder: folder.clone(),
                label: label.clone(),
                items,
                filenames,
                sequence: fset.sequence(DeviceId::LOCAL),
            });
            Ok(())
        })
    }

    /// Apply the folder-type policy to one scanned entry and append it
    /// (plus any rename-detected deletion) to the batch.
    fn process_scanned(
        &self,
        snap: &dyn IndexSnapshot,
        batch: &mut UpdateBatch<'_>,
        changes: &AtomicI64,
        already_used: &mut HashSet<String>,
        mut file: FileInfo,
    ) -> Result<()> {
        file.local_flags |= self.cfg.local_flags;

        match self.cfg.folder_type {
            FolderType::ReceiveEncrypted => {
                if file.is_directory() && !file.is_deleted() {
                    // Parents of encrypted files are not tracked; an empty
                    // one is removed outright and never hits the index.
                    let empty = self
                        .fs
                        .dir_names(&file.name)
                        .map(|names| names.is_empty())
                        .unwrap_or(false);
                    if empty {
                        let _ = self.fs.remove_dir(&file.name);
                        changes.fetch_sub(1, Ordering::SeqCst);
                        return Ok(());
                    }
                }
                file.local_flags.insert(LocalFlags::RECEIVE_ONLY);
            }
            FolderType::ReceiveOnly => {
                file.local_flags.insert(LocalFlags::RECEIVE_ONLY);
                if let Some(global) = snap.get_global(&file.name) {
                    if global.is_equivalent_ignoring_receive_only(
                        &file,
                        self.cfg.mtime_window,
                        self.cfg.ignore_perms,
                    ) {
                        // The local change already matches the cluster;
                        // adopt the global version so nothing is held back.
                        file.version = global.version.clone();
                        file.local_flags.remove(LocalFlags::RECEIVE_ONLY);
                        self.log_remote_change(&global);
                    } else if file.is_deleted()
                        && (global.is_deleted()
                            || global.is_receive_only_changed())
                    {
                        file.local_flags.remove(LocalFlags::RECEIVE_ONLY);
                    }
                }
            }
            FolderType::SendOnly | FolderType::SendReceive => {
                if !file.is_deleted()
                    && !file.blocks.is_empty()
                    && file.size > 0
                {
                    self.detect_rename(
                        snap,
                        batch,
                        changes,
                        already_used,
                        &file,
                    );
                }
            }
        }

        self.log_local_change(&file);
        changes.fetch_add(1, Ordering::SeqCst);
        batch.append(file);
        batch.flush_if_full()
    }

    /// A scanned file whose content matches an index entry that is gone
    /// from disk is the new name of that entry: emit a deletion for the
    /// old name. Each old name is claimed at most once per scan.
    fn detect_rename(
        &self,
        snap: &dyn IndexSnapshot,
        batch: &mut UpdateBatch<'_>,
        changes: &AtomicI64,
        already_used: &mut HashSet<String>,
        scanned: &FileInfo,
    ) {
        if scanned.blocks_hash.is_empty() {
            return;
        }
        let mut found: Option<FileInfo> = None;
        snap.with_blocks_hash(&scanned.blocks_hash, &mut |candidate| {
            if candidate.name == scanned.name
                || candidate.is_deleted()
                || candidate.size != scanned.size
                || already_used.contains(&candidate.name)
                || candidate.name.contains(CONFLICT_MARKER)
                || self.matcher.is_ignored(&candidate.name)
                || self.fs.exists(&candidate.name)
            {
                return true;
            }
            found = Some(candidate.clone());
            false
        });

        let Some(previous) = found else {
            return;
        };
        already_used.insert(previous.name.clone());
        debug!(
            target: "folder::scan",
            folder = %self.cfg.id,
            from = %previous.name,
            to = %scanned.name,
            "rename detected",
        );
        let deleted = previous
            .into_deleted(self.cfg.short_id, self.cfg.local_flags);
        self.log_local_change(&deleted);
        changes.fetch_add(1, Ordering::SeqCst);
        batch.append(deleted);
    }

    /// Walk the index under `prefix` and emit corrections for entries the
    /// scan itself cannot produce: newly ignored files, files that
    /// disappeared while ignored or unwatched, and stale receive-only
    /// deletion marks.
    fn check_have_prefix(
        &self,
        snap: &dyn IndexSnapshot,
        batch: &mut UpdateBatch<'_>,
        changes: &AtomicI64,
        prefix: &str,
    ) -> Result<()> {
        let mut to_ignore: Vec<FileInfo> = Vec::new();
        let mut ignored_parent = String::new();
        let mut result: Result<()> = Ok(());

        snap.with_have_prefixed(DeviceId::LOCAL, prefix, &mut |fi| {
            if self.cancel.is_cancelled() {
                result = Err(SyncError::Cancelled);
                return false;
            }

            // Iteration left the deferred parent's subtree: nothing
            // reversed the decision, so convert the buffered entries.
            if !ignored_parent.is_empty()
                && !is_descendant(&fi.name, &ignored_parent)
            {
                for entry in to_ignore.drain(..) {
                    changes.fetch_add(1, Ordering::SeqCst);
                    batch.append(entry.into_ignored(self.cfg.short_id));
                }
                ignored_parent.clear();
                if let Err(err) = batch.flush_if_full() {
                    result = Err(err);
                    return false;
                }
            }

            let ignored_now = self.matcher.is_ignored(&fi.name);

            if ignored_now && !fi.is_ignored() {
                if fi.is_directory() {
                    // Defer: a child matching a negated pattern may still
                    // reverse the decision for the whole subtree.
                    if ignored_parent.is_empty() {
                        ignored_parent = fi.name.clone();
                    }
                    to_ignore.push(fi.clone());
                    return true;
                }
                changes.fetch_add(1, Ordering::SeqCst);
                batch
                    .append(fi.clone().into_ignored(self.cfg.short_id));
            } else if !ignored_now && (fi.is_ignored() || !fi.is_deleted()) {
                // Entries the walk could not have visited: probe the disk.
                if self.fs.exists(&fi.name) {
                    if !ignored_parent.is_empty() {
                        // A surviving, not-ignored child un-ignores the
                        // deferred parent.
                        to_ignore.clear();
                        ignored_parent.clear();
                    }
                    if fi.is_ignored() {
                        // The patterns released the entry; the must-rescan
                        // mark makes the next walk re-detect it.
                        changes.fetch_add(1, Ordering::SeqCst);
                        batch.append(
                            fi.clone().into_unignored(self.cfg.short_id),
                        );
                    }
                } else if !fi.is_deleted() {
                    let deleted = fi.clone().into_deleted(
                        self.cfg.short_id,
                        self.cfg.local_flags,
                    );
                    self.log_local_change(&deleted);
                    changes.fetch_add(1, Ordering::SeqCst);
                    batch.append(deleted);
                }
            }

            if fi.is_deleted() && fi.is_receive_only_changed() {
                match self.cfg.folder_type {
                    FolderType::ReceiveOnly
                    | FolderType::ReceiveEncrypted => {
                        let global_settled = snap
                            .get_global(&fi.name)
                            .map(|global| {
                                global.is_deleted()
                                    || global.is_receive_only_changed()
                            })
                            .unwrap_or(true);
                        if global_settled {
                            // The deletion no longer diverges from the
                            // cluster; let the entry converge.
                            let mut nf = fi.clone();
                            nf.local_flags
                                .remove(LocalFlags::RECEIVE_ONLY);
                            changes.fetch_add(1, Ordering::SeqCst);
                            batch.append(nf);
                        }
                    }
                    _ => {
                        // Leftover from a folder-type change.
                        let mut nf = fi.clone();
                        nf.local_flags.remove(LocalFlags::RECEIVE_ONLY);
                        changes.fetch_add(1, Ordering::SeqCst);
                        batch.append(nf);
                    }
                }
            }

            if let Err(err) = batch.flush_if_full() {
                result = Err(err);
                return false;
            }
            true
        });

        if result.is_ok() {
            for entry in to_ignore {
                changes.fetch_add(1, Ordering::SeqCst);
                batch.append(entry.into_ignored(self.cfg.short_id));
            }
        }
        result
    }

    fn scan_completed(&self) {
        self.logger.log(Event::FolderSummary {
            folder: self.cfg.id.clone(),
            sequence: self.fset.sequence(DeviceId::LOCAL),
            scanned_at: chrono::Utc::now(),
        });
    }

    fn log_local_change(&self, file: &FileInfo) {
        self.logger.log(Event::LocalChangeDetected {
            folder: self.cfg.id.clone(),
            label: self.cfg.display_name().to_string(),
            action: if file.is_deleted() {
                ChangeAction::Deleted
            } else {
                ChangeAction::Modified
            },
            entry_type: file.file_type,
            path: native_path(&file.name),
            modified_by: file.modified_by,
        });
    }

    fn log_remote_change(&self, file: &FileInfo) {
        self.logger.log(Event::RemoteChangeDetected {
            folder: self.cfg.id.clone(),
            label: self.cfg.display_name().to_string(),
            action: if file.is_deleted() {
                ChangeAction::Deleted
            } else {
                ChangeAction::Modified
            },
            entry_type: file.file_type,
            path: native_path(&file.name),
            modified_by: file.modified_by,
        });
    }
}

/// Folder-relative name rendered with the platform's separators, as event
/// payloads carry native paths.
fn native_path(name: &str) -> String {
    if MAIN_SEPARATOR == '/' {
        name.to_string()
    } else {
        name.replace('/', &MAIN_SEPARATOR.to_string())
    }
}

async fn drain(stream: &mut mpsc::Receiver<ScanEntry>) {
    while stream.recv().await.is_some() {}
}
