//! Coordinates the content store and the metadata index into backup
//! operations.
//!
//! Every mutating operation holds the [`OperationGate`] for its whole
//! duration, so at most one create/restore/remove/export/reset runs at a
//! time. Read-only queries never take the gate.
//!
//! # Examples
//!
//! ```no_run
//! use std::sync::Arc;
//! use strongbox_core::{Config, LogSink, NoopHost, Orchestrator};
//!
//! #[tokio::main]
//! async fn main() -> strongbox_core::Result<()> {
//!     let engine = Orchestrator::open(Config::default(), Arc::new(NoopHost), Arc::new(LogSink))?;
//!     let outcome = engine.create(Some("before upgrade".to_string())).await?;
//!
//!     let session = engine.select_restore(Some(&outcome.backup.id))?;
//!     engine.confirm_restore(&session).await?;
//!     Ok(())
//! }
//! ```

use crate::export::{self, ExportFormat};
use crate::fsops;
use crate::host::{Event, EventSink, HostControl};
use crate::ignore::IgnoreRules;
use crate::index::MetadataIndex;
use crate::lock::{Operation, OperationGate};
use crate::retention::RetentionPolicy;
use crate::scheduler::BackupClock;
use crate::store::{ContentStore, StoreUsage};
use crate::{new_backup_id, BackupId, BackupRecord, Config, Digest, Error, FileRecord, Result};
use chrono::{DateTime, Utc};
use std::cell::Cell;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

/// Attempts at drawing an unused short id before giving up.
const ID_ATTEMPTS: usize = 16;

#[derive(Debug, Clone)]
pub struct CreateOutcome {
    pub backup: BackupRecord,
    pub files: usize,
    /// Blobs written by this backup; the rest were deduplicated.
    pub new_blobs: usize,
    /// Symlinks, special files and non UTF-8 names left out of the backup.
    pub skipped: usize,
    /// Backups removed by retention afterwards, including those removed
    /// before a failed retention pass stopped.
    pub pruned: Vec<BackupId>,
}

/// A backup selected for restore, waiting for confirmation.
///
/// The session is handed back to [`Orchestrator::confirm_restore`]; cancelling
/// it aborts the countdown.
#[derive(Debug, Clone)]
pub struct RestoreSession {
    backup_id: BackupId,
    requested_at: DateTime<Utc>,
    cancel: CancellationToken,
}

impl RestoreSession {
    fn new(backup_id: BackupId) -> Self {
        Self {
            backup_id,
            requested_at: Utc::now(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn backup_id(&self) -> &str {
        &self.backup_id
    }

    pub fn requested_at(&self) -> DateTime<Utc> {
        self.requested_at
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Token for wiring cancellation to signals or other tasks.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

struct StagedBackup {
    dirs: Vec<String>,
    files: Vec<FileRecord>,
    total_size: u64,
    new_blobs: usize,
    skipped: usize,
}

pub struct Orchestrator {
    config: Config,
    store: ContentStore,
    index: Arc<MetadataIndex>,
    gate: OperationGate,
    clock: BackupClock,
    host: Arc<dyn HostControl>,
    events: Arc<dyn EventSink>,
}

impl Orchestrator {
    /// Opens the data root, creating the store layout and index if needed.
    pub fn open(
        config: Config,
        host: Arc<dyn HostControl>,
        events: Arc<dyn EventSink>,
    ) -> Result<Self> {
        std::fs::create_dir_all(&config.data_root)?;
        let store = ContentStore::new(&config.data_root, config.compression_level)?;
        store.init()?;
        let index = MetadataIndex::open(&config.data_root)?;
        info!(root = %config.data_root.display(), "Opened backup store");
        Ok(Self {
            config,
            store,
            index: Arc::new(index),
            gate: OperationGate::new(),
            clock: BackupClock::new(),
            host,
            events,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &ContentStore {
        &self.store
    }

    pub fn index(&self) -> &MetadataIndex {
        &self.index
    }

    pub fn gate(&self) -> &OperationGate {
        &self.gate
    }

    pub fn clock(&self) -> &BackupClock {
        &self.clock
    }

    pub fn host(&self) -> Arc<dyn HostControl> {
        Arc::clone(&self.host)
    }

    pub fn events(&self) -> &dyn EventSink {
        self.events.as_ref()
    }

    /// Looks up a backup by id, or the newest backup when `id` is `None`.
    pub fn resolve(&self, id: Option<&str>) -> Result<BackupRecord> {
        let found = match id {
            Some(id) => self.index.get_backup(id)?,
            None => self.index.latest_backup()?,
        };
        found.ok_or_else(|| Error::NotFound {
            id: id.unwrap_or("latest").to_string(),
        })
    }

    /// Backups newest first.
    pub fn list_backups(&self) -> Result<Vec<BackupRecord>> {
        let mut backups = self.index.list_backups(Default::default())?;
        backups.reverse();
        Ok(backups)
    }

    pub fn store_usage(&self) -> Result<StoreUsage> {
        self.store.usage()
    }

    pub fn set_locked(&self, id: Option<&str>, locked: bool) -> Result<BackupRecord> {
        let backup = self.resolve(id)?;
        let updated = self.index.set_locked(&backup.id, locked)?;
        info!(backup_id = %updated.id, locked, "Updated backup lock");
        Ok(updated)
    }

    fn unique_backup_id(&self) -> Result<BackupId> {
        for _ in 0..ID_ATTEMPTS {
            let id = new_backup_id();
            if !self.index.contains(&id)? {
                return Ok(id);
            }
            debug!(backup_id = %id, "Short id collision, drawing another");
        }
        Err(Error::Other(
            "Could not allocate an unused backup id".to_string(),
        ))
    }

    /// Snapshots the configured source directories.
    pub async fn create(&self, message: Option<String>) -> Result<CreateOutcome> {
        let _guard = self.gate.try_acquire(Operation::Create)?;
        let started = Instant::now();
        self.events.emit(Event::BackupStarted);

        let result = match self.host.quiesce().await {
            Ok(()) => self.create_locked(message).await,
            Err(e) => Err(e),
        };
        if let Err(e) = self.host.resume().await {
            warn!(error = %e, "Host did not resume after backup");
        }
        let (backup, staged_files, new_blobs, skipped) = result?;

        self.clock.reset();
        info!(
            backup_id = %backup.id,
            files = staged_files,
            new_blobs,
            size = backup.size,
            "Backup created"
        );
        self.events.emit(Event::BackupCreated {
            backup: backup.clone(),
            elapsed_ms: started.elapsed().as_millis() as u64,
        });

        let pruned = if self.config.retention.enabled {
            let (pruned, result) = self.auto_prune(self.config.retention.limit).await;
            if let Err(e) = result {
                warn!(error = %e, removed = pruned.len(), "Retention pass failed");
            }
            pruned
        } else {
            Vec::new()
        };

        Ok(CreateOutcome {
            backup,
            files: staged_files,
            new_blobs,
            skipped,
            pruned,
        })
    }

    async fn create_locked(
        &self,
        message: Option<String>,
    ) -> Result<(BackupRecord, usize, usize, usize)> {
        let backup_id = self.unique_backup_id()?;
        let store = self.store.clone();
        let server_path = self.config.server_path.clone();
        let source_dirs = self.config.source_dirs.clone();
        let rules = self.config.ignore.clone();
        let id = backup_id.clone();

        let staged = tokio::task::spawn_blocking(move || {
            stage_sources(&store, &server_path, &source_dirs, &rules, &id)
        })
        .await??;

        let record = BackupRecord::new(backup_id, staged.total_size, message);
        self.index
            .commit_snapshot(&record, &staged.dirs, &staged.files)?;
        Ok((record, staged.files.len(), staged.new_blobs, staged.skipped))
    }

    /// Removes a backup and every blob no other backup references.
    pub async fn remove(&self, id: Option<&str>) -> Result<BackupRecord> {
        let _guard = self.gate.try_acquire(Operation::Remove)?;
        let backup = self.resolve(id)?;
        self.remove_locked(&backup.id).await?;
        Ok(backup)
    }

    async fn remove_locked(&self, id: &str) -> Result<()> {
        let files = self.index.delete_backup(id)?;
        let digests: HashSet<Digest> = files.into_iter().map(|f| f.digest).collect();

        let mut reclaimed = 0usize;
        for digest in digests {
            match self.index.is_referenced(&digest) {
                Ok(true) => {}
                Ok(false) => match self.store.delete(&digest) {
                    Ok(()) => reclaimed += 1,
                    Err(e) => warn!(
                        digest = %digest.short_string(),
                        error = %e,
                        "Failed to delete orphaned blob"
                    ),
                },
                Err(e) => warn!(
                    digest = %digest.short_string(),
                    error = %e,
                    "Could not check blob references; leaving blob in place"
                ),
            }
        }

        info!(backup_id = %id, reclaimed, "Backup removed");
        self.events.emit(Event::BackupRemoved { id: id.to_string() });
        Ok(())
    }

    /// Applies the retention limit now. Takes the gate like `remove`.
    pub async fn prune(&self, limit: usize) -> Result<Vec<BackupId>> {
        let _guard = self.gate.try_acquire(Operation::Remove)?;
        let (removed, result) = self.auto_prune(limit).await;
        result.map(|()| removed)
    }

    /// Removes the oldest unlocked backups until at most `limit` remain.
    /// Callers must hold the gate. The ids removed are returned even when a
    /// later removal fails.
    async fn auto_prune(&self, limit: usize) -> (Vec<BackupId>, Result<()>) {
        let mut removed = Vec::new();
        let result = self.prune_into(limit, &mut removed).await;
        if !removed.is_empty() {
            info!(removed = ?removed, limit, "Pruned old backups");
            self.events.emit(Event::Pruned {
                ids: removed.clone(),
            });
        }
        (removed, result)
    }

    async fn prune_into(&self, limit: usize, removed: &mut Vec<BackupId>) -> Result<()> {
        let policy = RetentionPolicy::new(limit);
        for id in policy.plan(&self.index)? {
            if self.index.count_backups()? <= limit {
                break;
            }
            self.remove_locked(&id).await?;
            removed.push(id);
        }
        Ok(())
    }

    /// Selects a backup for restore. Read-only; takes no lock.
    pub fn select_restore(&self, id: Option<&str>) -> Result<RestoreSession> {
        let backup = self.resolve(id)?;
        self.events.emit(Event::RestoreSelected {
            id: backup.id.clone(),
        });
        Ok(RestoreSession::new(backup.id))
    }

    /// Runs the countdown for a selected restore and then performs it.
    pub async fn confirm_restore(&self, session: &RestoreSession) -> Result<BackupRecord> {
        if session.is_cancelled() {
            return Err(Error::Cancelled);
        }
        self.resolve(Some(session.backup_id()))?;
        self.countdown(session).await?;

        let _guard = self.gate.try_acquire(Operation::Restore)?;
        let backup = self.resolve(Some(session.backup_id()))?;
        self.restore_locked(&backup).await?;
        Ok(backup)
    }

    /// Restores immediately, without a selection or countdown.
    pub async fn restore(&self, id: Option<&str>) -> Result<BackupRecord> {
        let _guard = self.gate.try_acquire(Operation::Restore)?;
        let backup = self.resolve(id)?;
        self.restore_locked(&backup).await?;
        Ok(backup)
    }

    async fn countdown(&self, session: &RestoreSession) -> Result<()> {
        let total = self.config.restore_countdown().as_secs();
        for remaining in (1..=total).rev() {
            self.events.emit(Event::RestoreCountdown {
                id: session.backup_id.clone(),
                remaining_secs: remaining,
            });
            tokio::select! {
                _ = session.cancel.cancelled() => {
                    info!(backup_id = %session.backup_id, "Restore cancelled");
                    self.events.emit(Event::RestoreCancelled { id: session.backup_id.clone() });
                    return Err(Error::Cancelled);
                }
                _ = tokio::time::sleep(Duration::from_secs(1)) => {}
            }
        }
        if session.is_cancelled() {
            self.events.emit(Event::RestoreCancelled {
                id: session.backup_id.clone(),
            });
            return Err(Error::Cancelled);
        }
        Ok(())
    }

    async fn restore_locked(&self, backup: &BackupRecord) -> Result<()> {
        let holding = self.config.holding_area();
        if holding.exists() {
            return Err(Error::HoldingAreaOccupied { path: holding });
        }
        let files = self.index.list_files(&backup.id)?;
        let dirs = self.index.list_directories(&backup.id)?;

        info!(backup_id = %backup.id, files = files.len(), "Restoring backup");
        self.events.emit(Event::RestoreStarted {
            id: backup.id.clone(),
        });
        self.host.stop().await?;

        let server_path = self.config.server_path.clone();
        let source_dirs = self.config.source_dirs.clone();
        let moved = {
            let (server_path, source_dirs, holding) =
                (server_path.clone(), source_dirs.clone(), holding.clone());
            tokio::task::spawn_blocking(move || {
                fsops::relocate_to_holding(&server_path, &source_dirs, &holding)
            })
            .await
            .map_err(Error::from)
            .and_then(|r| r)
        };
        let moved = match moved {
            Ok(moved) => moved,
            Err(e @ Error::RollbackFailed { .. }) => return Err(e),
            Err(e) => {
                error!(error = %e, "Could not move live directories aside; nothing was changed");
                self.start_host_after_failure().await;
                return Err(e);
            }
        };

        let written = {
            let (store, server_path) = (self.store.clone(), server_path.clone());
            tokio::task::spawn_blocking(move || {
                fsops::materialize(&store, &dirs, &files, &server_path)
            })
                .await
                .map_err(Error::from)
                .and_then(|r| r)
        };

        match written {
            Ok(bytes) => {
                let discard = holding.clone();
                tokio::task::spawn_blocking(move || fsops::discard_holding(&discard)).await?;
                self.host.start().await?;
                info!(backup_id = %backup.id, bytes, "Restore completed");
                self.events.emit(Event::RestoreCompleted {
                    id: backup.id.clone(),
                });
                Ok(())
            }
            Err(cause) => {
                error!(backup_id = %backup.id, error = %cause, "Restore failed, rolling back");
                self.events.emit(Event::RollbackStarted {
                    id: backup.id.clone(),
                });
                let rules = self.config.ignore.clone();
                let rolled_back = {
                    let holding = holding.clone();
                    tokio::task::spawn_blocking(move || {
                        fsops::rollback_from_holding(
                            &server_path,
                            &source_dirs,
                            &moved,
                            &holding,
                            &rules,
                        )?;
                        fsops::discard_holding(&holding);
                        Ok::<(), Error>(())
                    })
                    .await
                    .map_err(Error::from)
                    .and_then(|r| r)
                };
                match rolled_back {
                    Ok(()) => {
                        info!(backup_id = %backup.id, "Rollback completed");
                        self.events.emit(Event::RollbackCompleted {
                            id: backup.id.clone(),
                        });
                        self.start_host_after_failure().await;
                        Err(cause)
                    }
                    Err(rollback) => {
                        error!(
                            backup_id = %backup.id,
                            error = %rollback,
                            holding_area = %holding.display(),
                            "Rollback failed; manual recovery required"
                        );
                        Err(Error::RollbackFailed {
                            holding_area: holding,
                            cause: Box::new(cause),
                            rollback: Box::new(rollback),
                        })
                    }
                }
            }
        }
    }

    async fn start_host_after_failure(&self) {
        if let Err(e) = self.host.start().await {
            warn!(error = %e, "Host did not start after failed restore");
        }
    }

    /// Writes a backup out as a directory or archive under the export dir.
    pub async fn export(
        &self,
        id: Option<&str>,
        format: Option<ExportFormat>,
        level: Option<u32>,
    ) -> Result<PathBuf> {
        let level = match format {
            Some(_) => level,
            None => level.or(self.config.export.level),
        };
        let format = format.unwrap_or(self.config.export.format);
        let level = format.resolve_level(level)?;

        let _guard = self.gate.try_acquire(Operation::Export)?;
        let backup = self.resolve(id)?;
        let files = self.index.list_files(&backup.id)?;
        let dirs = self.index.list_directories(&backup.id)?;
        let store = self.store.clone();
        let export_dir = self.config.export_dir();
        let backup_id = backup.id.clone();

        let artifact = tokio::task::spawn_blocking(move || {
            export_backup(&store, &dirs, &files, &export_dir, &backup_id, format, level)
        })
        .await??;

        info!(backup_id = %backup.id, %format, path = %artifact.display(), "Export completed");
        self.events.emit(Event::ExportCompleted {
            id: backup.id,
            path: artifact.display().to_string(),
        });
        Ok(artifact)
    }

    /// Drops every backup and blob. A leftover holding area is kept.
    pub async fn reset(&self) -> Result<()> {
        let _guard = self.gate.try_acquire(Operation::Reset)?;
        self.index.clear()?;
        let store = self.store.clone();
        let export_dir = self.config.export_dir();
        tokio::task::spawn_blocking(move || {
            store.clear()?;
            fsops::remove_dir_if_exists(&export_dir)?;
            Ok::<(), Error>(())
        })
        .await??;
        self.clock.reset();
        warn!("Backup store reset");
        self.events.emit(Event::StoreReset);
        Ok(())
    }
}

fn relative_dir(path: &Path, root: &Path) -> Result<String> {
    let relative = path
        .strip_prefix(root)
        .map_err(|e| Error::Other(format!("{}: {}", path.display(), e)))?;
    let parts = relative
        .components()
        .map(|c| {
            c.as_os_str()
                .to_str()
                .ok_or_else(|| Error::Other(format!("non UTF-8 path: {}", path.display())))
        })
        .collect::<Result<Vec<&str>>>()?;
    Ok(parts.join("/"))
}

/// Walks the source directories and stores every file. Symlinks to files are
/// stored with their target's content; other symlinks and entries whose name
/// is not valid UTF-8 are skipped with a warning. Any other error aborts the
/// walk; blobs written up to that point are left for a later sweep.
fn stage_sources(
    store: &ContentStore,
    server_path: &Path,
    source_dirs: &[String],
    rules: &IgnoreRules,
    backup_id: &str,
) -> Result<StagedBackup> {
    let mut staged = StagedBackup {
        dirs: Vec::new(),
        files: Vec::new(),
        total_size: 0,
        new_blobs: 0,
        skipped: 0,
    };
    let unnamed = Cell::new(0usize);

    for name in source_dirs {
        let base = server_path.join(name);
        if !base.is_dir() {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("source directory missing: {}", base.display()),
            )));
        }
        let walker = WalkDir::new(&base)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| {
                if entry.depth() == 0 {
                    return true;
                }
                if entry.file_name().to_str().is_none() {
                    warn!(path = %entry.path().display(), "Skipping entry with non UTF-8 name");
                    unnamed.set(unnamed.get() + 1);
                    return false;
                }
                !rules.is_ignored(entry)
            });

        for entry in walker {
            let entry = entry.map_err(|e| Error::Io(e.into()))?;
            let file_type = entry.file_type();
            if file_type.is_dir() {
                staged.dirs.push(relative_dir(entry.path(), server_path)?);
                continue;
            }
            if file_type.is_symlink() {
                match std::fs::metadata(entry.path()) {
                    Ok(target) if target.is_file() => {}
                    _ => {
                        warn!(path = %entry.path().display(), "Skipping symlink that does not point at a file");
                        staged.skipped += 1;
                        continue;
                    }
                }
            } else if !file_type.is_file() {
                warn!(path = %entry.path().display(), "Skipping special file");
                staged.skipped += 1;
                continue;
            }

            let blob = store.put_file(entry.path())?;
            let parent = entry.path().parent().unwrap_or(server_path);
            staged.total_size += blob.content_len;
            if !blob.deduplicated {
                staged.new_blobs += 1;
            }
            staged.files.push(FileRecord {
                backup_id: backup_id.to_string(),
                path: relative_dir(parent, server_path)?,
                name: entry
                    .file_name()
                    .to_str()
                    .map(str::to_string)
                    .ok_or_else(|| Error::Other(format!("non UTF-8 name: {}", entry.path().display())))?,
                digest: blob.digest,
            });
        }
    }
    staged.skipped += unnamed.get();
    debug!(
        backup_id,
        dirs = staged.dirs.len(),
        files = staged.files.len(),
        new_blobs = staged.new_blobs,
        skipped = staged.skipped,
        "Staged source directories"
    );
    Ok(staged)
}

fn export_backup(
    store: &ContentStore,
    dirs: &[String],
    files: &[FileRecord],
    export_dir: &Path,
    backup_id: &str,
    format: ExportFormat,
    level: u32,
) -> Result<PathBuf> {
    std::fs::create_dir_all(export_dir)?;
    let artifact = format.artifact_path(export_dir, backup_id);
    let scratch = tempfile::Builder::new()
        .prefix(".scratch-")
        .tempdir_in(export_dir)?;
    fsops::materialize(store, dirs, files, scratch.path())?;

    if format.is_archive() {
        if let Err(e) = export::write_archive(scratch.path(), backup_id, &artifact, format, level) {
            let _ = std::fs::remove_file(&artifact);
            return Err(e);
        }
    } else {
        fsops::remove_dir_if_exists(&artifact)?;
        let kept = scratch.keep();
        if let Err(e) = std::fs::rename(&kept, &artifact) {
            let _ = fsops::remove_dir_if_exists(&kept);
            return Err(e.into());
        }
    }
    Ok(artifact)
}
