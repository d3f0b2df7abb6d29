//! Seams to the process whose directories are being snapshotted, and to
//! whatever reports progress to a user.

use crate::{BackupId, BackupRecord, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Mutex;
use tracing::{info, warn};

/// Control surface of the host process.
#[async_trait]
pub trait HostControl: Send + Sync {
    /// Flush pending writes so the source directories are consistent.
    /// Returns once the flush has completed.
    async fn quiesce(&self) -> Result<()>;

    /// Re-enable normal writing after a snapshot.
    async fn resume(&self) -> Result<()>;

    /// Stop the host before its directories are replaced.
    async fn stop(&self) -> Result<()>;

    /// Start the host again after a restore.
    async fn start(&self) -> Result<()>;

    /// Whether the host is up; scheduled backups are skipped otherwise.
    fn is_ready(&self) -> bool;
}

/// Host that needs no coordination.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHost;

#[async_trait]
impl HostControl for NoopHost {
    async fn quiesce(&self) -> Result<()> {
        Ok(())
    }

    async fn resume(&self) -> Result<()> {
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        Ok(())
    }

    fn is_ready(&self) -> bool {
        true
    }
}

/// Structured outcome or progress notification.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    BackupStarted,
    BackupCreated { backup: BackupRecord, elapsed_ms: u64 },
    BackupRemoved { id: BackupId },
    Pruned { ids: Vec<BackupId> },
    RestoreSelected { id: BackupId },
    RestoreCountdown { id: BackupId, remaining_secs: u64 },
    RestoreCancelled { id: BackupId },
    RestoreStarted { id: BackupId },
    RestoreCompleted { id: BackupId },
    RollbackStarted { id: BackupId },
    RollbackCompleted { id: BackupId },
    ExportCompleted { id: BackupId, path: String },
    StoreReset,
    ScheduledBackupTriggered { interval_secs: u64 },
    ScheduledBackupFailed { error: String },
    NextBackupAt { at: DateTime<Utc> },
}

/// Receiver of [`Event`]s.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: Event);
}

/// Sink that writes every event to the tracing log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl EventSink for LogSink {
    fn emit(&self, event: Event) {
        match &event {
            Event::ScheduledBackupFailed { error } => warn!(%error, "Scheduled backup failed"),
            Event::RollbackStarted { id } => warn!(backup_id = %id, "Rolling back restore"),
            other => info!(event = ?other, "strongbox event"),
        }
    }
}

/// Sink that keeps every event in memory.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<Event>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: Event) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}
