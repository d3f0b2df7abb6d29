//! Periodic backups.
//!
//! The [`BackupClock`] records when the last backup attempt finished. It is
//! shared with the orchestrator so manual backups push the next scheduled run
//! out by a full interval too.

use crate::host::{Event, EventSink, HostControl};
use crate::orchestrator::Orchestrator;
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug)]
struct ClockState {
    instant: Instant,
    wall: DateTime<Utc>,
}

#[derive(Debug)]
pub struct BackupClock {
    state: Mutex<ClockState>,
}

impl Default for BackupClock {
    fn default() -> Self {
        Self::new()
    }
}

impl BackupClock {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ClockState {
                instant: Instant::now(),
                wall: Utc::now(),
            }),
        }
    }

    pub fn reset(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.instant = Instant::now();
            state.wall = Utc::now();
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.state
            .lock()
            .map(|state| state.instant.elapsed())
            .unwrap_or_default()
    }

    pub fn last_backup_at(&self) -> DateTime<Utc> {
        self.state
            .lock()
            .map(|state| state.wall)
            .unwrap_or_else(|_| Utc::now())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerStatus {
    pub enabled: bool,
    pub interval: Duration,
    pub next_backup_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy)]
struct Settings {
    enabled: bool,
    interval: Duration,
}

/// Triggers `create` whenever a full interval has passed since the last
/// backup and the host is ready.
pub struct Scheduler {
    orchestrator: Arc<Orchestrator>,
    settings: Mutex<Settings>,
    message: String,
}

impl Scheduler {
    pub fn new(orchestrator: Arc<Orchestrator>, enabled: bool, interval: Duration) -> Self {
        Self {
            orchestrator,
            settings: Mutex::new(Settings { enabled, interval }),
            message: "Scheduled backup".to_string(),
        }
    }

    fn settings(&self) -> Settings {
        self.settings
            .lock()
            .map(|s| *s)
            .unwrap_or(Settings {
                enabled: false,
                interval: Duration::MAX,
            })
    }

    fn clock(&self) -> &BackupClock {
        self.orchestrator.clock()
    }

    fn events(&self) -> &dyn EventSink {
        self.orchestrator.events()
    }

    pub fn set_enabled(&self, enabled: bool) {
        if let Ok(mut settings) = self.settings.lock() {
            settings.enabled = enabled;
        }
        self.clock().reset();
        info!(enabled, "Scheduler toggled");
        if enabled {
            self.announce_next();
        }
    }

    pub fn set_interval(&self, interval: Duration) {
        if let Ok(mut settings) = self.settings.lock() {
            settings.interval = interval;
        }
        self.clock().reset();
        info!(interval_secs = interval.as_secs_f64(), "Scheduler interval changed");
        self.announce_next();
    }

    pub fn reset(&self) {
        self.clock().reset();
        self.announce_next();
    }

    pub fn next_backup_at(&self) -> DateTime<Utc> {
        let interval = self.settings().interval;
        let delta = chrono::Duration::from_std(interval).unwrap_or(chrono::Duration::MAX);
        self.clock()
            .last_backup_at()
            .checked_add_signed(delta)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    pub fn status(&self) -> SchedulerStatus {
        let settings = self.settings();
        SchedulerStatus {
            enabled: settings.enabled,
            interval: settings.interval,
            next_backup_at: settings.enabled.then(|| self.next_backup_at()),
        }
    }

    fn announce_next(&self) {
        self.events().emit(Event::NextBackupAt {
            at: self.next_backup_at(),
        });
    }

    fn is_due(&self, host: &dyn HostControl) -> bool {
        let settings = self.settings();
        settings.enabled && self.clock().elapsed() > settings.interval && host.is_ready()
    }

    /// Runs one scheduled backup attempt. The clock is reset afterwards
    /// whatever the outcome so failures do not retry in a tight loop.
    pub async fn trigger(&self) {
        let settings = self.settings();
        self.events().emit(Event::ScheduledBackupTriggered {
            interval_secs: settings.interval.as_secs(),
        });
        let result = self.orchestrator.create(Some(self.message.clone())).await;
        self.clock().reset();
        match result {
            Ok(outcome) => {
                debug!(backup_id = %outcome.backup.id, "Scheduled backup finished");
            }
            Err(e) => {
                warn!(error = %e, "Scheduled backup failed");
                self.events().emit(Event::ScheduledBackupFailed {
                    error: e.to_string(),
                });
            }
        }
        self.announce_next();
    }

    /// Polls until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        info!("Scheduler started");
        let host = self.orchestrator.host();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
            }
            if self.is_due(host.as_ref()) {
                self.trigger().await;
            }
        }
        info!("Scheduler stopped");
    }
}
