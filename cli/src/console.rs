use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;
use strongbox_core::{format_size, Error, Event, EventSink};

/// Prints engine events for a person at a terminal.
pub struct ConsoleSink {
    quiet: bool,
}

impl ConsoleSink {
    pub fn new(quiet: bool) -> Self {
        Self { quiet }
    }
}

impl EventSink for ConsoleSink {
    fn emit(&self, event: Event) {
        if self.quiet {
            if let Event::ScheduledBackupFailed { error } = &event {
                eprintln!("Scheduled backup failed: {}", error);
            }
            return;
        }
        match event {
            Event::BackupStarted => {}
            Event::BackupCreated { backup, elapsed_ms } => println!(
                "✅ Backup {} created ({}, {:.1}s)",
                backup.id,
                format_size(backup.size),
                elapsed_ms as f64 / 1000.0
            ),
            Event::BackupRemoved { id } => println!("🗑️  Removed backup {}", id),
            Event::Pruned { ids } => println!("Retention removed: {}", ids.join(", ")),
            Event::RestoreSelected { id } => println!("Selected backup {} for restore", id),
            Event::RestoreCountdown { id, remaining_secs } => {
                println!("Restoring {} in {}s (Ctrl-C to cancel)", id, remaining_secs)
            }
            Event::RestoreCancelled { id } => println!("Restore of {} cancelled", id),
            Event::RestoreStarted { id } => println!("📂 Restoring backup {}", id),
            Event::RestoreCompleted { id } => println!("✅ Restored backup {}", id),
            Event::RollbackStarted { id } => {
                eprintln!("⚠️  Restore of {} failed, rolling back", id)
            }
            Event::RollbackCompleted { id } => {
                eprintln!("Rolled back; live directories are as they were before restoring {}", id)
            }
            Event::ExportCompleted { id, path } => println!("📦 Exported {} to {}", id, path),
            Event::StoreReset => println!("Store reset"),
            Event::ScheduledBackupTriggered { .. } => println!("Starting scheduled backup"),
            Event::ScheduledBackupFailed { error } => eprintln!("Scheduled backup failed: {}", error),
            Event::NextBackupAt { at } => println!(
                "Next backup at {}",
                at.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M:%S")
            ),
        }
    }
}

pub fn spinner(message: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.green} [{elapsed_precise}] {msg}") {
        pb.set_style(style);
    }
    pb.set_message(message.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

/// Adds recovery instructions for errors that leave data in the holding area.
pub fn report_failure(error: &anyhow::Error) {
    if let Some(Error::RollbackFailed { holding_area, .. }) = error.downcast_ref::<Error>() {
        eprintln!("❌ Restore and rollback both failed.");
        eprintln!(
            "   Your previous directories are preserved in {}",
            holding_area.display()
        );
        eprintln!("   Move them back manually before starting the server again.");
    }
}
