use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Metadata index error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Backup not found: {id}")]
    NotFound { id: String },

    #[error("Another operation is in progress: {operation}")]
    LockBusy { operation: String },

    #[error("Codec unavailable: {0}")]
    CodecUnavailable(String),

    #[error("Blob missing or corrupted: {digest}")]
    Integrity { digest: String },

    #[error("Compression level {level} out of range for {format} (max {max})")]
    InvalidLevel { format: String, level: u32, max: u32 },

    #[error("Holding area already exists at {path}; recover or remove it before restoring")]
    HoldingAreaOccupied { path: PathBuf },

    /// Rollback after a failed restore did not complete. Live data may be
    /// partially restored; the held-aside originals remain at `holding_area`.
    #[error(
        "Restore failed ({cause}) and rollback failed ({rollback}); manual recovery required from {}",
        holding_area.display()
    )]
    RollbackFailed {
        holding_area: PathBuf,
        cause: Box<Error>,
        rollback: Box<Error>,
    },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// True when live data may be inconsistent and needs an operator.
    pub fn requires_manual_recovery(&self) -> bool {
        matches!(self, Error::RollbackFailed { .. })
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Error::Other(format!("Background task failed: {}", err))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
