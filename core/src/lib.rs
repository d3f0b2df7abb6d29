pub mod codec;
pub mod config;
pub mod error;
pub mod export;
pub mod fsops;
pub mod host;
pub mod ignore;
pub mod index;
pub mod lock;
pub mod maintenance;
pub mod orchestrator;
pub mod retention;
pub mod scheduler;
pub mod store;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
pub use export::ExportFormat;
pub use host::{Event, EventSink, HostControl, LogSink, NoopHost, RecordingSink};
pub use index::MetadataIndex;
pub use orchestrator::{CreateOutcome, Orchestrator, RestoreSession};
pub use scheduler::{BackupClock, Scheduler};
pub use store::ContentStore;
pub use types::*;
