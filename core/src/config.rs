use crate::export::ExportFormat;
use crate::ignore::IgnoreRules;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Engine configuration. Loading and saving the file is left to the caller;
/// every field has a default so partial files deserialize.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root of the blob cache, metadata index, holding area and exports.
    pub data_root: PathBuf,
    /// Directory the source directories live in.
    pub server_path: PathBuf,
    /// Directories under `server_path` that make up a snapshot.
    pub source_dirs: Vec<String>,
    pub ignore: IgnoreRules,
    /// zstd level for new blobs; 0 stores them raw.
    pub compression_level: i32,
    pub retention: RetentionConfig,
    pub scheduler: SchedulerConfig,
    pub restore_countdown_secs: u64,
    /// Holding area name under `data_root`.
    pub holding_dir: String,
    pub export: ExportConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    pub enabled: bool,
    pub limit: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub interval_minutes: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    /// Export directory name under `data_root`.
    pub dir: String,
    pub format: ExportFormat,
    pub level: Option<u32>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from("./strongbox"),
            server_path: PathBuf::from("./server"),
            source_dirs: vec!["world".to_string()],
            ignore: IgnoreRules::default(),
            compression_level: 0,
            retention: RetentionConfig::default(),
            scheduler: SchedulerConfig::default(),
            restore_countdown_secs: 10,
            holding_dir: "overwrite".to_string(),
            export: ExportConfig::default(),
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            limit: 10,
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_minutes: 30.0,
        }
    }
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            dir: "export".to_string(),
            format: ExportFormat::TarGzip,
            level: None,
        }
    }
}

impl SchedulerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs_f64((self.interval_minutes * 60.0).max(0.0))
    }
}

impl Config {
    pub fn holding_area(&self) -> PathBuf {
        self.data_root.join(&self.holding_dir)
    }

    pub fn export_dir(&self) -> PathBuf {
        self.data_root.join(&self.export.dir)
    }

    pub fn restore_countdown(&self) -> Duration {
        Duration::from_secs(self.restore_countdown_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: Config = serde_json::from_str(
            r#"{ "source_dirs": ["world", "world_nether"], "retention": { "limit": 3 } }"#,
        )
        .unwrap();
        assert_eq!(config.source_dirs, vec!["world", "world_nether"]);
        assert_eq!(config.retention.limit, 3);
        assert!(config.retention.enabled);
        assert_eq!(config.holding_area(), PathBuf::from("./strongbox/overwrite"));
        assert_eq!(config.export.format, ExportFormat::TarGzip);
    }

    #[test]
    fn test_interval_conversion() {
        let scheduler = SchedulerConfig {
            enabled: true,
            interval_minutes: 0.5,
        };
        assert_eq!(scheduler.interval(), Duration::from_secs(30));
    }
}
