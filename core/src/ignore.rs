use serde::{Deserialize, Serialize};
use std::path::Path;

/// Names excluded from snapshots and from rollback copies.
///
/// `files` and `folders` match a single path component exactly; `extensions`
/// match the file suffix including the leading dot (`.lock`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IgnoreRules {
    pub files: Vec<String>,
    pub folders: Vec<String>,
    pub extensions: Vec<String>,
}

impl Default for IgnoreRules {
    fn default() -> Self {
        Self {
            files: vec!["session.lock".to_string()],
            folders: Vec::new(),
            extensions: vec![".lock".to_string()],
        }
    }
}

impl IgnoreRules {
    pub fn none() -> Self {
        Self {
            files: Vec::new(),
            folders: Vec::new(),
            extensions: Vec::new(),
        }
    }

    pub fn is_ignored_name(&self, name: &str, is_dir: bool) -> bool {
        if self.files.iter().any(|f| f == name) || self.folders.iter().any(|f| f == name) {
            return true;
        }
        if is_dir {
            return false;
        }
        match Path::new(name).extension().and_then(|e| e.to_str()) {
            Some(ext) => self
                .extensions
                .iter()
                .any(|ignored| ignored.trim_start_matches('.') == ext),
            None => false,
        }
    }

    pub fn is_ignored(&self, entry: &walkdir::DirEntry) -> bool {
        let name = entry.file_name().to_string_lossy();
        self.is_ignored_name(&name, entry.file_type().is_dir())
    }
}
