//! Offline jobs over an existing store: digest migration and import of the
//! old JSON metadata layout. Neither takes the operation gate; run them while
//! no engine is open on the same data root.

use crate::codec;
use crate::index::MetadataIndex;
use crate::store::ContentStore;
use crate::{BackupId, BackupRecord, Digest, DigestAlgorithm, Error, FileRecord, Result};
use chrono::{DateTime, Local, NaiveDateTime, Utc};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::{debug, info, warn};

const LEGACY_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MigrationReport {
    pub migrated: usize,
    pub records_rewritten: usize,
    /// Legacy digests with no blob on disk. Their records are left untouched.
    pub missing: Vec<Digest>,
    /// Blobs whose bytes no longer match their legacy digest.
    pub corrupt: Vec<Digest>,
}

/// Re-hashes every MD5-addressed blob into a BLAKE3 blob and repoints the
/// file records at it. The legacy blob is deleted once no record uses it.
pub fn migrate_digests(store: &ContentStore, index: &MetadataIndex) -> Result<MigrationReport> {
    let mut report = MigrationReport::default();
    let legacy = index.distinct_digests(DigestAlgorithm::Md5)?;
    info!(count = legacy.len(), "Migrating legacy digests");

    for old in legacy {
        if !store.contains(&old)? {
            warn!(digest = %old.short_string(), "Legacy blob missing, skipping");
            report.missing.push(old);
            continue;
        }
        if codec::legacy_digest(store.open(&old)?)? != old {
            warn!(digest = %old.short_string(), "Legacy blob fails verification, skipping");
            report.corrupt.push(old);
            continue;
        }

        let stored = store.put(store.open(&old)?)?;
        let rewritten = index.rewrite_digest(&old, &stored.digest)?;
        if !index.is_referenced(&old)? {
            store.delete(&old)?;
        }
        debug!(
            old = %old.short_string(),
            new = %stored.digest.short_string(),
            rewritten,
            "Migrated blob"
        );
        report.migrated += 1;
        report.records_rewritten += rewritten;
    }

    info!(
        migrated = report.migrated,
        missing = report.missing.len(),
        corrupt = report.corrupt.len(),
        "Digest migration finished"
    );
    Ok(report)
}

#[derive(Debug, Deserialize)]
struct LegacyBackup {
    backup_uuid: String,
    backup_time: String,
    backup_size: u64,
    #[serde(default)]
    backup_message: Option<String>,
    backup_files: BTreeMap<String, LegacyEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum LegacyEntry {
    File { md5: String },
    Dir { files: BTreeMap<String, LegacyEntry> },
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ImportReport {
    pub imported: Vec<BackupId>,
    /// Ids that were already present in the index.
    pub skipped: Vec<BackupId>,
}

fn is_legacy_metadata_file(name: &str) -> bool {
    name.starts_with("backup_") && name.ends_with("_info.json")
}

fn parse_legacy_time(raw: &str) -> Result<DateTime<Utc>> {
    let naive = NaiveDateTime::parse_from_str(raw, LEGACY_TIME_FORMAT)
        .map_err(|e| Error::Other(format!("invalid backup time {:?}: {}", raw, e)))?;
    Ok(naive
        .and_local_timezone(Local)
        .earliest()
        .map(|local| local.with_timezone(&Utc))
        .unwrap_or_else(|| naive.and_utc()))
}

fn flatten_tree(
    backup_id: &str,
    parent: &str,
    entries: &BTreeMap<String, LegacyEntry>,
    out: &mut Vec<FileRecord>,
) -> Result<()> {
    for (name, entry) in entries {
        match entry {
            LegacyEntry::File { md5 } => out.push(FileRecord {
                backup_id: backup_id.to_string(),
                path: parent.to_string(),
                name: name.clone(),
                digest: Digest::from_parts(DigestAlgorithm::Md5, md5)?,
            }),
            LegacyEntry::Dir { files } => {
                let child = if parent.is_empty() {
                    name.clone()
                } else {
                    format!("{}/{}", parent, name)
                };
                flatten_tree(backup_id, &child, files, out)?;
            }
        }
    }
    Ok(())
}

/// Imports every `backup_<id>_info.json` file in `dir`. Each backup is
/// committed in its own transaction.
pub fn import_legacy_metadata(dir: &Path, index: &MetadataIndex) -> Result<ImportReport> {
    let mut names: Vec<String> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .filter(|name| is_legacy_metadata_file(name))
        .collect();
    names.sort();

    let mut report = ImportReport::default();
    for name in names {
        let raw = fs::read_to_string(dir.join(&name))?;
        let legacy: LegacyBackup = serde_json::from_str(&raw)?;
        if index.contains(&legacy.backup_uuid)? {
            debug!(backup_id = %legacy.backup_uuid, "Backup already indexed, skipping");
            report.skipped.push(legacy.backup_uuid);
            continue;
        }

        let mut files = Vec::new();
        flatten_tree(&legacy.backup_uuid, "", &legacy.backup_files, &mut files)?;
        let record = BackupRecord {
            id: legacy.backup_uuid.clone(),
            created_at: parse_legacy_time(&legacy.backup_time)?,
            size: legacy.backup_size,
            message: legacy.backup_message,
            locked: false,
        };
        index.commit_backup(&record, &files)?;
        info!(backup_id = %record.id, files = files.len(), "Imported legacy backup");
        report.imported.push(record.id);
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use tempfile::TempDir;

    const LEGACY: &str = r#"{
        "backup_uuid": "0f3a9c",
        "backup_time": "2023-05-01 12:30:00",
        "backup_size": 11,
        "backup_message": "old",
        "backup_files": {
            "world": {
                "type": "dir",
                "files": {
                    "level.dat": {"type": "file", "md5": "5d41402abc4b2a76b9719d911017c592", "mtime": 1.0, "size": 5},
                    "region": {
                        "type": "dir",
                        "files": {
                            "r.0.0.mca": {"type": "file", "md5": "7d793037a0760186574b0282f2f435e7", "mtime": 1.0, "size": 5}
                        }
                    }
                }
            }
        }
    }"#;

    fn put_legacy_blob(store: &ContentStore, data: &[u8]) -> Digest {
        let digest = codec::legacy_digest(data).unwrap();
        let path = store.raw_path(&digest);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::File::create(&path).unwrap().write_all(data).unwrap();
        digest
    }

    #[test]
    fn test_import_flattens_tree_and_skips_existing() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("backup_0f3a9c_info.json"), LEGACY).unwrap();
        fs::write(dir.path().join("cache_index.json"), "{}").unwrap();

        let index = MetadataIndex::in_memory().unwrap();
        let report = import_legacy_metadata(dir.path(), &index).unwrap();
        assert_eq!(report.imported, vec!["0f3a9c".to_string()]);

        let backup = index.get_backup("0f3a9c").unwrap().unwrap();
        assert_eq!(backup.size, 11);
        assert_eq!(backup.message.as_deref(), Some("old"));

        let mut files: Vec<(String, String)> = index
            .list_files("0f3a9c")
            .unwrap()
            .into_iter()
            .map(|f| (f.path, f.name))
            .collect();
        files.sort();
        assert_eq!(
            files,
            vec![
                ("world".to_string(), "level.dat".to_string()),
                ("world/region".to_string(), "r.0.0.mca".to_string()),
            ]
        );

        let again = import_legacy_metadata(dir.path(), &index).unwrap();
        assert!(again.imported.is_empty());
        assert_eq!(again.skipped, vec!["0f3a9c".to_string()]);
    }

    #[test]
    fn test_migrate_rewrites_records_and_drops_legacy_blob() {
        let dir = TempDir::new().unwrap();
        let store = ContentStore::new(dir.path(), 0).unwrap();
        store.init().unwrap();
        let index = MetadataIndex::in_memory().unwrap();

        let old = put_legacy_blob(&store, b"hello");
        let record = BackupRecord::new("aaaaaa".to_string(), 5, None);
        let file = FileRecord {
            backup_id: "aaaaaa".to_string(),
            path: "world".to_string(),
            name: "a.txt".to_string(),
            digest: old.clone(),
        };
        index.commit_backup(&record, &[file]).unwrap();

        let report = migrate_digests(&store, &index).unwrap();
        assert_eq!(report.migrated, 1);
        assert_eq!(report.records_rewritten, 1);
        assert!(!store.contains(&old).unwrap());

        let migrated = &index.list_files("aaaaaa").unwrap()[0].digest;
        assert_eq!(migrated.algorithm(), DigestAlgorithm::Blake3);
        let mut content = String::new();
        store.open(migrated).unwrap().read_to_string(&mut content).unwrap();
        assert_eq!(content, "hello");
        assert!(index.distinct_digests(DigestAlgorithm::Md5).unwrap().is_empty());
    }

    #[test]
    fn test_migrate_reports_missing_blob() {
        let dir = TempDir::new().unwrap();
        let store = ContentStore::new(dir.path(), 0).unwrap();
        store.init().unwrap();
        let index = MetadataIndex::in_memory().unwrap();
        let ghost = codec::legacy_digest(&b"gone"[..]).unwrap();
        let file = FileRecord {
            backup_id: "bbbbbb".to_string(),
            path: String::new(),
            name: "x".to_string(),
            digest: ghost.clone(),
        };
        index
            .commit_backup(&BackupRecord::new("bbbbbb".to_string(), 4, None), &[file])
            .unwrap();

        let report = migrate_digests(&store, &index).unwrap();
        assert_eq!(report.migrated, 0);
        assert_eq!(report.missing, vec![ghost]);
    }
}
