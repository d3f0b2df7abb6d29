//! Durable index of backups and the files they contain.
//!
//! Every multi-row change (committing or deleting a backup) runs inside a
//! single SQLite transaction, so a backup is either fully visible with all of
//! its files or not visible at all.

use crate::{
    BackupId, BackupRecord, Digest, DigestAlgorithm, Error, FileRecord, LockFilter, Result,
};
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

pub const INDEX_FILE: &str = "storage.db";

pub struct MetadataIndex {
    conn: Mutex<Connection>,
}

fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS backups (
            id TEXT PRIMARY KEY,
            created_at INTEGER NOT NULL,
            size INTEGER NOT NULL,
            message TEXT,
            locked INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS files (
            backup_id TEXT NOT NULL,
            path TEXT NOT NULL,
            name TEXT NOT NULL,
            hash TEXT NOT NULL,
            hash_type TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS directories (
            backup_id TEXT NOT NULL,
            path TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_files_backup ON files(backup_id);
        CREATE INDEX IF NOT EXISTS idx_directories_backup ON directories(backup_id);
        CREATE INDEX IF NOT EXISTS idx_files_hash ON files(hash);
        CREATE INDEX IF NOT EXISTS idx_backups_created ON backups(created_at);
        "#,
    )?;
    Ok(())
}

fn timestamp_from_millis(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

fn backup_from_row(row: &Row<'_>) -> rusqlite::Result<BackupRecord> {
    Ok(BackupRecord {
        id: row.get(0)?,
        created_at: timestamp_from_millis(row.get(1)?),
        size: row.get::<_, i64>(2)? as u64,
        message: row.get(3)?,
        locked: row.get::<_, i64>(4)? != 0,
    })
}

const BACKUP_COLUMNS: &str = "id, created_at, size, message, locked";

impl MetadataIndex {
    /// Opens (or creates) the index file inside `root`.
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        let conn = Connection::open(root.as_ref().join(INDEX_FILE))?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
        conn.pragma_update(None, "synchronous", "FULL")?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Other("Metadata index lock poisoned".to_string()))
    }

    /// Records a backup and all of its files as one unit.
    pub fn commit_backup(&self, backup: &BackupRecord, files: &[FileRecord]) -> Result<()> {
        self.commit_snapshot(backup, &[], files)
    }

    /// Like [`commit_backup`](Self::commit_backup), also recording the
    /// directories (relative to the server root) the backup contains.
    pub fn commit_snapshot(
        &self,
        backup: &BackupRecord,
        dirs: &[String],
        files: &[FileRecord],
    ) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        {
            let mut insert =
                tx.prepare("INSERT INTO directories (backup_id, path) VALUES (?1, ?2)")?;
            for dir in dirs {
                insert.execute(params![backup.id, dir])?;
            }
        }
        {
            let mut insert = tx.prepare(
                "INSERT INTO files (backup_id, path, name, hash, hash_type) VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for file in files {
                insert.execute(params![
                    backup.id,
                    file.path,
                    file.name,
                    file.digest.as_hex(),
                    file.digest.algorithm().as_str(),
                ])?;
            }
        }
        tx.execute(
            "INSERT INTO backups (id, created_at, size, message, locked) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                backup.id,
                backup.created_at.timestamp_millis(),
                backup.size as i64,
                backup.message,
                backup.locked as i64,
            ],
        )?;
        tx.commit()?;
        debug!(
            backup_id = %backup.id,
            dirs = dirs.len(),
            files = files.len(),
            "Committed backup to index"
        );
        Ok(())
    }

    /// Deletes a backup and its files as one unit, returning the removed files.
    pub fn delete_backup(&self, id: &str) -> Result<Vec<FileRecord>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let exists: Option<String> = tx
            .query_row("SELECT id FROM backups WHERE id = ?1", [id], |row| row.get(0))
            .optional()?;
        if exists.is_none() {
            return Err(Error::NotFound { id: id.to_string() });
        }
        let files = query_files(&tx, id)?;
        tx.execute("DELETE FROM files WHERE backup_id = ?1", [id])?;
        tx.execute("DELETE FROM directories WHERE backup_id = ?1", [id])?;
        tx.execute("DELETE FROM backups WHERE id = ?1", [id])?;
        tx.commit()?;
        debug!(backup_id = %id, files = files.len(), "Deleted backup from index");
        Ok(files)
    }

    pub fn get_backup(&self, id: &str) -> Result<Option<BackupRecord>> {
        let conn = self.conn()?;
        let record = conn
            .query_row(
                &format!("SELECT {} FROM backups WHERE id = ?1", BACKUP_COLUMNS),
                [id],
                backup_from_row,
            )
            .optional()?;
        Ok(record)
    }

    pub fn contains(&self, id: &str) -> Result<bool> {
        Ok(self.get_backup(id)?.is_some())
    }

    pub fn latest_backup(&self) -> Result<Option<BackupRecord>> {
        let conn = self.conn()?;
        let record = conn
            .query_row(
                &format!(
                    "SELECT {} FROM backups ORDER BY created_at DESC, rowid DESC LIMIT 1",
                    BACKUP_COLUMNS
                ),
                [],
                backup_from_row,
            )
            .optional()?;
        Ok(record)
    }

    /// Lists backups oldest first.
    pub fn list_backups(&self, filter: LockFilter) -> Result<Vec<BackupRecord>> {
        let clause = match filter {
            LockFilter::All => "",
            LockFilter::Locked => "WHERE locked = 1",
            LockFilter::Unlocked => "WHERE locked = 0",
        };
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM backups {} ORDER BY created_at ASC, rowid ASC",
            BACKUP_COLUMNS, clause
        ))?;
        let rows = stmt.query_map([], backup_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn count_backups(&self) -> Result<usize> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM backups", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    pub fn list_files(&self, id: &str) -> Result<Vec<FileRecord>> {
        let conn = self.conn()?;
        query_files(&conn, id)
    }

    pub fn list_directories(&self, id: &str) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT path FROM directories WHERE backup_id = ?1 ORDER BY rowid")?;
        let dirs = stmt
            .query_map([id], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(dirs)
    }

    /// True while any file of any backup still points at the digest.
    pub fn is_referenced(&self, digest: &Digest) -> Result<bool> {
        let conn = self.conn()?;
        let found = conn
            .query_row(
                "SELECT 1 FROM files WHERE hash = ?1 AND hash_type = ?2 LIMIT 1",
                params![digest.as_hex(), digest.algorithm().as_str()],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn set_locked(&self, id: &str, locked: bool) -> Result<BackupRecord> {
        {
            let conn = self.conn()?;
            let changed = conn.execute(
                "UPDATE backups SET locked = ?1 WHERE id = ?2",
                params![locked as i64, id],
            )?;
            if changed == 0 {
                return Err(Error::NotFound { id: id.to_string() });
            }
        }
        self.get_backup(id)?
            .ok_or_else(|| Error::NotFound { id: id.to_string() })
    }

    pub fn distinct_digests(&self, algorithm: DigestAlgorithm) -> Result<Vec<Digest>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT DISTINCT hash FROM files WHERE hash_type = ?1 ORDER BY hash")?;
        let hashes = stmt
            .query_map([algorithm.as_str()], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        hashes
            .iter()
            .map(|hash| Digest::from_parts(algorithm, hash))
            .collect()
    }

    /// Repoints every file record from `old` to `new`. Returns the row count.
    pub fn rewrite_digest(&self, old: &Digest, new: &Digest) -> Result<usize> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let changed = tx.execute(
            "UPDATE files SET hash = ?1, hash_type = ?2 WHERE hash = ?3 AND hash_type = ?4",
            params![
                new.as_hex(),
                new.algorithm().as_str(),
                old.as_hex(),
                old.algorithm().as_str(),
            ],
        )?;
        tx.commit()?;
        Ok(changed)
    }

    pub fn clear(&self) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM files", [])?;
        tx.execute("DELETE FROM directories", [])?;
        tx.execute("DELETE FROM backups", [])?;
        tx.commit()?;
        Ok(())
    }
}

fn query_files(conn: &Connection, id: &str) -> Result<Vec<FileRecord>> {
    let mut stmt = conn.prepare(
        "SELECT backup_id, path, name, hash, hash_type FROM files WHERE backup_id = ?1 ORDER BY rowid",
    )?;
    let rows = stmt
        .query_map([id], |row| {
            Ok((
                row.get::<_, BackupId>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    rows.into_iter()
        .map(|(backup_id, path, name, hash, hash_type)| {
            let algorithm: DigestAlgorithm = hash_type.parse()?;
            Ok(FileRecord {
                backup_id,
                path,
                name,
                digest: Digest::from_parts(algorithm, &hash)?,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn digest(data: &[u8]) -> Digest {
        Digest::from_blake3(blake3::hash(data))
    }

    fn file(backup: &str, name: &str, data: &[u8]) -> FileRecord {
        FileRecord {
            backup_id: backup.to_string(),
            path: "world".to_string(),
            name: name.to_string(),
            digest: digest(data),
        }
    }

    fn backup(id: &str, offset_secs: i64) -> BackupRecord {
        let mut record = BackupRecord::new(id.to_string(), 10, None);
        record.created_at = Utc::now() + Duration::seconds(offset_secs);
        record
    }

    #[test]
    fn test_schema_creation() {
        let index = MetadataIndex::in_memory().unwrap();
        let conn = index.conn().unwrap();
        let count: i32 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name IN ('backups', 'files')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 2);
    }

    #[test]
    fn test_commit_and_load_backup() {
        let index = MetadataIndex::in_memory().unwrap();
        let record = backup("aaaaaa", 0);
        let files = vec![file("aaaaaa", "a.txt", b"a"), file("aaaaaa", "b.txt", b"b")];
        index.commit_backup(&record, &files).unwrap();

        let loaded = index.get_backup("aaaaaa").unwrap().unwrap();
        assert_eq!(loaded.id, "aaaaaa");
        assert_eq!(
            loaded.created_at.timestamp_millis(),
            record.created_at.timestamp_millis()
        );
        assert_eq!(index.list_files("aaaaaa").unwrap(), files);
        assert!(index.is_referenced(&digest(b"a")).unwrap());
        assert!(!index.is_referenced(&digest(b"zzz")).unwrap());
    }

    #[test]
    fn test_failed_commit_leaves_nothing_visible() {
        let index = MetadataIndex::in_memory().unwrap();
        index.commit_backup(&backup("aaaaaa", 0), &[]).unwrap();

        // Same id again: the backup insert fails after the files were staged.
        let err = index
            .commit_backup(&backup("aaaaaa", 1), &[file("aaaaaa", "late.txt", b"late")])
            .unwrap_err();
        assert!(matches!(err, Error::Database(_)));
        assert!(index.list_files("aaaaaa").unwrap().is_empty());
        assert!(!index.is_referenced(&digest(b"late")).unwrap());
    }

    #[test]
    fn test_delete_backup_returns_files() {
        let index = MetadataIndex::in_memory().unwrap();
        index
            .commit_backup(&backup("aaaaaa", 0), &[file("aaaaaa", "x", b"x")])
            .unwrap();

        let removed = index.delete_backup("aaaaaa").unwrap();
        assert_eq!(removed.len(), 1);
        assert!(!index.contains("aaaaaa").unwrap());
        assert!(!index.is_referenced(&digest(b"x")).unwrap());
        assert!(matches!(
            index.delete_backup("aaaaaa"),
            Err(Error::NotFound { .. })
        ));
    }

    #[test]
    fn test_listing_order_and_filters() {
        let index = MetadataIndex::in_memory().unwrap();
        index.commit_backup(&backup("cccccc", 20), &[]).unwrap();
        index.commit_backup(&backup("aaaaaa", 0), &[]).unwrap();
        index.commit_backup(&backup("bbbbbb", 10), &[]).unwrap();
        index.set_locked("bbbbbb", true).unwrap();

        let ids = |records: Vec<BackupRecord>| {
            records.into_iter().map(|r| r.id).collect::<Vec<_>>()
        };
        assert_eq!(
            ids(index.list_backups(LockFilter::All).unwrap()),
            vec!["aaaaaa", "bbbbbb", "cccccc"]
        );
        assert_eq!(ids(index.list_backups(LockFilter::Locked).unwrap()), vec!["bbbbbb"]);
        assert_eq!(
            ids(index.list_backups(LockFilter::Unlocked).unwrap()),
            vec!["aaaaaa", "cccccc"]
        );
        assert_eq!(index.latest_backup().unwrap().unwrap().id, "cccccc");
        assert_eq!(index.count_backups().unwrap(), 3);
    }

    #[test]
    fn test_directories_follow_their_backup() {
        let index = MetadataIndex::in_memory().unwrap();
        let dirs = vec!["world".to_string(), "world/datapacks".to_string()];
        index
            .commit_snapshot(&backup("aaaaaa", 0), &dirs, &[file("aaaaaa", "x", b"x")])
            .unwrap();
        assert_eq!(index.list_directories("aaaaaa").unwrap(), dirs);

        index.delete_backup("aaaaaa").unwrap();
        assert!(index.list_directories("aaaaaa").unwrap().is_empty());
    }

    #[test]
    fn test_set_locked_unknown_id() {
        let index = MetadataIndex::in_memory().unwrap();
        assert!(matches!(
            index.set_locked("nope00", true),
            Err(Error::NotFound { .. })
        ));
    }

    #[test]
    fn test_rewrite_digest() {
        let index = MetadataIndex::in_memory().unwrap();
        let old = Digest::from_md5(md5::compute(b"x"));
        let mut record = file("aaaaaa", "x", b"x");
        record.digest = old.clone();
        index.commit_backup(&backup("aaaaaa", 0), &[record]).unwrap();

        assert_eq!(index.distinct_digests(DigestAlgorithm::Md5).unwrap(), vec![old.clone()]);
        let new = digest(b"x");
        assert_eq!(index.rewrite_digest(&old, &new).unwrap(), 1);
        assert!(index.distinct_digests(DigestAlgorithm::Md5).unwrap().is_empty());
        assert_eq!(index.list_files("aaaaaa").unwrap()[0].digest, new);
    }
}
