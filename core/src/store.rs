//! Content-addressed blob store.
//!
//! Blobs live under `<root>/cache/<shard>/<remainder>` where the shard is the
//! first byte of the digest in hex. A blob exists either raw or with the
//! [`COMPRESSED_SUFFIX`], never both. Writes are staged under
//! `<root>/staging` and renamed into place, so a blob path only ever holds
//! complete content.

use crate::codec::{self, BlobWriter, COMPRESSED_SUFFIX};
use crate::{Digest, Error, Result};
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

pub const CACHE_DIR: &str = "cache";
pub const STAGING_DIR: &str = "staging";

/// Outcome of a [`ContentStore::put`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBlob {
    pub digest: Digest,
    /// Size of the blob on disk (compressed size when compressed).
    pub size: u64,
    /// Logical length of the content that was read.
    pub content_len: u64,
    /// True when an identical blob was already present and nothing was written.
    pub deduplicated: bool,
}

/// Aggregate figures for the cache directory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreUsage {
    pub blobs: u64,
    pub bytes: u64,
}

#[derive(Debug, Clone)]
pub struct ContentStore {
    root: PathBuf,
    level: i32,
}

impl ContentStore {
    /// Creates a store rooted at `root`. `level` is the zstd level applied to
    /// new blobs; 0 stores them raw.
    pub fn new<P: AsRef<Path>>(root: P, level: i32) -> Result<Self> {
        Ok(Self {
            root: root.as_ref().to_path_buf(),
            level: codec::validate_level(level)?,
        })
    }

    /// Creates the staging directory and all 256 shard directories.
    pub fn init(&self) -> Result<()> {
        fs::create_dir_all(self.staging_dir())?;
        let cache = self.cache_dir();
        for shard in 0..=255u8 {
            fs::create_dir_all(cache.join(format!("{:02x}", shard)))?;
        }
        debug!(path = %cache.display(), "Initialized content store");
        Ok(())
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.root.join(CACHE_DIR)
    }

    fn staging_dir(&self) -> PathBuf {
        self.root.join(STAGING_DIR)
    }

    pub fn level(&self) -> i32 {
        self.level
    }

    pub fn raw_path(&self, digest: &Digest) -> PathBuf {
        self.cache_dir().join(digest.shard()).join(digest.remainder())
    }

    pub fn compressed_path(&self, digest: &Digest) -> PathBuf {
        self.cache_dir()
            .join(digest.shard())
            .join(format!("{}{}", digest.remainder(), COMPRESSED_SUFFIX))
    }

    /// Returns the on-disk size of whichever form of the blob exists.
    pub fn stored_size(&self, digest: &Digest) -> Result<Option<u64>> {
        for path in [self.raw_path(digest), self.compressed_path(digest)] {
            match fs::metadata(&path) {
                Ok(meta) => return Ok(Some(meta.len())),
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(None)
    }

    pub fn contains(&self, digest: &Digest) -> Result<bool> {
        Ok(self.stored_size(digest)?.is_some())
    }

    /// Stores the content of `reader`, hashing it while it streams to disk.
    ///
    /// If a blob with the same digest already exists the freshly staged bytes
    /// are discarded and the existing blob's size is reported.
    pub fn put<R: Read>(&self, reader: R) -> Result<StoredBlob> {
        let staging = tempfile::NamedTempFile::new_in(self.staging_dir())?;
        let mut writer = BlobWriter::new(staging, self.level)?;
        let compressed = writer.is_compressed();
        let (digest, content_len) = codec::copy_hashed(reader, &mut writer)?;
        let staging = writer.finish()?;

        if let Some(size) = self.stored_size(&digest)? {
            trace!(digest = %digest.short_string(), "Blob already stored");
            return Ok(StoredBlob {
                digest,
                size,
                content_len,
                deduplicated: true,
            });
        }

        let target = if compressed {
            self.compressed_path(&digest)
        } else {
            self.raw_path(&digest)
        };
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        staging.as_file().sync_all()?;
        staging.persist(&target).map_err(|e| Error::Io(e.error))?;
        let size = fs::metadata(&target)?.len();

        debug!(
            digest = %digest.short_string(),
            size,
            content_len,
            compressed,
            "Stored new blob"
        );
        Ok(StoredBlob {
            digest,
            size,
            content_len,
            deduplicated: false,
        })
    }

    pub fn put_file<P: AsRef<Path>>(&self, path: P) -> Result<StoredBlob> {
        let file = File::open(path.as_ref())?;
        self.put(file)
    }

    /// Opens a blob for reading, decompressing transparently.
    pub fn open(&self, digest: &Digest) -> Result<Box<dyn Read + Send>> {
        match File::open(self.raw_path(digest)) {
            Ok(file) => return Ok(Box::new(io::BufReader::new(file))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        match File::open(self.compressed_path(digest)) {
            Ok(file) => codec::open_decoder(file),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(Error::Integrity {
                digest: digest.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Removes the blob in whichever form it exists. Missing blobs are not an
    /// error. The caller must ensure nothing references the digest anymore.
    pub fn delete(&self, digest: &Digest) -> Result<()> {
        for path in [self.raw_path(digest), self.compressed_path(digest)] {
            match fs::remove_file(&path) {
                Ok(()) => debug!(digest = %digest.short_string(), "Deleted blob"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    pub fn usage(&self) -> Result<StoreUsage> {
        let mut usage = StoreUsage::default();
        let cache = self.cache_dir();
        if !cache.exists() {
            return Ok(usage);
        }
        for entry in walkdir::WalkDir::new(&cache).min_depth(2).max_depth(2) {
            let entry = entry.map_err(|e| Error::Io(e.into()))?;
            if entry.file_type().is_file() {
                usage.blobs += 1;
                usage.bytes += entry.metadata().map_err(|e| Error::Io(e.into()))?.len();
            }
        }
        Ok(usage)
    }

    pub fn blob_count(&self) -> Result<u64> {
        Ok(self.usage()?.blobs)
    }

    /// Bytes on disk across all blobs.
    pub fn total_size(&self) -> Result<u64> {
        Ok(self.usage()?.bytes)
    }

    /// Drops every blob and recreates the empty shard layout.
    pub fn clear(&self) -> Result<()> {
        for dir in [self.cache_dir(), self.staging_dir()] {
            match fs::remove_dir_all(&dir) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        self.init()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tempfile::TempDir;

    fn store(level: i32) -> (TempDir, ContentStore) {
        let dir = TempDir::new().unwrap();
        let store = ContentStore::new(dir.path(), level).unwrap();
        store.init().unwrap();
        (dir, store)
    }

    fn read_all(store: &ContentStore, digest: &Digest) -> Vec<u8> {
        let mut out = Vec::new();
        store.open(digest).unwrap().read_to_end(&mut out).unwrap();
        out
    }

    #[test]
    fn test_init_creates_all_shards() {
        let (_dir, store) = store(0);
        let shards = fs::read_dir(store.cache_dir()).unwrap().count();
        assert_eq!(shards, 256);
        assert!(store.cache_dir().join("00").is_dir());
        assert!(store.cache_dir().join("ff").is_dir());
    }

    #[test]
    fn test_identical_content_is_stored_once() {
        let (_dir, store) = store(0);
        let first = store.put(Cursor::new(b"hello")).unwrap();
        let second = store.put(Cursor::new(b"hello")).unwrap();

        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.digest, second.digest);
        assert_eq!(second.size, 5);
        assert_eq!(store.blob_count().unwrap(), 1);
        assert_eq!(store.total_size().unwrap(), 5);
        assert_eq!(
            store.raw_path(&first.digest),
            store
                .cache_dir()
                .join(&first.digest.as_hex()[..2])
                .join(&first.digest.as_hex()[2..])
        );
    }

    #[test]
    fn test_compressed_blob_roundtrip() {
        let (_dir, store) = store(3);
        let data = b"abcabcabc".repeat(5000);
        let blob = store.put(Cursor::new(&data)).unwrap();

        assert!(store.compressed_path(&blob.digest).exists());
        assert!(!store.raw_path(&blob.digest).exists());
        assert!(blob.size < data.len() as u64);
        assert_eq!(blob.content_len, data.len() as u64);
        assert_eq!(read_all(&store, &blob.digest), data);
    }

    #[test]
    fn test_dedup_across_compression_settings() {
        let dir = TempDir::new().unwrap();
        let raw = ContentStore::new(dir.path(), 0).unwrap();
        raw.init().unwrap();
        let first = raw.put(Cursor::new(b"payload")).unwrap();

        let compressing = ContentStore::new(dir.path(), 5).unwrap();
        let second = compressing.put(Cursor::new(b"payload")).unwrap();

        assert!(second.deduplicated);
        assert!(!compressing.compressed_path(&first.digest).exists());
        assert_eq!(compressing.blob_count().unwrap(), 1);
    }

    #[test]
    fn test_missing_blob_is_integrity_failure() {
        let (_dir, store) = store(0);
        let digest = Digest::from_blake3(blake3::hash(b"never stored"));
        assert!(matches!(store.open(&digest), Err(Error::Integrity { .. })));
    }

    #[test]
    fn test_delete_is_idempotent() {
        let (_dir, store) = store(1);
        let blob = store.put(Cursor::new(b"bye")).unwrap();
        store.delete(&blob.digest).unwrap();
        store.delete(&blob.digest).unwrap();
        assert!(!store.contains(&blob.digest).unwrap());
    }

    #[test]
    fn test_legacy_blob_is_readable() {
        let (_dir, store) = store(0);
        let digest = Digest::from_md5(md5::compute(b"old"));
        fs::write(store.raw_path(&digest), b"old").unwrap();
        assert_eq!(read_all(&store, &digest), b"old");
    }

    #[test]
    fn test_clear_empties_store() {
        let (_dir, store) = store(0);
        store.put(Cursor::new(b"a")).unwrap();
        store.put(Cursor::new(b"b")).unwrap();
        store.clear().unwrap();
        assert_eq!(store.usage().unwrap(), StoreUsage::default());
        assert_eq!(fs::read_dir(store.cache_dir()).unwrap().count(), 256);
    }
}
