use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Hash scheme a blob digest was produced with.
///
/// New blobs are always written with [`DigestAlgorithm::Blake3`]. Stores that
/// predate the switch still carry MD5 blobs, which remain readable until
/// `maintenance::migrate_digests` rewrites them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DigestAlgorithm {
    Blake3,
    Md5,
}

impl DigestAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            DigestAlgorithm::Blake3 => "blake3",
            DigestAlgorithm::Md5 => "md5",
        }
    }

    pub fn hex_len(&self) -> usize {
        match self {
            DigestAlgorithm::Blake3 => 64,
            DigestAlgorithm::Md5 => 32,
        }
    }
}

impl fmt::Display for DigestAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DigestAlgorithm {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "blake3" => Ok(DigestAlgorithm::Blake3),
            "md5" => Ok(DigestAlgorithm::Md5),
            other => Err(crate::Error::CodecUnavailable(format!(
                "unknown digest algorithm: {}",
                other
            ))),
        }
    }
}

/// Content digest identifying a blob.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Digest {
    algorithm: DigestAlgorithm,
    hex: String,
}

impl Digest {
    pub fn from_blake3(hash: blake3::Hash) -> Self {
        Self {
            algorithm: DigestAlgorithm::Blake3,
            hex: hash.to_hex().to_string(),
        }
    }

    pub fn from_md5(digest: md5::Digest) -> Self {
        Self {
            algorithm: DigestAlgorithm::Md5,
            hex: format!("{:x}", digest),
        }
    }

    /// Builds a digest from a stored hex string, validating it against the algorithm.
    pub fn from_parts(algorithm: DigestAlgorithm, hex: &str) -> crate::Result<Self> {
        let hex = hex.to_ascii_lowercase();
        if hex.len() != algorithm.hex_len() || hex::decode(&hex).is_err() {
            return Err(crate::Error::Integrity {
                digest: format!("{}:{}", algorithm, hex),
            });
        }
        Ok(Self { algorithm, hex })
    }

    pub fn algorithm(&self) -> DigestAlgorithm {
        self.algorithm
    }

    pub fn as_hex(&self) -> &str {
        &self.hex
    }

    /// Shard directory name: the first byte of the digest.
    pub fn shard(&self) -> &str {
        &self.hex[..2]
    }

    /// File name inside the shard directory.
    pub fn remainder(&self) -> &str {
        &self.hex[2..]
    }

    pub fn short_string(&self) -> String {
        self.hex.chars().take(8).collect()
    }
}

impl FromStr for Digest {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let algorithm = match s.len() {
            64 => DigestAlgorithm::Blake3,
            32 => DigestAlgorithm::Md5,
            _ => {
                return Err(crate::Error::Integrity {
                    digest: s.to_string(),
                })
            }
        };
        Digest::from_parts(algorithm, s)
    }
}

impl Serialize for Digest {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.hex)
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Digest::from_str(&s).map_err(serde::de::Error::custom)
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.hex)
    }
}

pub type BackupId = String;

/// Width of a backup short id in hex characters.
pub const BACKUP_ID_LEN: usize = 6;

/// Generates a short backup id from a random UUID.
pub fn new_backup_id() -> BackupId {
    uuid::Uuid::new_v4().simple().to_string()[..BACKUP_ID_LEN].to_string()
}

/// Metadata describing one snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub id: BackupId,
    pub created_at: DateTime<Utc>,
    /// Sum of the logical sizes of every file in the backup.
    pub size: u64,
    pub message: Option<String>,
    pub locked: bool,
}

impl BackupRecord {
    pub fn new(id: BackupId, size: u64, message: Option<String>) -> Self {
        Self {
            id,
            created_at: Utc::now(),
            size,
            message,
            locked: false,
        }
    }

    pub fn summary(&self) -> String {
        format!(
            "{} - {} at {}{}",
            self.id,
            format_size(self.size),
            self.created_at.format("%Y-%m-%d %H:%M:%S UTC"),
            self.message
                .as_ref()
                .map(|m| format!(" ({})", m))
                .unwrap_or_default()
        )
    }
}

/// Association between a backup and one stored file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub backup_id: BackupId,
    /// Parent directory relative to the server root, `/`-separated.
    pub path: String,
    pub name: String,
    pub digest: Digest,
}

impl FileRecord {
    /// Path of the file relative to the server root.
    pub fn relative_path(&self) -> std::path::PathBuf {
        let mut out = std::path::PathBuf::new();
        for part in self.path.split('/').filter(|p| !p.is_empty()) {
            out.push(part);
        }
        out.push(&self.name);
        out
    }
}

/// Which backups a listing should include.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockFilter {
    #[default]
    All,
    Locked,
    Unlocked,
}

pub fn format_size(size: u64) -> String {
    if size < 1 << 30 {
        format!("{:.2} MB", size as f64 / (1u64 << 20) as f64)
    } else {
        format!("{:.2} GB", size as f64 / (1u64 << 30) as f64)
    }
}
