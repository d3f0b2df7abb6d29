use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Output format of an exported backup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExportFormat {
    #[serde(rename = "plain")]
    Plain,
    #[serde(rename = "tar")]
    Tar,
    #[serde(rename = "tar+gzip")]
    TarGzip,
    #[serde(rename = "tar+xz")]
    TarXz,
    #[serde(rename = "tar+zstd")]
    TarZstd,
}

impl ExportFormat {
    pub const ALL: [ExportFormat; 5] = [
        ExportFormat::Plain,
        ExportFormat::Tar,
        ExportFormat::TarGzip,
        ExportFormat::TarXz,
        ExportFormat::TarZstd,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ExportFormat::Plain => "plain",
            ExportFormat::Tar => "tar",
            ExportFormat::TarGzip => "tar+gzip",
            ExportFormat::TarXz => "tar+xz",
            ExportFormat::TarZstd => "tar+zstd",
        }
    }

    /// File name suffix of the artifact; empty for plain directories.
    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Plain => "",
            ExportFormat::Tar => ".tar",
            ExportFormat::TarGzip => ".tar.gz",
            ExportFormat::TarXz => ".tar.xz",
            ExportFormat::TarZstd => ".tar.zst",
        }
    }

    pub fn max_level(&self) -> u32 {
        match self {
            ExportFormat::Plain | ExportFormat::Tar => 0,
            ExportFormat::TarGzip | ExportFormat::TarXz => 9,
            ExportFormat::TarZstd => 22,
        }
    }

    fn default_level(&self) -> u32 {
        match self {
            ExportFormat::Plain | ExportFormat::Tar => 0,
            ExportFormat::TarGzip | ExportFormat::TarXz => 6,
            ExportFormat::TarZstd => 3,
        }
    }

    fn min_level(&self) -> u32 {
        match self {
            ExportFormat::TarZstd => 1,
            _ => 0,
        }
    }

    /// Validates an optional level, falling back to the format default.
    pub fn resolve_level(&self, level: Option<u32>) -> Result<u32> {
        let level = level.unwrap_or_else(|| self.default_level());
        if level < self.min_level() || level > self.max_level() {
            return Err(Error::InvalidLevel {
                format: self.name().to_string(),
                level,
                max: self.max_level(),
            });
        }
        Ok(level)
    }

    pub fn is_archive(&self) -> bool {
        !matches!(self, ExportFormat::Plain)
    }

    pub fn artifact_path(&self, export_dir: &Path, backup_id: &str) -> PathBuf {
        export_dir.join(format!("{}{}", backup_id, self.extension()))
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ExportFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "plain" => Ok(ExportFormat::Plain),
            "tar" => Ok(ExportFormat::Tar),
            "tar+gzip" | "tar.gz" | "tgz" => Ok(ExportFormat::TarGzip),
            "tar+xz" | "tar.xz" => Ok(ExportFormat::TarXz),
            "tar+zstd" | "tar.zst" => Ok(ExportFormat::TarZstd),
            other => Err(Error::CodecUnavailable(format!(
                "unsupported export format: {}",
                other
            ))),
        }
    }
}

/// Streams `source` into an archive at `dest`, with every entry placed under
/// `root_name/`. `level` must already be validated for the format.
pub fn write_archive(
    source: &Path,
    root_name: &str,
    dest: &Path,
    format: ExportFormat,
    level: u32,
) -> Result<()> {
    match format {
        ExportFormat::Plain => Err(Error::Other("plain exports are not archived".to_string())),
        ExportFormat::Tar => {
            let out = append_tree(tar::Builder::new(create_dest(dest)?), source, root_name)?;
            finish_writer(out)
        }
        ExportFormat::TarGzip => {
            let encoder =
                flate2::write::GzEncoder::new(create_dest(dest)?, flate2::Compression::new(level));
            let encoder = append_tree(tar::Builder::new(encoder), source, root_name)?;
            finish_writer(encoder.finish()?)
        }
        ExportFormat::TarXz => {
            let encoder = xz2::write::XzEncoder::new(create_dest(dest)?, level);
            let encoder = append_tree(tar::Builder::new(encoder), source, root_name)?;
            finish_writer(encoder.finish()?)
        }
        ExportFormat::TarZstd => {
            let encoder = zstd::stream::write::Encoder::new(create_dest(dest)?, level as i32)
                .map_err(|e| Error::CodecUnavailable(format!("zstd encoder: {}", e)))?;
            let encoder = append_tree(tar::Builder::new(encoder), source, root_name)?;
            finish_writer(encoder.finish()?)
        }
    }
}

fn create_dest(dest: &Path) -> Result<BufWriter<File>> {
    Ok(BufWriter::new(File::create(dest)?))
}

fn append_tree<W: Write>(mut builder: tar::Builder<W>, source: &Path, root_name: &str) -> Result<W> {
    builder.follow_symlinks(false);
    builder.append_dir_all(root_name, source)?;
    Ok(builder.into_inner()?)
}

fn finish_writer<W: Write>(mut writer: BufWriter<W>) -> Result<()> {
    writer.flush()?;
    Ok(())
}
