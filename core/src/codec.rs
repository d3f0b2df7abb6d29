use crate::{Digest, Error, Result};
use std::fs::File;
use std::io::{self, BufReader, Read, Write};

/// Highest zstd level accepted for blob compression.
pub const MAX_BLOB_LEVEL: i32 = 22;

/// File suffix of a zstd-compressed blob.
pub const COMPRESSED_SUFFIX: &str = ".zst";

const BUFFER_SIZE: usize = 64 * 1024;

/// Reader adapter that hashes everything passing through it.
pub struct HashingReader<R> {
    inner: R,
    hasher: blake3::Hasher,
    bytes_read: u64,
}

impl<R: Read> HashingReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: blake3::Hasher::new(),
            bytes_read: 0,
        }
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    pub fn finish(self) -> Digest {
        Digest::from_blake3(self.hasher.finalize())
    }
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        self.bytes_read += n as u64;
        Ok(n)
    }
}

/// Computes the legacy MD5 digest of a stream.
pub fn legacy_digest<R: Read>(mut reader: R) -> io::Result<Digest> {
    let mut context = md5::Context::new();
    let mut buffer = vec![0u8; BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        context.consume(&buffer[..n]);
    }
    Ok(Digest::from_md5(context.compute()))
}

/// Checks a configured blob compression level; 0 stores blobs raw.
pub fn validate_level(level: i32) -> Result<i32> {
    if !(0..=MAX_BLOB_LEVEL).contains(&level) {
        return Err(Error::InvalidLevel {
            format: "blob".to_string(),
            level: level.max(0) as u32,
            max: MAX_BLOB_LEVEL as u32,
        });
    }
    Ok(level)
}

/// Destination of a blob being written, raw or through a zstd encoder.
pub enum BlobWriter<W: Write> {
    Raw(W),
    Zstd(zstd::stream::write::Encoder<'static, W>),
}

impl<W: Write> BlobWriter<W> {
    pub fn new(inner: W, level: i32) -> Result<Self> {
        if level == 0 {
            return Ok(BlobWriter::Raw(inner));
        }
        let encoder = zstd::stream::write::Encoder::new(inner, level)
            .map_err(|e| Error::CodecUnavailable(format!("zstd encoder: {}", e)))?;
        Ok(BlobWriter::Zstd(encoder))
    }

    pub fn is_compressed(&self) -> bool {
        matches!(self, BlobWriter::Zstd(_))
    }

    /// Flushes any pending frame and hands back the underlying writer.
    pub fn finish(self) -> io::Result<W> {
        match self {
            BlobWriter::Raw(mut inner) => {
                inner.flush()?;
                Ok(inner)
            }
            BlobWriter::Zstd(encoder) => {
                let mut inner = encoder.finish()?;
                inner.flush()?;
                Ok(inner)
            }
        }
    }
}

impl<W: Write> Write for BlobWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            BlobWriter::Raw(inner) => inner.write(buf),
            BlobWriter::Zstd(encoder) => encoder.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            BlobWriter::Raw(inner) => inner.flush(),
            BlobWriter::Zstd(encoder) => encoder.flush(),
        }
    }
}

/// Opens a streaming decoder over a compressed blob file.
pub fn open_decoder(file: File) -> Result<Box<dyn Read + Send>> {
    let decoder = zstd::stream::read::Decoder::with_buffer(BufReader::new(file))
        .map_err(|e| Error::CodecUnavailable(format!("zstd decoder: {}", e)))?;
    Ok(Box::new(decoder))
}

/// Copies a stream through the hasher into the blob writer.
pub(crate) fn copy_hashed<R: Read, W: Write>(
    reader: R,
    writer: &mut BlobWriter<W>,
) -> io::Result<(Digest, u64)> {
    let mut hashing = HashingReader::new(reader);
    let mut buffer = vec![0u8; BUFFER_SIZE];
    loop {
        let n = hashing.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        writer.write_all(&buffer[..n])?;
    }
    let len = hashing.bytes_read();
    Ok((hashing.finish(), len))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_hashing_reader_matches_one_shot_hash() {
        let data = vec![7u8; 200_000];
        let mut reader = HashingReader::new(Cursor::new(&data));
        let mut sink = Vec::new();
        reader.read_to_end(&mut sink).unwrap();
        assert_eq!(reader.bytes_read(), data.len() as u64);
        assert_eq!(reader.finish(), Digest::from_blake3(blake3::hash(&data)));
    }

    #[test]
    fn test_compressed_writer_produces_zstd_frame() {
        let data = b"the same line\n".repeat(1000);
        let mut writer = BlobWriter::new(Vec::new(), 3).unwrap();
        assert!(writer.is_compressed());
        let (digest, len) = copy_hashed(Cursor::new(&data), &mut writer).unwrap();
        let compressed = writer.finish().unwrap();

        assert_eq!(len, data.len() as u64);
        assert_eq!(digest, Digest::from_blake3(blake3::hash(&data)));
        assert!(compressed.len() < data.len());
        assert_eq!(zstd::decode_all(&compressed[..]).unwrap(), data);
    }

    #[test]
    fn test_level_bounds() {
        assert!(validate_level(0).is_ok());
        assert!(validate_level(22).is_ok());
        assert!(matches!(validate_level(23), Err(Error::InvalidLevel { .. })));
        assert!(validate_level(-1).is_err());
    }

    #[test]
    fn test_legacy_digest() {
        let digest = legacy_digest(Cursor::new(b"hello")).unwrap();
        assert_eq!(digest.as_hex(), "5d41402abc4b2a76b9719d911017c592");
    }
}
