use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use md5::{Digest, Md5};

use crate::TransferError;
use crate::types::Chunk;

// ---------------------------------------------------------------------------
// Digest helpers
// ---------------------------------------------------------------------------

/// Computes MD5 of `data` and returns the hex-encoded digest.
///
/// S3 reports this value as the entity tag of a single uploaded part.
pub fn md5_hex(data: &[u8]) -> String {
    hex::encode(Md5::digest(data))
}

/// Computes MD5 of `data` and returns it base64-encoded, the format of the
/// `Content-MD5` request header.
pub fn content_md5(data: &[u8]) -> String {
    STANDARD.encode(Md5::digest(data))
}

// ---------------------------------------------------------------------------
// ChunkReader
// ---------------------------------------------------------------------------

/// Bytes of one chunk together with their digests.
#[derive(Debug, Clone)]
pub struct ChunkData {
    pub chunk: Chunk,
    pub data: Vec<u8>,
    /// Hex MD5 of `data`.
    pub md5_hex: String,
    /// Base64 MD5 of `data`.
    pub content_md5: String,
}

/// Reads individual chunk ranges of a source file.
///
/// Every [`read`](Self::read) opens its own read-only handle, so a reader can
/// be cloned into as many concurrent workers as needed and a retried read
/// always starts from a clean state.
#[derive(Debug, Clone)]
pub struct ChunkReader {
    path: PathBuf,
}

impl ChunkReader {
    /// Creates a reader for the file at `path`.
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }

    /// Path of the source file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads exactly `[chunk.offset, chunk.offset + chunk.length)`.
    ///
    /// Fails with [`TransferError::ShortRead`] if the file ends before the
    /// range does.
    pub fn read(&self, chunk: &Chunk) -> Result<ChunkData, TransferError> {
        let mut file = std::fs::File::open(&self.path)?;
        file.seek(SeekFrom::Start(chunk.offset))?;

        let mut data = Vec::with_capacity(chunk.length as usize);
        let read = file.take(chunk.length).read_to_end(&mut data)? as u64;
        if read != chunk.length {
            return Err(TransferError::ShortRead {
                part_number: chunk.part_number,
                expected: chunk.length,
                actual: read,
            });
        }

        Ok(ChunkData {
            chunk: *chunk,
            md5_hex: md5_hex(&data),
            content_md5: content_md5(&data),
            data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan_chunks;
    use std::io::Write;
    use tempfile::TempDir;

    fn create_test_file(dir: &Path, name: &str, data: &[u8]) -> PathBuf {
        let path = dir.join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(data).unwrap();
        path
    }

    #[test]
    fn md5_hex_known_value() {
        assert_eq!(md5_hex(b""), "d41d8cd98f00b204e9800998ecf8427e");
        assert_eq!(md5_hex(b"hello world"), "5eb63bbbe01eeed093cb22bb8f5acdc3");
    }

    #[test]
    fn content_md5_known_value() {
        assert_eq!(content_md5(b""), "1B2M2Y8AsgTpgAmY7PhCfg==");
    }

    #[test]
    fn reads_each_range() {
        let dir = TempDir::new().unwrap();
        let path = create_test_file(dir.path(), "test.bin", b"AABBCCDDEE");
        let reader = ChunkReader::new(&path);

        let chunks = plan_chunks(10, 4).unwrap();
        let parts: Vec<Vec<u8>> = chunks
            .iter()
            .map(|c| reader.read(c).unwrap().data)
            .collect();

        assert_eq!(parts, vec![b"AABB".to_vec(), b"CCDD".to_vec(), b"EE".to_vec()]);
    }

    #[test]
    fn read_carries_digests() {
        let dir = TempDir::new().unwrap();
        let path = create_test_file(dir.path(), "test.bin", b"0123456789");
        let reader = ChunkReader::new(&path);

        let chunk = Chunk {
            part_number: 2,
            offset: 6,
            length: 4,
        };
        let data = reader.read(&chunk).unwrap();
        assert_eq!(data.chunk, chunk);
        assert_eq!(&data.data, b"6789");
        assert_eq!(data.md5_hex, md5_hex(b"6789"));
        assert_eq!(data.content_md5, content_md5(b"6789"));
    }

    #[test]
    fn reads_are_independent() {
        let dir = TempDir::new().unwrap();
        let path = create_test_file(dir.path(), "test.bin", b"abcdef");
        let reader = ChunkReader::new(&path);
        let chunk = Chunk {
            part_number: 1,
            offset: 2,
            length: 2,
        };

        // Repeated reads of the same range must not depend on earlier ones.
        assert_eq!(reader.read(&chunk).unwrap().data, b"cd");
        assert_eq!(reader.read(&chunk).unwrap().data, b"cd");
    }

    #[test]
    fn truncated_file_is_short_read() {
        let dir = TempDir::new().unwrap();
        let path = create_test_file(dir.path(), "test.bin", b"abc");
        let reader = ChunkReader::new(&path);

        let result = reader.read(&Chunk {
            part_number: 1,
            offset: 1,
            length: 10,
        });
        assert!(matches!(
            result,
            Err(TransferError::ShortRead {
                part_number: 1,
                expected: 10,
                actual: 2
            })
        ));
    }

    #[test]
    fn missing_file_is_io_error() {
        let reader = ChunkReader::new(Path::new("/nonexistent/path/file.bin"));
        let result = reader.read(&Chunk {
            part_number: 1,
            offset: 0,
            length: 1,
        });
        assert!(matches!(result, Err(TransferError::Io(_))));
    }
}
