//! Chunk planning and byte-range reads for multipart uploads.
//!
//! A source file is split into contiguous, 1-based numbered [`Chunk`]s by
//! [`plan_chunks`]; each chunk is later read on its own by a [`ChunkReader`]
//! so that workers never share a file handle.

mod chunked;
mod plan;
mod progress;
mod types;

pub use chunked::{ChunkData, ChunkReader, content_md5, md5_hex};
pub use plan::{MAX_PARTS, chunk_count, plan_chunks};
pub use progress::{Throughput, format_rate};
pub use types::Chunk;

/// Bytes per megabyte as used by the chunk-size setting.
pub const MEGABYTE: u64 = 1024 * 1024;

/// Default chunk size: 50 MiB.
pub const DEFAULT_CHUNK_SIZE: u64 = 50 * MEGABYTE;

/// Errors produced by the transfer crate.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("chunk size must be greater than zero")]
    InvalidChunkSize,

    #[error("file needs {parts} parts, at most {max} are allowed")]
    TooManyParts { parts: u64, max: u64 },

    #[error("short read for part {part_number}: expected {expected} bytes, got {actual}")]
    ShortRead {
        part_number: u16,
        expected: u64,
        actual: u64,
    },
}
