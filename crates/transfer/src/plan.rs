use crate::TransferError;
use crate::types::Chunk;

/// Maximum number of parts a single multipart upload may carry.
pub const MAX_PARTS: u64 = 10_000;

/// Number of chunks needed to cover `file_size` bytes, i.e.
/// `ceil(file_size / chunk_size)`.
///
/// Returns 0 when `chunk_size` is 0; [`plan_chunks`] rejects that case.
pub fn chunk_count(file_size: u64, chunk_size: u64) -> u64 {
    if chunk_size == 0 {
        return 0;
    }
    file_size.div_ceil(chunk_size)
}

/// Splits `[0, file_size)` into consecutive chunks of `chunk_size` bytes.
///
/// Part numbers start at 1 and follow sequence order. The last chunk holds
/// the remainder and may be shorter than `chunk_size`. An empty file yields
/// no chunks at all.
pub fn plan_chunks(file_size: u64, chunk_size: u64) -> Result<Vec<Chunk>, TransferError> {
    if chunk_size == 0 {
        return Err(TransferError::InvalidChunkSize);
    }

    let count = chunk_count(file_size, chunk_size);
    if count > MAX_PARTS {
        return Err(TransferError::TooManyParts {
            parts: count,
            max: MAX_PARTS,
        });
    }

    let chunks = (0..count)
        .map(|i| {
            let offset = i * chunk_size;
            Chunk {
                // count <= MAX_PARTS, so i + 1 fits in u16.
                part_number: (i + 1) as u16,
                offset,
                length: chunk_size.min(file_size - offset),
            }
        })
        .collect();

    Ok(chunks)
}
