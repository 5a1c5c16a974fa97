use cloudxfer_protocol::ChunkDescriptor;

use crate::TransferError;

/// Splits an object of `total_size` bytes into contiguous parts.
///
/// Parts are numbered from 1, every part but the last is exactly
/// `chunk_size` bytes, and the lengths sum to `total_size`. A zero-length
/// object yields no parts; callers send it as a single empty request.
pub fn plan_chunks(total_size: u64, chunk_size: u64) -> Result<Vec<ChunkDescriptor>, TransferError> {
    if chunk_size == 0 {
        return Err(TransferError::InvalidChunkSize);
    }
    if total_size == 0 {
        return Ok(Vec::new());
    }

    let count = total_size.div_ceil(chunk_size);
    let mut chunks = Vec::with_capacity(count as usize);
    for i in 0..count {
        let offset = i * chunk_size;
        let length = chunk_size.min(total_size - offset);
        chunks.push(ChunkDescriptor {
            part_number: (i + 1) as u32,
            offset,
            length,
        });
    }
    Ok(chunks)
}
