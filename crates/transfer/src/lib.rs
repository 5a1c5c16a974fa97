//! Chunked object transfer primitives: planning, positional chunk I/O,
//! integrity tags and throttled progress reporting.

mod chunked;
mod plan;
mod progress;
mod validation;

pub use chunked::{
    ChunkReader, ChunkWriter, STAGING_SUFFIX, checksum_bytes, content_md5, md5_hex, remove_staging,
    staging_path,
};
pub use plan::plan_chunks;
pub use progress::{ProgressThrottler, SpeedCalculator};
pub use validation::{MAX_KEY_LEN, validate_object_key};

/// Default part size: 8 MiB.
///
/// Above the 5 MiB multipart minimum both providers enforce for every part
/// except the last.
pub const DEFAULT_CHUNK_SIZE: u64 = 8 * 1024 * 1024;

/// Errors produced by the transfer crate.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("chunk size must be greater than zero")]
    InvalidChunkSize,

    #[error("short read at offset {offset}: expected {expected} bytes, got {actual}")]
    ShortRead {
        offset: u64,
        expected: u64,
        actual: u64,
    },

    #[error("checksum mismatch for part {part_number}")]
    ChecksumMismatch { part_number: u32 },

    #[error("chunk out of bounds: part {part_number} ends at {end}, object size {size}")]
    OutOfBounds {
        part_number: u32,
        end: u64,
        size: u64,
    },

    #[error("invalid object key: {0}")]
    InvalidKey(String),
}
