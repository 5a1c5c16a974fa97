use std::ffi::OsString;
use std::io::{ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use md5::Md5;
use sha2::{Digest, Sha256};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::debug;

use cloudxfer_protocol::{ChunkDescriptor, PartResult};

use crate::TransferError;

/// Suffix appended to a download destination while parts are being staged.
pub const STAGING_SUFFIX: &str = ".xfer-part";

// ---------------------------------------------------------------------------
// Checksum helpers
// ---------------------------------------------------------------------------

/// Computes SHA-256 of `data` and returns the hex-encoded digest.
pub fn checksum_bytes(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Base64 MD5, the value of a `Content-MD5` header.
pub fn content_md5(data: &[u8]) -> String {
    STANDARD.encode(Md5::digest(data))
}

/// Hex MD5, used as a stand-in ETag when the provider returns none.
pub fn md5_hex(data: &[u8]) -> String {
    hex::encode(Md5::digest(data))
}

/// `<dest>.xfer-part`
pub fn staging_path(dest: &Path) -> PathBuf {
    let mut name = OsString::from(dest.as_os_str());
    name.push(STAGING_SUFFIX);
    PathBuf::from(name)
}

// ---------------------------------------------------------------------------
// ChunkReader
// ---------------------------------------------------------------------------

/// Reads single planned parts of a local file.
///
/// Each read opens its own handle and seeks to the part offset, so any number
/// of workers can read concurrently and at most one part is held per call.
#[derive(Debug, Clone)]
pub struct ChunkReader {
    path: PathBuf,
    file_size: u64,
}

impl ChunkReader {
    /// Opens `path` and records its current size.
    pub async fn open(path: &Path) -> Result<Self, TransferError> {
        let file_size = tokio::fs::metadata(path).await?.len();
        Ok(Self {
            path: path.to_path_buf(),
            file_size,
        })
    }

    /// Size of the file when it was opened.
    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads exactly the bytes described by `chunk`.
    ///
    /// Fails with [`TransferError::ShortRead`] if the file shrank underneath us.
    pub async fn read_chunk(&self, chunk: &ChunkDescriptor) -> Result<Vec<u8>, TransferError> {
        let mut file = File::open(&self.path).await?;
        file.seek(SeekFrom::Start(chunk.offset)).await?;

        let mut buf = vec![0u8; chunk.length as usize];
        let mut filled = 0;
        while filled < buf.len() {
            let n = file.read(&mut buf[filled..]).await?;
            if n == 0 {
                return Err(TransferError::ShortRead {
                    offset: chunk.offset,
                    expected: chunk.length,
                    actual: filled as u64,
                });
            }
            filled += n;
        }
        Ok(buf)
    }
}

// ---------------------------------------------------------------------------
// ChunkWriter
// ---------------------------------------------------------------------------

/// Assembles a download in a pre-sized staging file next to its destination.
///
/// Parts may be written in any order and from concurrent tasks; every write
/// opens its own handle at the part offset. The destination only appears
/// once [`finalize`](Self::finalize) renames the verified staging file.
#[derive(Debug, Clone)]
pub struct ChunkWriter {
    dest: PathBuf,
    staging: PathBuf,
    size: u64,
}

impl ChunkWriter {
    /// Creates (or reopens) the staging file for `dest` sized to `size` bytes.
    ///
    /// With `fresh` set, any stale staging content is truncated first; without
    /// it the existing bytes are kept so recorded parts stay valid.
    pub async fn create(dest: &Path, size: u64, fresh: bool) -> Result<Self, TransferError> {
        if let Some(parent) = dest.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let staging = staging_path(dest);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(fresh)
            .open(&staging)
            .await?;
        file.set_len(size).await?;
        debug!(path = %staging.display(), size, fresh, "staging file ready");

        Ok(Self {
            dest: dest.to_path_buf(),
            staging,
            size,
        })
    }

    pub fn staging_path(&self) -> &Path {
        &self.staging
    }

    pub fn destination(&self) -> &Path {
        &self.dest
    }

    /// Writes one part at its offset.
    pub async fn write_chunk(
        &self,
        chunk: &ChunkDescriptor,
        data: &[u8],
    ) -> Result<(), TransferError> {
        if chunk.end_exclusive() > self.size {
            return Err(TransferError::OutOfBounds {
                part_number: chunk.part_number,
                end: chunk.end_exclusive(),
                size: self.size,
            });
        }
        if data.len() as u64 != chunk.length {
            return Err(TransferError::ShortRead {
                offset: chunk.offset,
                expected: chunk.length,
                actual: data.len() as u64,
            });
        }

        let mut file = OpenOptions::new().write(true).open(&self.staging).await?;
        file.seek(SeekFrom::Start(chunk.offset)).await?;
        file.write_all(data).await?;
        file.flush().await?;
        Ok(())
    }

    /// Re-reads every planned range and compares it with the recorded tag.
    pub async fn verify(
        &self,
        plan: &[ChunkDescriptor],
        parts: &[PartResult],
    ) -> Result<(), TransferError> {
        let reader = ChunkReader {
            path: self.staging.clone(),
            file_size: self.size,
        };
        for chunk in plan {
            let expected = parts
                .iter()
                .find(|p| p.part_number == chunk.part_number && p.succeeded)
                .ok_or(TransferError::ChecksumMismatch {
                    part_number: chunk.part_number,
                })?;
            let data = reader.read_chunk(chunk).await?;
            if checksum_bytes(&data) != expected.tag {
                return Err(TransferError::ChecksumMismatch {
                    part_number: chunk.part_number,
                });
            }
        }
        Ok(())
    }

    /// Syncs the staging file and renames it onto the destination.
    pub async fn finalize(self) -> Result<PathBuf, TransferError> {
        let file = OpenOptions::new().write(true).open(&self.staging).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&self.staging, &self.dest).await?;
        debug!(path = %self.dest.display(), "download finalized");
        Ok(self.dest)
    }

    /// Removes the staging file. Missing files are not an error.
    pub async fn discard(self) -> Result<(), TransferError> {
        remove_staging(&self.dest).await
    }
}

/// Removes the staging file belonging to `dest`, if any.
pub async fn remove_staging(dest: &Path) -> Result<(), TransferError> {
    match tokio::fs::remove_file(staging_path(dest)).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
