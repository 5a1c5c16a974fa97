//! One planned part, one HTTP round trip, bounded retry.

use std::future::Future;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use cloudxfer_protocol::{ChunkDescriptor, PartResult};
use cloudxfer_transfer::{checksum_bytes, md5_hex};

use crate::{ClientError, ObjectClient, RetryPolicy};

/// Transfers single parts on behalf of the state machine.
///
/// Every attempt rebuilds and re-signs its request, so a retry after a long
/// backoff never carries a stale timestamp. Only transport errors are
/// retried; protocol and consistency errors fail the part immediately.
#[derive(Clone)]
pub struct PartExecutor {
    client: Arc<ObjectClient>,
    retry: RetryPolicy,
}

impl PartExecutor {
    pub fn new(client: Arc<ObjectClient>, retry: RetryPolicy) -> Self {
        Self { client, retry }
    }

    pub fn client(&self) -> &Arc<ObjectClient> {
        &self.client
    }

    /// Uploads one part of a multipart session.
    ///
    /// A 2xx response without an ETag still succeeds, tagged with the local
    /// MD5 and flagged `degraded`.
    pub async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        chunk: &ChunkDescriptor,
        body: Vec<u8>,
        cancel: &CancellationToken,
    ) -> Result<PartResult, ClientError> {
        if body.len() as u64 != chunk.length {
            return Err(ClientError::Consistency(format!(
                "part {} body is {} bytes, planned {}",
                chunk.part_number,
                body.len(),
                chunk.length
            )));
        }

        let etag = self
            .with_retry(chunk.part_number, cancel, || {
                self.client
                    .upload_part(bucket, key, upload_id, chunk.part_number, body.clone())
            })
            .await?;

        let (tag, degraded) = match etag {
            Some(tag) => (tag, false),
            None => {
                warn!(
                    part = chunk.part_number,
                    key, "provider returned no ETag, using local MD5"
                );
                (format!("\"{}\"", md5_hex(&body)), true)
            }
        };
        debug!(part = chunk.part_number, bytes = chunk.length, "part uploaded");

        Ok(PartResult {
            part_number: chunk.part_number,
            tag,
            length: chunk.length,
            succeeded: true,
            degraded,
        })
    }

    /// Downloads one part with a ranged GET.
    ///
    /// Succeeds only on `206 Partial Content` with exactly `chunk.length`
    /// bytes; the returned tag is the SHA-256 of those bytes.
    pub async fn download_part(
        &self,
        bucket: &str,
        key: &str,
        chunk: &ChunkDescriptor,
        cancel: &CancellationToken,
    ) -> Result<(PartResult, Vec<u8>), ClientError> {
        let resp = self
            .with_retry(chunk.part_number, cancel, || {
                self.client
                    .get_range(bucket, key, chunk.offset, chunk.end_inclusive())
            })
            .await?;

        if resp.status != 206 {
            return Err(ClientError::Consistency(format!(
                "part {}: expected 206 Partial Content, got {}",
                chunk.part_number, resp.status
            )));
        }
        if resp.body.len() as u64 != chunk.length {
            return Err(ClientError::Consistency(format!(
                "part {}: received {} bytes, expected {}",
                chunk.part_number,
                resp.body.len(),
                chunk.length
            )));
        }
        debug!(part = chunk.part_number, bytes = chunk.length, "part downloaded");

        let part = PartResult {
            part_number: chunk.part_number,
            tag: checksum_bytes(&resp.body),
            length: chunk.length,
            succeeded: true,
            degraded: false,
        };
        Ok((part, resp.body))
    }

    /// Runs `op` until it succeeds, fails with a non-retryable error, runs
    /// out of attempts, or `cancel` fires.
    async fn with_retry<T, F, Fut>(
        &self,
        part_number: u32,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<T, ClientError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ClientError>>,
    {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            if cancel.is_cancelled() {
                return Err(ClientError::Cancelled);
            }

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ClientError::Cancelled),
                r = op() => r,
            };

            match result {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    let delay = self.retry.delay_for_attempt(attempt);
                    warn!(
                        part = part_number,
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "part attempt failed, retrying"
                    );
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(ClientError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
