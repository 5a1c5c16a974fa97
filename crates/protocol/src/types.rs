use std::fmt;

use serde::{Deserialize, Serialize};

/// Storage provider, which also selects the request-signing scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// Amazon S3 and S3-compatible services (AWS Signature V4).
    S3,
    /// Alibaba Cloud OSS (OSS Signature V4).
    Oss,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::S3 => "s3",
            ProviderKind::Oss => "oss",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Access credential for one provider account.
///
/// Deliberately not `Serialize`: the engine never writes credentials to disk.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub provider: ProviderKind,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub region: String,
}

impl Credential {
    pub fn new(
        provider: ProviderKind,
        access_key_id: impl Into<String>,
        secret_access_key: impl Into<String>,
        region: impl Into<String>,
    ) -> Self {
        Self {
            provider,
            access_key_id: access_key_id.into(),
            secret_access_key: secret_access_key.into(),
            region: region.into(),
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("provider", &self.provider)
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("region", &self.region)
            .finish()
    }
}

/// One addressable byte range of an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkDescriptor {
    /// 1-based, contiguous part number.
    pub part_number: u32,
    /// Byte offset within the object.
    pub offset: u64,
    /// Length of this part in bytes.
    pub length: u64,
}

impl ChunkDescriptor {
    /// Offset of the last byte, as used by `Range: bytes=start-end`.
    ///
    /// Only meaningful for non-empty chunks.
    pub fn end_inclusive(&self) -> u64 {
        self.offset + self.length.saturating_sub(1)
    }

    /// Offset one past the last byte.
    pub fn end_exclusive(&self) -> u64 {
        self.offset + self.length
    }
}

/// Outcome of transferring one part.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartResult {
    pub part_number: u32,
    /// Provider ETag for uploads, local SHA-256 hex for downloads.
    pub tag: String,
    pub length: u64,
    pub succeeded: bool,
    /// Set when the provider returned no ETag and the tag was derived locally.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub degraded: bool,
}

/// Which way bytes flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferDirection {
    Upload,
    Download,
}

/// Lifecycle status of a transfer task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Returns `true` for states a task never leaves on its own.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Paused => "paused",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}
