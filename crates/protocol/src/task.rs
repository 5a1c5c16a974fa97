use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{PartResult, TaskStatus, TransferDirection};

/// A single upload or download, as persisted and reported to observers.
///
/// This is also the on-disk record used to resume after a restart, so every
/// field needed to continue a transfer lives here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferTask {
    pub id: String,
    pub direction: TransferDirection,
    pub local_path: PathBuf,
    pub bucket: String,
    pub key: String,
    pub total_size: u64,
    pub chunk_size: u64,
    pub part_concurrency: usize,
    pub status: TaskStatus,
    pub transferred_bytes: u64,
    #[serde(default)]
    pub parts: Vec<PartResult>,
    /// Provider multipart session (upload only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl TransferTask {
    /// Creates a pending task with a fresh id.
    pub fn new(
        direction: TransferDirection,
        local_path: PathBuf,
        bucket: impl Into<String>,
        key: impl Into<String>,
        total_size: u64,
        chunk_size: u64,
        part_concurrency: usize,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            direction,
            local_path,
            bucket: bucket.into(),
            key: key.into(),
            total_size,
            chunk_size,
            part_concurrency,
            status: TaskStatus::Pending,
            transferred_bytes: 0,
            parts: Vec::new(),
            session_id: None,
            error: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// Sets the status and bumps `updated_at` (and `completed_at` for terminal states).
    pub fn set_status(&mut self, status: TaskStatus) {
        let now = Utc::now();
        self.status = status;
        self.updated_at = now;
        self.completed_at = status.is_terminal().then_some(now);
    }

    /// Bytes covered by successfully recorded parts.
    pub fn completed_bytes(&self) -> u64 {
        self.parts
            .iter()
            .filter(|p| p.succeeded)
            .map(|p| p.length)
            .sum()
    }

    /// Returns `true` if `part_number` already has a successful record.
    pub fn has_part(&self, part_number: u32) -> bool {
        self.parts
            .iter()
            .any(|p| p.succeeded && p.part_number == part_number)
    }

    /// Records a finished part and adds its bytes to the running total.
    /// A part number already on record is ignored.
    pub fn record_part(&mut self, part: PartResult) -> bool {
        if self.has_part(part.part_number) {
            return false;
        }
        self.transferred_bytes += part.length;
        self.parts.push(part);
        self.updated_at = Utc::now();
        true
    }

    /// Drops every part record and resets the byte counter.
    pub fn clear_parts(&mut self) {
        self.parts.clear();
        self.transferred_bytes = 0;
        self.updated_at = Utc::now();
    }

    /// Completion ratio in percent (0-100).
    pub fn percentage(&self) -> f64 {
        if self.total_size == 0 {
            return if self.status == TaskStatus::Completed {
                100.0
            } else {
                0.0
            };
        }
        self.transferred_bytes as f64 / self.total_size as f64 * 100.0
    }
}
