use serde::{Deserialize, Serialize};

use crate::types::TaskStatus;

/// Notification delivered to the presentation layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransferEvent {
    /// Throttled byte progress. `transferred_bytes` never decreases per task.
    Progress {
        task_id: String,
        transferred_bytes: u64,
        total_bytes: u64,
        bytes_per_second: f64,
    },
    /// Status transition, with the failure detail for `Failed`.
    Status {
        task_id: String,
        status: TaskStatus,
        error: Option<String>,
    },
}

impl TransferEvent {
    pub fn task_id(&self) -> &str {
        match self {
            TransferEvent::Progress { task_id, .. } | TransferEvent::Status { task_id, .. } => {
                task_id
            }
        }
    }
}
