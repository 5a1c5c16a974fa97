//! Engine error types.

use cloudxfer_client::ClientError;
use cloudxfer_protocol::TaskStatus;
use cloudxfer_transfer::TransferError;

/// Errors produced by the scheduler, the state machine and the task store.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("cannot {action} task {id} while it is {status}")]
    InvalidState {
        id: String,
        status: TaskStatus,
        action: &'static str,
    },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("consistency error: {0}")]
    Consistency(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error("transfer error: {0}")]
    Transfer(#[from] TransferError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("worker failed: {0}")]
    Worker(String),
}

impl EngineError {
    /// Returns `true` if this error is the result of a cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, EngineError::Client(ClientError::Cancelled))
    }
}
