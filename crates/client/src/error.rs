//! Client error taxonomy.

use crate::transport::TransportError;

/// Errors produced by wire operations and part transfers.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Network-level failure; the only kind that is retried.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// The provider answered with an error document.
    #[error("provider error {status} {code}: {message} (request id {request_id})")]
    Protocol {
        status: u16,
        code: String,
        message: String,
        request_id: String,
    },

    /// The response was well-formed but does not add up.
    #[error("consistency error: {0}")]
    Consistency(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("signing error: {0}")]
    Sign(#[from] cloudxfer_signing::SignError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cancelled")]
    Cancelled,
}

impl ClientError {
    /// Returns `true` if another attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ClientError::Transport(_))
    }

    /// Provider error code, if this is a protocol error.
    pub fn code(&self) -> Option<&str> {
        match self {
            ClientError::Protocol { code, .. } => Some(code),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transport_errors_retry() {
        assert!(ClientError::Transport(TransportError::Timeout("slow".into())).is_retryable());
        assert!(!ClientError::Consistency("gap".into()).is_retryable());
        assert!(!ClientError::Cancelled.is_retryable());
        let protocol = ClientError::Protocol {
            status: 503,
            code: "SlowDown".into(),
            message: "reduce rate".into(),
            request_id: "r1".into(),
        };
        assert!(!protocol.is_retryable());
        assert_eq!(protocol.code(), Some("SlowDown"));
    }

    #[test]
    fn display_carries_details() {
        let err = ClientError::Protocol {
            status: 403,
            code: "SignatureDoesNotMatch".into(),
            message: "bad sig".into(),
            request_id: "abc".into(),
        };
        let s = err.to_string();
        assert!(s.contains("403"));
        assert!(s.contains("SignatureDoesNotMatch"));
        assert!(s.contains("abc"));
    }
}
