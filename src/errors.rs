use std::io;
use std::sync::Arc;

use thiserror::Error;
use tonic::{Code, Status};

pub type RaftResult<T> = Result<T, RaftError>;

pub type TransportResult<T> = Result<T, TransportError>;

#[derive(Error, Debug)]
pub enum RaftError {
    #[error("{0}")]
    ApplicationStartup(String),
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    InternalServerErrorWithContext(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    AnyhowError(#[from] anyhow::Error),
}

/// Failures surfaced by transport operations.
///
/// Cloneable so that one terminating error can resolve every call still
/// pending on a pipeline session.
#[derive(Error, Debug, Clone)]
pub enum TransportError {
    #[error("no connection to peer is available: {0}")]
    PeerUnavailable(String),
    #[error("operation cancelled")]
    Cancelled,
    /// Failure reported by the peer's consensus engine, carried verbatim.
    #[error("{0}")]
    Remote(String),
    #[error(transparent)]
    Transport(Status),
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("reading snapshot data failed: {0}")]
    SnapshotSource(Arc<io::Error>),
}

impl TransportError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TransportError::Cancelled)
    }
}

impl From<io::Error> for TransportError {
    fn from(err: io::Error) -> Self {
        TransportError::SnapshotSource(Arc::new(err))
    }
}

// ABORTED is reserved for engine-reported failures, see `From<TransportError> for Status`.
impl From<Status> for TransportError {
    fn from(status: Status) -> Self {
        match status.code() {
            Code::Aborted => TransportError::Remote(status.message().to_string()),
            _ => TransportError::Transport(status),
        }
    }
}

impl From<TransportError> for Status {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::PeerUnavailable(peer) => {
                Status::unavailable(format!("no connection to peer is available: {peer}"))
            }
            TransportError::Cancelled => Status::cancelled("operation cancelled"),
            TransportError::Remote(message) => Status::aborted(message),
            TransportError::Transport(status) => status,
            TransportError::ProtocolViolation(detail) => Status::invalid_argument(detail),
            TransportError::SnapshotSource(err) => Status::data_loss(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_remote_error_survives_the_wire() {
        let status = Status::from(TransportError::Remote("log mismatch at 7".to_string()));
        assert_eq!(status.code(), Code::Aborted);
        match TransportError::from(status) {
            TransportError::Remote(message) => assert_eq!(message, "log mismatch at 7"),
            other => panic!("Unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_other_statuses_are_transport_failures() {
        let err = TransportError::from(Status::unavailable("connection refused"));
        match err {
            TransportError::Transport(status) => {
                assert_eq!(status.code(), Code::Unavailable);
                assert_eq!(status.message(), "connection refused");
            }
            other => panic!("Unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_cancelled_round_trips() {
        let status = Status::from(TransportError::Cancelled);
        assert_eq!(status.code(), Code::Cancelled);
        assert!(TransportError::Cancelled.is_cancelled());
        assert!(!TransportError::Remote("x".to_string()).is_cancelled());
    }
}
