//! Error types for streamgate
//!
//! Defines the coordinator error taxonomy and its mapping to Kafka protocol
//! error codes so responses stay compatible with stock Kafka clients.

use thiserror::Error;

use crate::bus::BusError;

/// Result type alias for coordinator operations
pub type Result<T> = std::result::Result<T, CoordinatorError>;

/// Wire-visible Kafka error codes produced by the coordinator paths.
///
/// See: <https://kafka.apache.org/protocol.html#protocol_error_codes>
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i16)]
pub enum ErrorCode {
    /// No error
    None = 0,
    /// Unknown server error
    UnknownServerError = -1,
    /// Request timed out
    RequestTimedOut = 7,
    /// Offset metadata string too large
    OffsetMetadataTooLarge = 12,
    /// Coordinator is loading the partition for this id
    CoordinatorLoadInProgress = 14,
    /// Coordinator unavailable, client should retry
    CoordinatorNotAvailable = 15,
    /// This broker is not the coordinator for the id
    NotCoordinator = 16,
    /// Invalid transaction timeout
    InvalidTransactionTimeout = 50,
    /// Another transaction operation for the id is in progress
    ConcurrentTransactions = 51,
    /// Illegal transaction state transition
    InvalidTxnState = 48,
}

impl ErrorCode {
    pub fn as_i16(self) -> i16 {
        self as i16
    }

    /// Whether a client is expected to retry after seeing this code.
    pub fn is_retriable(self) -> bool {
        matches!(
            self,
            ErrorCode::CoordinatorLoadInProgress
                | ErrorCode::CoordinatorNotAvailable
                | ErrorCode::NotCoordinator
                | ErrorCode::ConcurrentTransactions
                | ErrorCode::RequestTimedOut
        )
    }
}

/// Errors surfaced by the coordinator metadata managers.
///
/// The first five variants are the wire-visible taxonomy; the rest are
/// internal conditions that map onto `UnknownServerError` at the boundary.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CoordinatorError {
    #[error("this broker is not the coordinator for the requested id")]
    NotCoordinator,

    #[error("coordinator is not available, retry later")]
    CoordinatorNotAvailable,

    #[error("the coordinator is loading the transaction partition")]
    ConcurrentTransactions,

    #[error("the coordinator is loading the group partition")]
    CoordinatorLoadInProgress,

    #[error("unknown server error: {0}")]
    UnknownServerError(String),

    #[error("offset metadata exceeds the configured maximum size")]
    OffsetMetadataTooLarge,

    #[error("invalid transaction timeout: {0} ms")]
    InvalidTransactionTimeout(i32),

    #[error("invalid transaction state transition: {0}")]
    InvalidTxnState(String),

    #[error("corrupted record: {0}")]
    CorruptRecord(String),

    #[error("bus error: {0}")]
    Bus(#[from] BusError),
}

impl CoordinatorError {
    /// Translate a failed log append into the coordinator error the client
    /// sees. Transient transport conditions become `CoordinatorNotAvailable`
    /// so the client retries; a storage fault means the partition may have
    /// moved, so the client re-discovers the coordinator.
    pub fn from_append_error(error: &BusError) -> CoordinatorError {
        match error {
            BusError::UnknownTopicOrPartition(_)
            | BusError::NotEnoughReplicas
            | BusError::OperationTimedOut => CoordinatorError::CoordinatorNotAvailable,
            BusError::Storage(_) => CoordinatorError::NotCoordinator,
            BusError::MessageTooLarge { .. } | BusError::RecordListTooLarge => {
                CoordinatorError::UnknownServerError(error.to_string())
            }
            BusError::Transport(_) => CoordinatorError::UnknownServerError(error.to_string()),
        }
    }

    /// Map this error onto its wire-level Kafka error code.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            CoordinatorError::NotCoordinator => ErrorCode::NotCoordinator,
            CoordinatorError::CoordinatorNotAvailable => ErrorCode::CoordinatorNotAvailable,
            CoordinatorError::ConcurrentTransactions => ErrorCode::ConcurrentTransactions,
            CoordinatorError::CoordinatorLoadInProgress => ErrorCode::CoordinatorLoadInProgress,
            CoordinatorError::OffsetMetadataTooLarge => ErrorCode::OffsetMetadataTooLarge,
            CoordinatorError::InvalidTransactionTimeout(_) => ErrorCode::InvalidTransactionTimeout,
            CoordinatorError::InvalidTxnState(_) => ErrorCode::InvalidTxnState,
            CoordinatorError::UnknownServerError(_)
            | CoordinatorError::CorruptRecord(_)
            | CoordinatorError::Bus(_) => ErrorCode::UnknownServerError,
        }
    }

    pub fn is_retriable(&self) -> bool {
        self.error_code().is_retriable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_code_mapping() {
        assert_eq!(
            CoordinatorError::NotCoordinator.error_code(),
            ErrorCode::NotCoordinator
        );
        assert_eq!(
            CoordinatorError::CoordinatorNotAvailable.error_code(),
            ErrorCode::CoordinatorNotAvailable
        );
        assert_eq!(
            CoordinatorError::ConcurrentTransactions.error_code(),
            ErrorCode::ConcurrentTransactions
        );
        assert_eq!(
            CoordinatorError::CorruptRecord("bad key".into()).error_code(),
            ErrorCode::UnknownServerError
        );
    }

    #[test]
    fn error_code_as_i16() {
        assert_eq!(ErrorCode::None.as_i16(), 0);
        assert_eq!(ErrorCode::UnknownServerError.as_i16(), -1);
        assert_eq!(ErrorCode::NotCoordinator.as_i16(), 16);
        assert_eq!(ErrorCode::ConcurrentTransactions.as_i16(), 51);
    }

    #[test]
    fn append_error_translation_table() {
        assert_eq!(
            CoordinatorError::from_append_error(&BusError::UnknownTopicOrPartition("t".into())),
            CoordinatorError::CoordinatorNotAvailable
        );
        assert_eq!(
            CoordinatorError::from_append_error(&BusError::NotEnoughReplicas),
            CoordinatorError::CoordinatorNotAvailable
        );
        assert_eq!(
            CoordinatorError::from_append_error(&BusError::OperationTimedOut),
            CoordinatorError::CoordinatorNotAvailable
        );
        assert_eq!(
            CoordinatorError::from_append_error(&BusError::Storage("disk".into())),
            CoordinatorError::NotCoordinator
        );
        assert!(matches!(
            CoordinatorError::from_append_error(&BusError::MessageTooLarge { size: 1 << 21 }),
            CoordinatorError::UnknownServerError(_)
        ));
        assert!(matches!(
            CoordinatorError::from_append_error(&BusError::RecordListTooLarge),
            CoordinatorError::UnknownServerError(_)
        ));
        assert!(matches!(
            CoordinatorError::from_append_error(&BusError::Transport("reset".into())),
            CoordinatorError::UnknownServerError(_)
        ));
    }

    #[test]
    fn retriable_codes() {
        assert!(ErrorCode::CoordinatorNotAvailable.is_retriable());
        assert!(ErrorCode::ConcurrentTransactions.is_retriable());
        assert!(!ErrorCode::UnknownServerError.is_retriable());
        assert!(!ErrorCode::InvalidTxnState.is_retriable());
    }
}
