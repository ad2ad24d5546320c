//! Error type shared by the producer, the consumer and the query services.
//!
//! Errors carry a semantic [`ErrorKind`]; mapping a kind to an HTTP status is
//! left to the transport layer.

use crate::db::RepositoryError;
use crate::services::converter::ConvertError;
use crate::services::queue::QueueError;
use crate::services::storage::StorageError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The referenced row or object does not exist (or is not the caller's).
    NotFound,
    /// The request can never succeed as submitted.
    InvalidInput,
    /// A collaborator (database, queue, blob store) could not be reached.
    Unavailable,
    Internal,
}

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("converter error: {0}")]
    Convert(#[from] ConvertError),

    #[error("{0}")]
    InvalidInput(String),

    #[error("conversion task aborted: {0}")]
    Task(String),
}

impl ServiceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ServiceError::Repository(RepositoryError::NoSuchRequest | RepositoryError::NoSuchImage) => {
                ErrorKind::NotFound
            }
            ServiceError::Repository(RepositoryError::Database(_)) => ErrorKind::Unavailable,
            ServiceError::Repository(_) => ErrorKind::Internal,
            ServiceError::Storage(StorageError::NotFound(_)) => ErrorKind::NotFound,
            ServiceError::Storage(StorageError::Config(_)) => ErrorKind::Internal,
            ServiceError::Storage(_) => ErrorKind::Unavailable,
            ServiceError::Queue(QueueError::Redis(_)) => ErrorKind::Unavailable,
            ServiceError::Queue(_) => ErrorKind::Internal,
            ServiceError::Convert(_) | ServiceError::InvalidInput(_) => ErrorKind::InvalidInput,
            ServiceError::Task(_) => ErrorKind::Internal,
        }
    }

    /// Data and codec errors: retrying the same message cannot change the outcome.
    pub fn is_permanent(&self) -> bool {
        matches!(self.kind(), ErrorKind::NotFound | ErrorKind::InvalidInput)
            || matches!(
                self,
                ServiceError::Repository(RepositoryError::InvalidTransition { .. })
            )
    }
}
