use thiserror::Error;

/// Errors returned synchronously by the queue-management API.
///
/// Per-packet failures never appear here; they are reported through
/// [`QueueCallbacks::on_event`](crate::queue::QueueCallbacks::on_event).
#[derive(Debug, Error)]
pub enum ReceiverError {
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("queue name {0:?} already registered")]
    DuplicateName(String),

    #[error("{what} limit of {limit} reached")]
    CapacityExceeded { what: &'static str, limit: usize },

    #[error("invalid or closed queue handle")]
    InvalidHandle,

    #[error("receiver is stopped")]
    Stopped,

    #[error("threads did not exit in time: {}", .0.join(", "))]
    Unresponsive(Vec<String>),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ReceiverError>;
