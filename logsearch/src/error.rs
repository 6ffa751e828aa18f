use common::StorageError;
use thiserror::Error;

/// Errors surfaced by the search console.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    /// The request was superseded or explicitly cancelled.
    #[error("request cancelled")]
    Cancelled,

    /// The request never produced a response (connection, timeout).
    #[error("transport error: {0}")]
    Transport(String),

    /// The backend answered with a failure.
    #[error("server error ({code}): {message}")]
    Server { code: String, message: String },

    /// The backend answered but the payload could not be decoded.
    #[error("failed to decode response: {0}")]
    Decode(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Decode(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// How an issued fetch ended.
///
/// Cancellation is kept apart from failure: a cancelled fetch leaves state
/// untouched because a newer request already owns the slot, while a failed
/// fetch clears whatever it was meant to populate.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome<T> {
    Ok(T),
    Cancelled,
    Failed(Error),
}

impl<T> FetchOutcome<T> {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, FetchOutcome::Cancelled)
    }
}

impl<T> From<Result<T>> for FetchOutcome<T> {
    fn from(result: Result<T>) -> Self {
        match result {
            Ok(value) => FetchOutcome::Ok(value),
            Err(Error::Cancelled) => FetchOutcome::Cancelled,
            Err(err) => FetchOutcome::Failed(err),
        }
    }
}
