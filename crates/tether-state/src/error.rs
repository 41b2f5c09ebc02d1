//! State store errors.

use thiserror::Error;

pub type StateResult<T> = Result<T, StateError>;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open store: {0}")]
    Open(String),

    #[error("store transaction failed: {0}")]
    Transaction(String),

    /// A table could not be opened, read, or written.
    #[error("store I/O failed: {0}")]
    Storage(String),

    #[error("cannot encode {table} document {key:?}: {reason}")]
    Encode {
        table: String,
        key: String,
        reason: String,
    },

    /// A stored document no longer matches its type.
    #[error("corrupt {table} document {key:?}: {reason}")]
    Decode {
        table: String,
        key: String,
        reason: String,
    },
}
