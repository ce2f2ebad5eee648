//! Error types for txflow.

use crate::model::{Status, WorkId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("work item not found: {0}")]
    NotFound(WorkId),

    /// The item was not `Pending` when dispatch was attempted. Not a fault.
    #[error("work item {0} is not available")]
    NotAvailable(WorkId),

    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: Status, to: Status },

    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("channel error: {0}")]
    Channel(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether this is the expected "someone else already claimed it" outcome
    /// rather than a fault.
    pub fn is_not_available(&self) -> bool {
        matches!(self, Error::NotAvailable(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
