//! Error taxonomy for the relay core.

use thiserror::Error;

/// Errors surfaced by any relay component.
///
/// Each variant corresponds to a failure locus and carries the context a
/// caller needs to decide whether to retry, skip, or escalate.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("outbox store unavailable: {0}")]
    StoreUnavailable(#[source] sqlx::Error),

    #[error("outbox store query timed out after {0:?}")]
    QueryTimeout(std::time::Duration),

    #[error("failed to serialize row {row_id}: {source}")]
    SerializationError {
        row_id: i64,
        #[source]
        source: serde_json::Error,
    },

    #[error("transient publish failure for row {row_id}: {message}")]
    ProduceTransient { row_id: i64, message: String },

    #[error("fatal publish failure for row {row_id}: {message}")]
    ProduceFatal { row_id: i64, message: String },

    #[error("producer channel is full")]
    ChannelFull,

    #[error("row {0} already claimed, skipping")]
    ClaimRejected(i64),

    #[error("cancellation requested")]
    CancelRequested,

    #[error("reaper alert: {0}")]
    ReaperAlert(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<sqlx::Error> for RelayError {
    fn from(e: sqlx::Error) -> Self {
        RelayError::StoreUnavailable(e)
    }
}

pub type RelayResult<T> = Result<T, RelayError>;
