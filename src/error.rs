use thiserror::Error;

use crate::types::ItemType;

/// Failure taxonomy for the clustering and publish-scheduling core.
///
/// Transient send failures drive the bounded retry loop in the delivery
/// worker; everything else is recorded on the affected row and surfaced
/// through persisted state rather than bubbled up a call stack.
#[derive(Debug, Error)]
pub enum Error {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("transient send failure: {0}")]
    TransientSend(String),

    #[error("permanent send failure: {0}")]
    PermanentSend(String),

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("{item_type} #{item_id} has not been published yet")]
    NotYetPublished { item_type: ItemType, item_id: i64 },
}

impl Error {
    /// True when the failure is worth another delivery attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::TransientSend(_))
    }
}
