//! Offer source error types.

use thiserror::Error;

pub type OfferResult<T> = Result<T, OfferError>;

#[derive(Debug, Error)]
pub enum OfferError {
    #[error("{0} stream already taken")]
    StreamTaken(&'static str),

    #[error("unknown offer: {0}")]
    UnknownOffer(String),

    #[error("offer expired: {0}")]
    OfferExpired(String),

    #[error("offer {offer_id} cannot fit task: {reason}")]
    InsufficientResources { offer_id: String, reason: String },

    #[error("launch rejected: {0}")]
    LaunchRejected(String),

    #[error("unknown task: {0}")]
    UnknownTask(String),
}
