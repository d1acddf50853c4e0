//! Reconciler and gateway error types.

use thiserror::Error;

use redfleet_offers::OfferError;
use redfleet_state::StateError;

/// Errors that end a reconciliation step.
///
/// Per-instance failures are absorbed by the loops; these reach the caller
/// of a step only when the store or the offer source itself failed.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("state store error: {0}")]
    State(#[from] StateError),

    #[error("offer source error: {0}")]
    Offer(#[from] OfferError),
}

pub type ReconcileResult<T> = Result<T, ReconcileError>;

/// Errors returned to gateway callers.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("instance already exists: {0}")]
    AlreadyExists(String),

    #[error("instance not found: {0}")]
    NotFound(String),

    #[error("state store error: {0}")]
    State(#[from] StateError),
}

impl GatewayError {
    /// Whether the request may succeed if retried later.
    pub fn is_transient(&self) -> bool {
        match self {
            GatewayError::State(e) => e.is_transient() || e.is_conflict(),
            _ => false,
        }
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;
