//! The offer source contract.

use std::future::Future;
use std::pin::Pin;

use redfleet_state::TaskId;

use crate::error::OfferResult;
use crate::stream::{OfferStream, StatusStream};
use crate::types::TaskSpec;

/// Boxed future returned by every [`OfferSource`] operation.
pub type OfferFuture<'a, T> = Pin<Box<dyn Future<Output = OfferResult<T>> + Send + 'a>>;

/// Black-box view of the cluster scheduler.
///
/// `offers` and `status_updates` each hand out their stream once; a
/// second call fails with [`OfferError::StreamTaken`](crate::OfferError::StreamTaken).
pub trait OfferSource: Send + Sync {
    fn offers(&self) -> OfferFuture<'_, OfferStream>;

    fn status_updates(&self) -> OfferFuture<'_, StatusStream>;

    /// Launch one task on the resources of `offer_id`, consuming the offer.
    fn launch_task<'a>(&'a self, offer_id: &'a str, spec: TaskSpec) -> OfferFuture<'a, TaskId>;

    /// Ask the scheduler to kill a task. Completion arrives as a status update.
    fn kill_task<'a>(&'a self, task_id: &'a str) -> OfferFuture<'a, ()>;

    /// Return an unused offer's resources to the scheduler.
    fn decline_offer<'a>(&'a self, offer_id: &'a str) -> OfferFuture<'a, ()>;
}
