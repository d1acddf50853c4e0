//! redfleet-offers — the cluster scheduler as seen by the reconciler.
//!
//! An [`OfferSource`] hands out time-bounded resource offers, accepts
//! task launch and kill requests, and reports task status changes. Both
//! event feeds are bounded, single-consumer streams.
//!
//! [`SimulatedCluster`] is an in-process backend with configurable nodes,
//! used by the daemon and by tests.

pub mod error;
pub mod simulated;
pub mod source;
pub mod stream;
pub mod types;

pub use error::{OfferError, OfferResult};
pub use simulated::SimulatedCluster;
pub use source::{OfferFuture, OfferSource};
pub use stream::{OfferStream, StatusStream};
pub use types::{Offer, StatusUpdate, TaskSpec};
