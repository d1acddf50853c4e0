//! redfleet-reconciler — converges running Redis tasks on desired state.
//!
//! Three loops cooperate through the state store only:
//!
//! ```text
//! Gateway ──writes──▶ spec / status / queue
//!                        │
//!   Creator   ◀── offers ┤  pending queue → launched tasks (Pending → Starting)
//!   Maintainer◀── status ┤  task status → Running, slave replacement, failure
//!   Destroyer            ┘  DeleteRequested → kills → records removed
//! ```
//!
//! No loop holds state another loop reads; every write is a
//! compare-and-swap against the version it was read at.

pub mod creator;
pub mod destroyer;
pub mod error;
pub mod gateway;
pub mod maintainer;
pub mod matcher;

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use redfleet_core::ReconcilerConfig;
use redfleet_offers::OfferSource;
use redfleet_state::StateStore;

pub use creator::{Creator, DeclineReason, OfferOutcome};
pub use destroyer::{DestroyOutcome, Destroyer};
pub use error::{GatewayError, GatewayResult, ReconcileError, ReconcileResult};
pub use gateway::{CreateRequest, Gateway, InstanceView};
pub use maintainer::{Maintainer, UpdateOutcome};
pub use matcher::{PendingTask, Requirement, first_fit};

/// Handles of the three running loops.
pub struct LoopHandles {
    pub creator: JoinHandle<ReconcileResult<()>>,
    pub maintainer: JoinHandle<ReconcileResult<()>>,
    pub destroyer: JoinHandle<ReconcileResult<()>>,
}

impl LoopHandles {
    /// Wait for all loops to stop, logging how each one ended.
    pub async fn join(self) {
        for (name, handle) in [
            ("create", self.creator),
            ("maintain", self.maintainer),
            ("destroy", self.destroyer),
        ] {
            match handle.await {
                Ok(Ok(())) => debug!(loop_name = name, "loop exited"),
                Ok(Err(e)) => error!(loop_name = name, error = %e, "loop failed"),
                Err(e) => error!(loop_name = name, error = %e, "loop panicked"),
            }
        }
    }
}

/// Spawn the create, maintain and destroy loops.
///
/// Each loop stops at its next iteration boundary once `shutdown` flips to
/// `true`.
pub fn spawn_loops(
    store: StateStore,
    source: Arc<dyn OfferSource>,
    config: ReconcilerConfig,
    shutdown: watch::Receiver<bool>,
) -> LoopHandles {
    let creator = Creator::new(
        store.clone(),
        source.clone(),
        config.clone(),
        shutdown.clone(),
    );
    let maintainer = Maintainer::new(
        store.clone(),
        source.clone(),
        config.clone(),
        shutdown.clone(),
    );
    let destroyer = Destroyer::new(store, source, config, shutdown);

    LoopHandles {
        creator: tokio::spawn(creator.run()),
        maintainer: tokio::spawn(maintainer.run()),
        destroyer: tokio::spawn(destroyer.run()),
    }
}
