//! Backoff for transient store failures.
//!
//! Store unavailability never fails a reconciliation loop: the loop blocks
//! in [`retry_transient`] until the store answers or shutdown is signalled.

use std::time::Duration;

use tokio::sync::watch;
use tracing::warn;

use crate::error::StateResult;

/// First retry delay.
pub const BACKOFF_BASE: Duration = Duration::from_millis(200);

/// Delay ceiling.
pub const BACKOFF_MAX: Duration = Duration::from_secs(10);

/// Exponential backoff: doubles from `base` up to `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { max, current: base }
    }

    /// Delay to wait now; the following call returns twice as much.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current.min(self.max);
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(BACKOFF_BASE, BACKOFF_MAX)
    }
}

/// Run `f` until it succeeds or fails with a non-transient error.
///
/// Transient errors are logged and retried with [`Backoff::default`].
/// If shutdown is signalled while waiting, the last error is returned.
pub async fn retry_transient<T, F>(
    op: &str,
    shutdown: &watch::Receiver<bool>,
    f: F,
) -> StateResult<T>
where
    F: FnMut() -> StateResult<T>,
{
    retry_with(op, Backoff::default(), shutdown, f).await
}

/// [`retry_transient`] with an explicit backoff schedule.
pub async fn retry_with<T, F>(
    op: &str,
    mut backoff: Backoff,
    shutdown: &watch::Receiver<bool>,
    mut f: F,
) -> StateResult<T>
where
    F: FnMut() -> StateResult<T>,
{
    let mut shutdown = shutdown.clone();
    loop {
        match f() {
            Err(e) if e.is_transient() => {
                if *shutdown.borrow() {
                    return Err(e);
                }
                let delay = backoff.next_delay();
                warn!(op, error = %e, delay_ms = delay.as_millis() as u64, "store unavailable, retrying");
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.changed() => return Err(e),
                }
            }
            other => return other,
        }
    }
}
