//! Single-consumer event streams.
//!
//! Thin wrappers over bounded `mpsc` receivers. The consumer never holds
//! more than [`STREAM_CAPACITY`] items; producers that must not block
//! keep their own overflow.

use tokio::sync::mpsc;

use crate::types::{Offer, StatusUpdate};

/// Channel capacity for both streams.
pub const STREAM_CAPACITY: usize = 64;

/// Lazy, infinite sequence of offers. Not restartable.
#[derive(Debug)]
pub struct OfferStream {
    rx: mpsc::Receiver<Offer>,
}

impl OfferStream {
    pub fn new(rx: mpsc::Receiver<Offer>) -> Self {
        Self { rx }
    }

    /// Wait for the next offer. `None` once the source has shut down.
    pub async fn next(&mut self) -> Option<Offer> {
        self.rx.recv().await
    }

    /// Next offer if one is already buffered.
    pub fn try_next(&mut self) -> Option<Offer> {
        self.rx.try_recv().ok()
    }
}

/// Lazy, infinite sequence of task status updates. Not restartable.
#[derive(Debug)]
pub struct StatusStream {
    rx: mpsc::Receiver<StatusUpdate>,
}

impl StatusStream {
    pub fn new(rx: mpsc::Receiver<StatusUpdate>) -> Self {
        Self { rx }
    }

    pub async fn next(&mut self) -> Option<StatusUpdate> {
        self.rx.recv().await
    }

    pub fn try_next(&mut self) -> Option<StatusUpdate> {
        self.rx.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use redfleet_state::TaskStatus;

    #[tokio::test]
    async fn stream_ends_when_producer_drops() {
        let (tx, rx) = mpsc::channel(STREAM_CAPACITY);
        let mut stream = StatusStream::new(rx);
        tx.send(StatusUpdate::new("t-1", TaskStatus::Running))
            .await
            .unwrap();
        drop(tx);

        assert_eq!(stream.next().await.unwrap().task_id, "t-1");
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn bounded_channel_applies_backpressure() {
        let (tx, rx) = mpsc::channel(1);
        let mut stream = StatusStream::new(rx);
        tx.try_send(StatusUpdate::new("t-1", TaskStatus::Staging))
            .unwrap();
        assert!(
            tx.try_send(StatusUpdate::new("t-2", TaskStatus::Staging))
                .is_err()
        );
        assert!(stream.try_next().is_some());
        assert!(stream.try_next().is_none());
    }
}
