use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::media::MediaError;
use crate::negotiate::NegotiationError;
use crate::supervisor::{Event, Generation};

/// Transports report into the runtime's single event queue.
pub(crate) type EventTx = mpsc::UnboundedSender<Event>;

#[derive(Debug, thiserror::Error)]
pub(crate) enum SendError {
    #[error("signaling channel is not open")]
    NotOpen,
    #[error("signaling channel is closed")]
    Closed,
}

/// Control-message channel of one session.
#[async_trait]
pub(crate) trait SignalingLink: Send + Sync {
    /// Queue a text frame. Never panics on a dead channel.
    fn send(&self, text: &str) -> Result<(), SendError>;

    /// Close the channel and wait until its connection task has exited.
    /// Safe to call more than once.
    async fn close(&self);
}

/// Media channel of one session.
#[async_trait]
pub(crate) trait MediaLink: Send + Sync {
    /// Offer, exchange with the controller, and return the rewritten answer.
    async fn negotiate(&self) -> Result<String, NegotiationError>;

    async fn apply_answer(&self, sdp: String) -> Result<(), MediaError>;

    /// Stop feeding playback surfaces.
    async fn pause(&self);

    /// Safe to call when already closed or never fully opened.
    async fn close(&self);
}

/// Opens the transports of a new session.
#[async_trait]
pub(crate) trait Connector: Send + Sync {
    /// Start connecting. Success and failure arrive later as
    /// [`Event::SignalingOpened`] and [`Event::SignalingFailed`].
    fn open_signaling(&self, generation: Generation, events: EventTx) -> Arc<dyn SignalingLink>;

    async fn open_media(
        &self,
        generation: Generation,
        events: EventTx,
    ) -> Result<Arc<dyn MediaLink>, MediaError>;
}
