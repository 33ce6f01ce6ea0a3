use std::sync::Arc;

use async_trait::async_trait;

use crate::media::{MediaConfig, MediaError, PeerMedia};
use crate::negotiate::NegotiationClient;
use crate::signaling;
use crate::supervisor::Generation;
use crate::transport::{Connector, EventTx, MediaLink, SignalingLink};

/// Opens real WebSocket and WebRTC transports against the controller.
pub(crate) struct LiveConnector {
    signaling_url: String,
    tls_cert_path: Option<String>,
    negotiation: Arc<NegotiationClient>,
    media: MediaConfig,
}

impl LiveConnector {
    pub(crate) fn new(
        signaling_url: String,
        tls_cert_path: Option<String>,
        negotiation: NegotiationClient,
        media: MediaConfig,
    ) -> Self {
        Self {
            signaling_url,
            tls_cert_path,
            negotiation: Arc::new(negotiation),
            media,
        }
    }
}

#[async_trait]
impl Connector for LiveConnector {
    fn open_signaling(&self, generation: Generation, events: EventTx) -> Arc<dyn SignalingLink> {
        Arc::new(signaling::open(
            self.signaling_url.clone(),
            self.tls_cert_path.clone(),
            generation,
            events,
        ))
    }

    async fn open_media(
        &self,
        generation: Generation,
        events: EventTx,
    ) -> Result<Arc<dyn MediaLink>, MediaError> {
        let media =
            PeerMedia::new(generation, &self.media, Arc::clone(&self.negotiation), events).await?;
        Ok(Arc::new(media))
    }
}
