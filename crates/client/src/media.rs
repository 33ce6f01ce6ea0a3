use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::track::track_remote::TrackRemote;

use crate::negotiate::{NegotiationClient, NegotiationError};
use crate::playback::{PlaybackSurface, fan_out};
use crate::supervisor::{Event, Generation};
use crate::transport::{EventTx, MediaLink};

#[derive(Debug, thiserror::Error)]
pub(crate) enum MediaError {
    #[error("peer connection setup failed: {0}")]
    Setup(#[from] webrtc::Error),
    #[error("failed to apply answer: {0}")]
    Answer(webrtc::Error),
    #[error("peer connection is closed")]
    Closed,
}

/// Parameters shared by every media session.
#[derive(Clone)]
pub(crate) struct MediaConfig {
    pub stun_urls: Vec<String>,
    pub negotiation_timeout: Duration,
    pub track_attach_delay: Duration,
    pub surfaces: Arc<Vec<Arc<dyn PlaybackSurface>>>,
}

/// The media half of a session: one peer connection with a single
/// bidirectional video transceiver.
pub(crate) struct PeerMedia {
    generation: Generation,
    peer_connection: Arc<RTCPeerConnection>,
    negotiation: Arc<NegotiationClient>,
    surfaces: Arc<Vec<Arc<dyn PlaybackSurface>>>,
    paused: Arc<AtomicBool>,
    closed: AtomicBool,
    negotiation_timeout: Duration,
}

impl PeerMedia {
    pub(crate) async fn new(
        generation: Generation,
        config: &MediaConfig,
        negotiation: Arc<NegotiationClient>,
        events: EventTx,
    ) -> Result<Self, MediaError> {
        let mut media_engine = MediaEngine::default();
        // The controller picks the codec; offer everything the library knows.
        media_engine.register_default_codecs()?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers = if config.stun_urls.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: config.stun_urls.clone(),
                ..Default::default()
            }]
        };
        let rtc_config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };

        let peer_connection = Arc::new(api.new_peer_connection(rtc_config).await?);
        let paused = Arc::new(AtomicBool::new(false));

        // Handlers go in before the transceiver so its negotiation-needed
        // signal is not lost.
        let negotiate_tx = events.clone();
        peer_connection.on_negotiation_needed(Box::new(move || {
            debug!(generation, "Negotiation needed");
            let _ = negotiate_tx.send(Event::NegotiationNeeded { generation });
            Box::pin(async {})
        }));

        let surfaces = Arc::clone(&config.surfaces);
        let track_paused = Arc::clone(&paused);
        let attach_delay = config.track_attach_delay;
        peer_connection.on_track(Box::new(move |track, _receiver, _transceiver| {
            attach_track(
                generation,
                track,
                Arc::clone(&surfaces),
                Arc::clone(&track_paused),
                attach_delay,
            );
            Box::pin(async {})
        }));

        let state_tx = events;
        peer_connection.on_peer_connection_state_change(Box::new(move |state| {
            match state {
                RTCPeerConnectionState::Failed => {
                    warn!(generation, "Peer connection failed");
                    let _ = state_tx.send(Event::MediaFailed {
                        generation,
                        reason: "peer connection failed".to_string(),
                    });
                }
                RTCPeerConnectionState::Disconnected => {
                    warn!(generation, "Peer connection disconnected (ICE reconnecting)");
                }
                _ => {
                    info!(generation, ?state, "Peer connection state changed");
                }
            }
            Box::pin(async {})
        }));

        peer_connection
            .add_transceiver_from_kind(
                RTPCodecType::Video,
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Sendrecv,
                    send_encodings: vec![],
                }),
            )
            .await?;

        info!(generation, "Peer connection created");

        Ok(Self {
            generation,
            peer_connection,
            negotiation,
            surfaces: Arc::clone(&config.surfaces),
            paused,
            closed: AtomicBool::new(false),
            negotiation_timeout: config.negotiation_timeout,
        })
    }

    async fn offer_and_exchange(&self) -> Result<String, NegotiationError> {
        let offer = self.peer_connection.create_offer(None).await?;

        // The exchange is a single HTTP round trip, so the offer has to carry
        // every local candidate.
        let mut gathering_complete = self.peer_connection.gathering_complete_promise().await;
        self.peer_connection.set_local_description(offer).await?;
        let _ = gathering_complete.recv().await;

        let local = self
            .peer_connection
            .local_description()
            .await
            .ok_or(NegotiationError::NoLocalDescription)?;

        debug!(generation = self.generation, "Local offer ready");
        self.negotiation.exchange(&local.sdp).await
    }
}

#[async_trait]
impl MediaLink for PeerMedia {
    async fn negotiate(&self) -> Result<String, NegotiationError> {
        tokio::time::timeout(self.negotiation_timeout, self.offer_and_exchange())
            .await
            .map_err(|_| NegotiationError::Timeout(self.negotiation_timeout))?
    }

    async fn apply_answer(&self, sdp: String) -> Result<(), MediaError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(MediaError::Closed);
        }
        debug!(generation = self.generation, sdp, "Applying answer");
        let answer = RTCSessionDescription::answer(sdp).map_err(MediaError::Answer)?;
        self.peer_connection
            .set_remote_description(answer)
            .await
            .map_err(MediaError::Answer)?;
        info!(generation = self.generation, "Remote description applied");
        Ok(())
    }

    async fn pause(&self) {
        self.paused.store(true, Ordering::Relaxed);
        for surface in self.surfaces.iter() {
            surface.pause();
        }
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(e) = self.peer_connection.close().await {
            warn!(generation = self.generation, "Failed to close peer connection: {e}");
        }
        info!(generation = self.generation, "Peer connection closed");
    }
}

/// Feed the incoming track to every surface until the track ends.
fn attach_track(
    generation: Generation,
    track: Arc<TrackRemote>,
    surfaces: Arc<Vec<Arc<dyn PlaybackSurface>>>,
    paused: Arc<AtomicBool>,
    delay: Duration,
) {
    tokio::spawn(async move {
        info!(
            generation,
            kind = %track.kind(),
            ssrc = track.ssrc(),
            "Remote track received"
        );
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if paused.load(Ordering::Relaxed) {
            return;
        }
        for surface in surfaces.iter() {
            surface.resume();
            debug!(generation, surface = surface.name(), "Track attached");
        }

        while let Ok((packet, _)) = track.read_rtp().await {
            if paused.load(Ordering::Relaxed) {
                break;
            }
            fan_out(&surfaces, &packet);
        }
        debug!(generation, "Remote track ended");
    });
}
