//! Executes the supervisor's effects.
//!
//! One task owns the [`Supervisor`] and drains a single event queue. Transports,
//! timers and spawned negotiation work only ever talk back through that queue.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use driveway_protocol::{Actuator, OutboundFrame, TimingConfig};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::activity::Activity;
use crate::supervisor::{Delivery, Effect, Event, Generation, Status, Supervisor};
use crate::timers::TimerKind;
use crate::transport::{Connector, EventTx, MediaLink, SignalingLink};

/// Transports of the current session.
struct Transports {
    generation: Generation,
    signaling: Arc<dyn SignalingLink>,
    media: Option<Arc<dyn MediaLink>>,
}

pub(crate) struct Runtime {
    supervisor: Supervisor,
    connector: Arc<dyn Connector>,
    events_tx: EventTx,
    events_rx: mpsc::UnboundedReceiver<Event>,
    timers: BTreeMap<TimerKind, JoinHandle<()>>,
    session: Option<Transports>,
    status_tx: watch::Sender<Status>,
}

/// Cloneable front door for the user-facing side of the client.
#[derive(Clone)]
pub(crate) struct RuntimeHandle {
    events: EventTx,
    status: watch::Receiver<Status>,
}

impl RuntimeHandle {
    pub(crate) fn trigger(&self, actuator: Actuator) {
        self.dispatch(Event::Trigger(actuator));
    }

    pub(crate) fn blur(&self) {
        self.dispatch(Event::Activity(Activity::Blur));
    }

    pub(crate) fn focus(&self) {
        self.dispatch(Event::Activity(Activity::Focus));
    }

    pub(crate) fn shutdown(&self) {
        self.dispatch(Event::Shutdown);
    }

    pub(crate) fn status(&self) -> watch::Receiver<Status> {
        self.status.clone()
    }

    fn dispatch(&self, event: Event) {
        if self.events.send(event).is_err() {
            debug!("Runtime has exited, dropping input");
        }
    }
}

impl Runtime {
    pub(crate) fn new(
        timing: &TimingConfig,
        actuators: &[Actuator],
        connector: Arc<dyn Connector>,
    ) -> (Self, RuntimeHandle) {
        let supervisor = Supervisor::new(timing, actuators);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(supervisor.status());

        let handle = RuntimeHandle {
            events: events_tx.clone(),
            status: status_rx,
        };
        let runtime = Self {
            supervisor,
            connector,
            events_tx,
            events_rx,
            timers: BTreeMap::new(),
            session: None,
            status_tx,
        };
        (runtime, handle)
    }

    /// Run until the supervisor asks to exit.
    pub(crate) async fn run(mut self) {
        let mut next = Some(Event::Start);
        loop {
            let event = match next.take() {
                Some(event) => event,
                None => match self.events_rx.recv().await {
                    Some(event) => event,
                    // Unreachable while we hold a sender.
                    None => break,
                },
            };

            let effects = self.supervisor.handle(event);
            let mut exit = false;
            for effect in effects {
                if matches!(effect, Effect::Exit) {
                    exit = true;
                } else {
                    self.execute(effect).await;
                }
            }
            self.status_tx.send_replace(self.supervisor.status());

            if exit {
                break;
            }
        }

        for (_, timer) in std::mem::take(&mut self.timers) {
            timer.abort();
        }
        info!("Runtime stopped");
    }

    async fn execute(&mut self, effect: Effect) {
        match effect {
            Effect::OpenSession { generation, id } => self.open_session(generation, id).await,
            Effect::CloseSession { generation } => self.close_session(generation),
            Effect::StartTimer { kind, after, token } => self.start_timer(kind, after, token),
            Effect::CancelTimer { kind } => {
                if let Some(timer) = self.timers.remove(&kind) {
                    timer.abort();
                }
            }
            Effect::Send {
                generation,
                frame,
                delivery,
            } => self.send(generation, frame, delivery),
            Effect::Negotiate { generation } => self.negotiate(generation),
            Effect::ApplyAnswer { generation, sdp } => self.apply_answer(generation, sdp),
            Effect::Exit => {}
        }
    }

    async fn open_session(&mut self, generation: Generation, id: uuid::Uuid) {
        info!(generation, %id, "Opening transports");
        let signaling = self
            .connector
            .open_signaling(generation, self.events_tx.clone());

        let media = match self
            .connector
            .open_media(generation, self.events_tx.clone())
            .await
        {
            Ok(media) => Some(media),
            Err(e) => {
                let _ = self.events_tx.send(Event::MediaFailed {
                    generation,
                    reason: e.to_string(),
                });
                None
            }
        };

        if let Some(stale) = self.session.replace(Transports {
            generation,
            signaling,
            media,
        }) {
            warn!(
                generation = stale.generation,
                "Previous transports still open, closing"
            );
            tokio::spawn(close_transports(stale));
        }
    }

    fn close_session(&mut self, generation: Generation) {
        let transports = match self.session.take() {
            Some(t) if t.generation == generation => Some(t),
            other => {
                self.session = other;
                None
            }
        };
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            if let Some(transports) = transports {
                close_transports(transports).await;
            }
            let _ = events.send(Event::SessionClosed { generation });
        });
    }

    fn start_timer(&mut self, kind: TimerKind, after: Duration, token: u64) {
        let events = self.events_tx.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = events.send(Event::TimerFired { kind, token });
        });
        if let Some(previous) = self.timers.insert(kind, timer) {
            previous.abort();
        }
    }

    fn send(&self, generation: Generation, frame: OutboundFrame, delivery: Delivery) {
        let result = match &self.session {
            Some(t) if t.generation == generation => t.signaling.send(frame.as_str()),
            _ => Err(crate::transport::SendError::NotOpen),
        };
        let Err(e) = result else {
            debug!(generation, %frame, "Sent");
            return;
        };
        match delivery {
            Delivery::BestEffort => debug!(generation, %frame, "Did not send: {e}"),
            Delivery::Required => {
                let _ = self.events_tx.send(Event::SendFailed {
                    generation,
                    frame,
                    reason: e.to_string(),
                });
            }
        }
    }

    fn negotiate(&self, generation: Generation) {
        let media = self.media_of(generation);
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let result = match media {
                Some(media) => media.negotiate().await.map_err(|e| e.to_string()),
                None => Err("no peer connection".to_string()),
            };
            let _ = events.send(Event::AnswerReady { generation, result });
        });
    }

    fn apply_answer(&self, generation: Generation, sdp: String) {
        let Some(media) = self.media_of(generation) else {
            debug!(generation, "No peer connection for answer");
            return;
        };
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            if let Err(e) = media.apply_answer(sdp).await {
                let _ = events.send(Event::MediaFailed {
                    generation,
                    reason: e.to_string(),
                });
            }
        });
    }

    fn media_of(&self, generation: Generation) -> Option<Arc<dyn MediaLink>> {
        self.session
            .as_ref()
            .filter(|t| t.generation == generation)
            .and_then(|t| t.media.clone())
    }
}

async fn close_transports(transports: Transports) {
    if let Some(media) = &transports.media {
        media.pause().await;
        media.close().await;
    }
    transports.signaling.close().await;
    debug!(generation = transports.generation, "Transports closed");
}
