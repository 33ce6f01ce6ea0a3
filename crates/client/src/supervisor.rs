//! Connection supervisor.
//!
//! A pure state machine: [`Supervisor::handle`] takes one [`Event`] and returns
//! the [`Effect`]s the runtime has to carry out. Nothing in here touches a
//! socket or a clock, so every transition can be driven from a test.

use std::collections::BTreeMap;
use std::time::Duration;

use driveway_protocol::{Actuator, OutboundFrame, SignalingMessage, TimingConfig};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::activity::{Activity, ActivityMonitor};
use crate::timers::{TimerBook, TimerKind};

/// Numbers each session; events carry it so stale ones can be dropped.
pub(crate) type Generation = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum Phase {
    /// Transports are being opened; no watchdog yet.
    Starting,
    /// Signaling is open and the watchdog is armed.
    Live,
    /// Transports are closing; waiting for the close to be acknowledged.
    TearingDown,
    /// Waiting for the restart delay.
    RestartScheduled,
    /// Nothing running and nothing scheduled.
    Stopped,
}

impl Phase {
    pub(crate) fn is_running(self) -> bool {
        matches!(self, Phase::Starting | Phase::Live)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Delivery {
    /// Failure is logged and forgotten.
    BestEffort,
    /// Failure means the channel is broken and the session must go.
    Required,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Event {
    /// Initial kick from the runtime.
    Start,
    SignalingOpened {
        generation: Generation,
    },
    Signal {
        generation: Generation,
        message: SignalingMessage,
    },
    /// Signaling could not connect, errored or was closed by the controller.
    SignalingFailed {
        generation: Generation,
        reason: String,
    },
    /// The peer connection wants a new offer/answer round.
    NegotiationNeeded {
        generation: Generation,
    },
    /// Outcome of the offer/answer exchange; `Ok` holds the rewritten answer.
    AnswerReady {
        generation: Generation,
        result: Result<String, String>,
    },
    MediaFailed {
        generation: Generation,
        reason: String,
    },
    /// A [`Delivery::Required`] send did not go out.
    SendFailed {
        generation: Generation,
        frame: OutboundFrame,
        reason: String,
    },
    /// Both transports of `generation` are closed.
    SessionClosed {
        generation: Generation,
    },
    TimerFired {
        kind: TimerKind,
        token: u64,
    },
    Activity(Activity),
    /// The user pressed an actuator.
    Trigger(Actuator),
    Shutdown,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Effect {
    /// Open signaling and media for a new session, concurrently.
    OpenSession { generation: Generation, id: Uuid },
    /// Pause playback, close the peer connection and the signaling channel,
    /// then report [`Event::SessionClosed`].
    CloseSession { generation: Generation },
    StartTimer {
        kind: TimerKind,
        after: Duration,
        token: u64,
    },
    CancelTimer { kind: TimerKind },
    Send {
        generation: Generation,
        frame: OutboundFrame,
        delivery: Delivery,
    },
    /// Run one offer/answer exchange and report [`Event::AnswerReady`].
    Negotiate { generation: Generation },
    ApplyAnswer { generation: Generation, sdp: String },
    /// Leave the event loop.
    Exit,
}

/// Per-actuator affordance state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub(crate) struct ActuatorState {
    /// The controller confirmed it can reach the actuator.
    pub ready: bool,
    /// A command is in flight or its echo is still being displayed.
    pub pending: bool,
    /// The controller reported it cannot reach the actuator.
    pub unavailable: bool,
}

/// Snapshot published to the UI layer after every event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub(crate) struct Status {
    pub phase: Phase,
    pub away: bool,
    pub session_id: Option<Uuid>,
    pub generation: Option<Generation>,
    pub actuators: BTreeMap<Actuator, ActuatorState>,
}

#[derive(Debug)]
struct Session {
    generation: Generation,
    id: Uuid,
    /// One offer/answer round at a time.
    negotiating: bool,
}

pub(crate) struct Supervisor {
    liveness_timeout: Duration,
    restart_delay: Duration,
    inactivity_timeout: Duration,
    busy_display: Duration,
    phase: Phase,
    session: Option<Session>,
    next_generation: Generation,
    activity: ActivityMonitor,
    /// Focus came back while a teardown was still closing transports.
    restart_on_close: bool,
    shutting_down: bool,
    actuators: BTreeMap<Actuator, ActuatorState>,
    timers: TimerBook,
}

impl Supervisor {
    pub(crate) fn new(timing: &TimingConfig, actuators: &[Actuator]) -> Self {
        Self {
            liveness_timeout: timing.liveness_timeout(),
            restart_delay: timing.restart_delay(),
            inactivity_timeout: timing.inactivity_timeout(),
            busy_display: timing.busy_display(),
            phase: Phase::Stopped,
            session: None,
            next_generation: 1,
            activity: ActivityMonitor::default(),
            restart_on_close: false,
            shutting_down: false,
            actuators: actuators
                .iter()
                .map(|&a| (a, ActuatorState::default()))
                .collect(),
            timers: TimerBook::default(),
        }
    }

    #[cfg(test)]
    fn phase(&self) -> Phase {
        self.phase
    }

    #[cfg(test)]
    fn is_away(&self) -> bool {
        self.activity.is_away()
    }

    #[cfg(test)]
    fn actuator(&self, actuator: Actuator) -> Option<ActuatorState> {
        self.actuators.get(&actuator).copied()
    }

    pub(crate) fn status(&self) -> Status {
        Status {
            phase: self.phase,
            away: self.activity.is_away(),
            session_id: self.session.as_ref().map(|s| s.id),
            generation: self.session.as_ref().map(|s| s.generation),
            actuators: self.actuators.clone(),
        }
    }

    pub(crate) fn handle(&mut self, event: Event) -> Vec<Effect> {
        let mut fx = Vec::new();
        match event {
            Event::Start => {
                if self.phase == Phase::Stopped && self.session.is_none() && !self.shutting_down
                {
                    self.start_session(&mut fx);
                }
            }
            Event::SignalingOpened { generation } => {
                if self.is_current(generation) && self.phase == Phase::Starting {
                    info!(generation, "Signaling connected");
                    self.phase = Phase::Live;
                    fx.push(self.timers.start(TimerKind::Liveness, self.liveness_timeout));
                } else {
                    debug!(generation, "Ignoring open of stale signaling channel");
                }
            }
            Event::Signal {
                generation,
                message,
            } => {
                if self.is_current(generation) {
                    self.on_signal(message, &mut fx);
                }
            }
            Event::SignalingFailed { generation, reason } => {
                if self.is_current(generation) {
                    self.teardown(&format!("signaling: {reason}"), &mut fx);
                }
            }
            Event::NegotiationNeeded { generation } => {
                if !self.is_current(generation) {
                    debug!(generation, "Ignoring negotiation request of stale session");
                } else if let Some(session) = self.session.as_mut() {
                    if session.negotiating {
                        debug!(generation, "Negotiation already in flight");
                    } else {
                        session.negotiating = true;
                        fx.push(Effect::Negotiate { generation });
                    }
                }
            }
            Event::AnswerReady { generation, result } => {
                if !self.is_current(generation) {
                    info!(generation, "Discarding answer for a session that is gone");
                    return fx;
                }
                if let Some(session) = self.session.as_mut() {
                    session.negotiating = false;
                }
                match result {
                    Ok(sdp) => fx.push(Effect::ApplyAnswer { generation, sdp }),
                    Err(e) => self.teardown(&format!("negotiation: {e}"), &mut fx),
                }
            }
            Event::MediaFailed { generation, reason } => {
                if self.is_current(generation) {
                    self.teardown(&format!("media: {reason}"), &mut fx);
                }
            }
            Event::SendFailed {
                generation,
                frame,
                reason,
            } => {
                if self.is_current(generation) {
                    self.teardown(&format!("sending {frame}: {reason}"), &mut fx);
                }
            }
            Event::SessionClosed { generation } => self.on_session_closed(generation, &mut fx),
            Event::TimerFired { kind, token } => {
                if self.timers.fire(kind, token) {
                    self.on_timer(kind, &mut fx);
                } else {
                    debug!(?kind, token, "Ignoring stale timer");
                }
            }
            Event::Activity(Activity::Blur) => self.on_blur(&mut fx),
            Event::Activity(Activity::Focus) => self.on_focus(&mut fx),
            Event::Trigger(actuator) => self.on_trigger(actuator, &mut fx),
            Event::Shutdown => self.on_shutdown(&mut fx),
        }
        fx
    }

    fn is_current(&self, generation: Generation) -> bool {
        self.phase.is_running()
            && self
                .session
                .as_ref()
                .is_some_and(|s| s.generation == generation)
    }

    fn current_generation(&self) -> Option<Generation> {
        self.session.as_ref().map(|s| s.generation)
    }

    fn start_session(&mut self, fx: &mut Vec<Effect>) {
        let generation = self.next_generation;
        self.next_generation += 1;
        let id = Uuid::new_v4();
        info!(generation, %id, "Starting session");
        self.session = Some(Session {
            generation,
            id,
            negotiating: false,
        });
        self.phase = Phase::Starting;
        fx.push(Effect::OpenSession { generation, id });
    }

    fn teardown(&mut self, reason: &str, fx: &mut Vec<Effect>) {
        let Some(generation) = self.current_generation() else {
            return;
        };
        if !self.phase.is_running() {
            return;
        }
        warn!(generation, reason, "Tearing down session");
        self.phase = Phase::TearingDown;
        fx.extend(self.timers.cancel_all());
        for state in self.actuators.values_mut() {
            state.ready = false;
            state.pending = false;
        }
        fx.push(Effect::CloseSession { generation });
    }

    fn on_session_closed(&mut self, generation: Generation, fx: &mut Vec<Effect>) {
        if self.phase != Phase::TearingDown || self.current_generation() != Some(generation) {
            debug!(generation, "Ignoring close of stale session");
            return;
        }
        self.session = None;
        let restart_now = std::mem::take(&mut self.restart_on_close);

        if self.shutting_down {
            info!(generation, "Session closed, exiting");
            self.phase = Phase::Stopped;
            fx.extend(self.timers.cancel_all());
            fx.push(Effect::Exit);
        } else if self.activity.is_away() {
            info!(generation, "Session closed; staying stopped while away");
            self.phase = Phase::Stopped;
        } else if restart_now {
            info!(generation, "Session closed; user is back, restarting");
            self.start_session(fx);
        } else {
            info!(
                generation,
                delay_ms = self.restart_delay.as_millis() as u64,
                "Scheduling restart"
            );
            self.phase = Phase::RestartScheduled;
            fx.push(self.timers.start(TimerKind::Restart, self.restart_delay));
        }
    }

    fn on_signal(&mut self, message: SignalingMessage, fx: &mut Vec<Effect>) {
        match message {
            SignalingMessage::Ping => {
                if self.phase == Phase::Live {
                    fx.push(self.timers.start(TimerKind::Liveness, self.liveness_timeout));
                }
            }
            SignalingMessage::Connected(actuator) => {
                let Some(state) = self.actuators.get_mut(&actuator) else {
                    debug!(%actuator, "Ignoring connect for unconfigured actuator");
                    return;
                };
                info!(%actuator, "Actuator connected");
                state.ready = true;
                state.unavailable = false;
            }
            SignalingMessage::Failed { actuator, detail } => {
                let Some(state) = self.actuators.get_mut(&actuator) else {
                    debug!(%actuator, "Ignoring error for unconfigured actuator");
                    return;
                };
                warn!(%actuator, detail, "Controller failed to reach actuator");
                state.ready = false;
                state.pending = false;
                state.unavailable = true;
                if let Some(cancel) = self.timers.cancel(TimerKind::Busy(actuator)) {
                    fx.push(cancel);
                }
            }
            SignalingMessage::State { actuator, label } => {
                if !self.actuators.contains_key(&actuator) {
                    debug!(%actuator, %label, "Ignoring state of unconfigured actuator");
                    return;
                }
                if label.is_failure() {
                    warn!(%actuator, %label, "Actuator state");
                } else {
                    info!(%actuator, %label, "Actuator state");
                }
                fx.push(
                    self.timers
                        .start(TimerKind::Busy(actuator), self.busy_display),
                );
            }
        }
    }

    fn on_timer(&mut self, kind: TimerKind, fx: &mut Vec<Effect>) {
        match kind {
            TimerKind::Liveness => {
                if self.phase == Phase::Live {
                    self.teardown("lost connection: no ping within the liveness window", fx);
                }
            }
            TimerKind::Restart => {
                if self.phase == Phase::RestartScheduled {
                    info!("Restarting");
                    self.start_session(fx);
                }
            }
            TimerKind::Inactivity => {
                info!("Inactivity detected");
                self.notify(OutboundFrame::Inactive, fx);
                self.teardown("user inactive", fx);
            }
            TimerKind::Busy(actuator) => {
                if let Some(state) = self.actuators.get_mut(&actuator) {
                    state.pending = false;
                }
            }
        }
    }

    fn on_blur(&mut self, fx: &mut Vec<Effect>) {
        info!("Focus lost");
        self.activity.blur();
        self.notify(OutboundFrame::Blur, fx);
        if let Some(cancel) = self.timers.cancel(TimerKind::Restart) {
            fx.push(cancel);
        }
        if self.phase == Phase::RestartScheduled {
            self.phase = Phase::Stopped;
        }
        fx.push(
            self.timers
                .start(TimerKind::Inactivity, self.inactivity_timeout),
        );
    }

    fn on_focus(&mut self, fx: &mut Vec<Effect>) {
        info!("Focus gained");
        self.notify(OutboundFrame::Focus, fx);
        let Some(away_for) = self.activity.focus() else {
            return;
        };
        debug!(away_ms = away_for.as_millis() as u64, "User returned");

        match self.phase {
            Phase::Stopped if !self.shutting_down => {
                if let Some(cancel) = self.timers.cancel(TimerKind::Inactivity) {
                    fx.push(cancel);
                }
                info!("Restarting");
                self.start_session(fx);
            }
            Phase::TearingDown => self.restart_on_close = true,
            Phase::Starting | Phase::Live => {
                if let Some(cancel) = self.timers.cancel(TimerKind::Inactivity) {
                    fx.push(cancel);
                }
            }
            Phase::RestartScheduled | Phase::Stopped => {}
        }
    }

    fn on_trigger(&mut self, actuator: Actuator, fx: &mut Vec<Effect>) {
        let generation = match self.current_generation() {
            Some(g) if self.phase == Phase::Live => g,
            _ => {
                debug!(%actuator, "No live session, ignoring press");
                return;
            }
        };
        let Some(state) = self.actuators.get_mut(&actuator) else {
            debug!(%actuator, "Ignoring press of unconfigured actuator");
            return;
        };
        if !state.ready {
            debug!(%actuator, "Actuator not ready, ignoring press");
            return;
        }
        info!(%actuator, "Press");
        state.pending = true;
        fx.push(Effect::Send {
            generation,
            frame: OutboundFrame::Command(actuator),
            delivery: Delivery::Required,
        });
    }

    fn on_shutdown(&mut self, fx: &mut Vec<Effect>) {
        info!("Shutting down");
        self.shutting_down = true;
        match self.phase {
            Phase::Starting | Phase::Live => self.teardown("shutdown", fx),
            Phase::TearingDown => {}
            Phase::RestartScheduled | Phase::Stopped => {
                self.phase = Phase::Stopped;
                fx.extend(self.timers.cancel_all());
                fx.push(Effect::Exit);
            }
        }
    }

    /// Queue a best-effort notice on the current session's channel.
    fn notify(&self, frame: OutboundFrame, fx: &mut Vec<Effect>) {
        match self.current_generation() {
            Some(generation) if self.phase.is_running() => fx.push(Effect::Send {
                generation,
                frame,
                delivery: Delivery::BestEffort,
            }),
            _ => debug!(%frame, "Did not send, no session"),
        }
    }
}
