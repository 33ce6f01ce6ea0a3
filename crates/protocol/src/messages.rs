use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Liveness frame the controller sends roughly once a second.
pub const PING: &str = "ping";

const CONNECT_SUFFIX: &str = "connect";
const ERROR_SUFFIX: &str = "error";
const STATE_SEPARATOR: char = ':';

/// A controllable mechanism behind the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Actuator {
    Gate,
    Garage,
}

impl Actuator {
    pub const ALL: [Actuator; 2] = [Actuator::Gate, Actuator::Garage];

    /// Wire name, also the outbound command token.
    pub fn as_str(self) -> &'static str {
        match self {
            Actuator::Gate => "gate",
            Actuator::Garage => "garage",
        }
    }
}

impl fmt::Display for Actuator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown actuator '{0}' (expected 'gate' or 'garage')")]
pub struct UnknownActuator(pub String);

impl FromStr for Actuator {
    type Err = UnknownActuator;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Actuator::ALL
            .into_iter()
            .find(|a| a.as_str() == s)
            .ok_or_else(|| UnknownActuator(s.to_string()))
    }
}

/// State label echoed by the controller after a command (`gate:ok`, `garage:busy`).
///
/// The controller forwards the bot's status byte as one of a few words; anything
/// else is kept verbatim so it can still be shown and logged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateLabel {
    Ok,
    Busy,
    LowBattery,
    Error,
    Other(String),
}

impl StateLabel {
    pub fn parse(label: &str) -> Self {
        match label {
            "ok" => StateLabel::Ok,
            "busy" => StateLabel::Busy,
            "low" => StateLabel::LowBattery,
            "error" => StateLabel::Error,
            other => StateLabel::Other(other.to_string()),
        }
    }

    /// True for labels that mean the press did not go through.
    pub fn is_failure(&self) -> bool {
        matches!(self, StateLabel::Busy | StateLabel::Error)
    }
}

impl fmt::Display for StateLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateLabel::Ok => f.write_str("ok"),
            StateLabel::Busy => f.write_str("busy"),
            StateLabel::LowBattery => f.write_str("low"),
            StateLabel::Error => f.write_str("error"),
            StateLabel::Other(s) => f.write_str(s),
        }
    }
}

/// Inbound text frames from the controller's signaling socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalingMessage {
    /// Liveness heartbeat.
    Ping,
    /// The controller reached the actuator and accepts commands for it.
    Connected(Actuator),
    /// The controller failed to reach the actuator. `detail` is whatever
    /// followed the error token (usually empty).
    Failed { actuator: Actuator, detail: String },
    /// Current state of an actuator, carried as a full label rather than a delta.
    State { actuator: Actuator, label: StateLabel },
}

impl SignalingMessage {
    /// Parse one inbound frame. Unrecognized frames yield `None`.
    ///
    /// Match order follows the controller vocabulary: exact `ping`, exact
    /// `<actuator>connect`, prefix `<actuator>error`, prefix `<actuator>:`.
    pub fn parse(frame: &str) -> Option<Self> {
        if frame == PING {
            return Some(SignalingMessage::Ping);
        }

        for actuator in Actuator::ALL {
            let Some(rest) = frame.strip_prefix(actuator.as_str()) else {
                continue;
            };
            if rest == CONNECT_SUFFIX {
                return Some(SignalingMessage::Connected(actuator));
            }
            if let Some(detail) = rest.strip_prefix(ERROR_SUFFIX) {
                return Some(SignalingMessage::Failed {
                    actuator,
                    detail: detail.trim_start_matches(STATE_SEPARATOR).to_string(),
                });
            }
            if let Some(label) = rest.strip_prefix(STATE_SEPARATOR) {
                return Some(SignalingMessage::State {
                    actuator,
                    label: StateLabel::parse(label),
                });
            }
        }

        None
    }
}

/// Outbound text frames to the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboundFrame {
    /// Press the actuator.
    Command(Actuator),
    /// Window lost focus.
    Blur,
    /// Window regained focus.
    Focus,
    /// The user stayed away past the inactivity window.
    Inactive,
}

impl OutboundFrame {
    pub fn as_str(self) -> &'static str {
        match self {
            OutboundFrame::Command(actuator) => actuator.as_str(),
            OutboundFrame::Blur => "blur",
            OutboundFrame::Focus => "focus",
            OutboundFrame::Inactive => "inactive",
        }
    }
}

impl fmt::Display for OutboundFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
