use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Idle,
    Negotiating,
    Syncing,
    Active,
    Ended,
    Failed,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Ended | SessionState::Failed)
    }
    /// a session in one of these states holds the device
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            SessionState::Negotiating | SessionState::Syncing | SessionState::Active
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Negotiating => "negotiating",
            SessionState::Syncing => "syncing",
            SessionState::Active => "active",
            SessionState::Ended => "ended",
            SessionState::Failed => "failed",
        };
        write!(f, "{}", name)
    }
}

/// The host creates the session and offers, the guest joins by id and answers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Host,
    Guest,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Role::Host => write!(f, "host"),
            Role::Guest => write!(f, "guest"),
        }
    }
}

/// Everything that can move a session along
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "trigger", content = "detail", rename_all = "camelCase")]
pub enum Trigger {
    Start,
    OfferExchanged,
    AnswerExchanged,
    PathConfirmed,
    ClockSynchronized,
    SyncTimeout,
    NegotiationTimeout,
    SignalingUnavailable(String),
    Bye,
    LocalDisconnect,
    TransportLost,
    ResyncRequired,
    LocalError(String),
}

impl Trigger {
    pub fn name(&self) -> &'static str {
        match self {
            Trigger::Start => "start",
            Trigger::OfferExchanged => "offer_exchanged",
            Trigger::AnswerExchanged => "answer_exchanged",
            Trigger::PathConfirmed => "path_confirmed",
            Trigger::ClockSynchronized => "clock_synchronized",
            Trigger::SyncTimeout => "sync_timeout",
            Trigger::NegotiationTimeout => "negotiation_timeout",
            Trigger::SignalingUnavailable(_) => "signaling_unavailable",
            Trigger::Bye => "bye",
            Trigger::LocalDisconnect => "local_disconnect",
            Trigger::TransportLost => "transport_lost",
            Trigger::ResyncRequired => "resync_required",
            Trigger::LocalError(_) => "local_error",
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Trigger::SignalingUnavailable(why) | Trigger::LocalError(why) => {
                write!(f, "{} ({})", self.name(), why)
            }
            _ => write!(f, "{}", self.name()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateChange {
    pub session_id: String,
    pub from: SessionState,
    pub to: SessionState,
    pub reason: Trigger,
}

impl fmt::Display for StateChange {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "session {}: {} -> {} on {}",
            self.session_id, self.from, self.to, self.reason
        )
    }
}
