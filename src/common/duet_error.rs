//! Failure taxonomy for a duet session.
//!
//! Only some of these are fatal.  `SyncTimeout` degrades the session, `FrameGapExceeded`
//! is reported through metrics, `MalformedMessage` is logged and dropped.
use std::{error::Error, fmt};

use crate::session::state::SessionState;

#[derive(Debug, Clone, PartialEq)]
pub enum DuetError {
    /// The signaling channel ran out of retries for a message or a reconnect
    SignalingUnavailable(String),
    /// No offer/answer exchange completed in time
    NegotiationTimeout,
    /// Clock never became valid during syncing.  Not fatal
    SyncTimeout,
    /// The transport lost the peer mid session
    TransportLost,
    /// A burst of lost frames longer than the jitter buffer could cover
    FrameGapExceeded { missing: u64 },
    /// A signaling message that could not be decoded or does not belong here
    MalformedMessage(String),
    /// Local resources (microphone, transport setup) could not be acquired
    LocalResource(String),
    /// A live session already exists on this device
    SessionBusy(String),
    /// The trigger is not valid in the current state
    InvalidTrigger { state: SessionState, trigger: String },
    /// No usable clock offset has been computed yet
    ClockUnavailable,
}

impl fmt::Display for DuetError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DuetError::SignalingUnavailable(why) => write!(f, "signaling unavailable: {}", why),
            DuetError::NegotiationTimeout => write!(f, "negotiation timed out"),
            DuetError::SyncTimeout => write!(f, "clock sync timed out"),
            DuetError::TransportLost => write!(f, "transport lost the peer"),
            DuetError::FrameGapExceeded { missing } => {
                write!(f, "frame gap of {} exceeded buffer depth", missing)
            }
            DuetError::MalformedMessage(why) => write!(f, "malformed signaling message: {}", why),
            DuetError::LocalResource(why) => write!(f, "local resource failure: {}", why),
            DuetError::SessionBusy(id) => write!(f, "session {} is still live", id),
            DuetError::InvalidTrigger { state, trigger } => {
                write!(f, "trigger {} not valid in state {}", trigger, state)
            }
            DuetError::ClockUnavailable => write!(f, "clock offset unavailable"),
        }
    }
}

impl Error for DuetError {}

impl DuetError {
    /// errors that take a session straight to failed
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            DuetError::SignalingUnavailable(_)
                | DuetError::NegotiationTimeout
                | DuetError::LocalResource(_)
        )
    }
}
