//! Lifecycle of one duet session.
//!
//! ```text
//! idle --start--> negotiating --offer+answer+path--> syncing --clock valid--> active
//!                      |                               |  (sync timeout: active, unsynchronized)
//!                      |  timeout / signaling lost     |                        |
//!                      v                               v                        v
//!                   failed                          ended <--bye/disconnect/transport lost
//! ```
//!
//! `ResyncRequired` takes an active session back to syncing.  Ended and failed are
//! terminal, a late bye or disconnect there is ignored.
use chrono::{DateTime, Utc};
use log::{debug, info, warn};

use crate::common::{duet_error::DuetError, ms_to_micros};
use crate::session::state::{Role, SessionState, StateChange, Trigger};
use crate::signaling::message::SessionDescription;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionTimeouts {
    /// usec allowed from start until offer, answer and path are done
    pub negotiation: u128,
    /// usec allowed in syncing before going active unsynchronized
    pub sync: u128,
}

impl Default for SessionTimeouts {
    fn default() -> Self {
        SessionTimeouts {
            negotiation: ms_to_micros(30_000),
            sync: ms_to_micros(10_000),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Session {
    id: String,
    role: Role,
    state: SessionState,
    created_at: DateTime<Utc>,
    entered_at: u128,
    timeouts: SessionTimeouts,
    unsynchronized: bool,
    offer_exchanged: bool,
    answer_exchanged: bool,
    path_confirmed: bool,
    local_description: Option<SessionDescription>,
    remote_description: Option<SessionDescription>,
}

impl Session {
    pub fn new(id: &str, role: Role, timeouts: SessionTimeouts) -> Session {
        Session {
            id: String::from(id),
            role: role,
            state: SessionState::Idle,
            created_at: Utc::now(),
            entered_at: 0,
            timeouts: timeouts,
            unsynchronized: false,
            offer_exchanged: false,
            answer_exchanged: false,
            path_confirmed: false,
            local_description: None,
            remote_description: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }
    pub fn role(&self) -> Role {
        self.role
    }
    pub fn state(&self) -> SessionState {
        self.state
    }
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
    pub fn is_unsynchronized(&self) -> bool {
        self.unsynchronized
    }
    /// offer, answer and transport path all done
    pub fn is_negotiated(&self) -> bool {
        self.offer_exchanged && self.answer_exchanged && self.path_confirmed
    }
    pub fn local_description(&self) -> Option<&SessionDescription> {
        self.local_description.as_ref()
    }
    pub fn remote_description(&self) -> Option<&SessionDescription> {
        self.remote_description.as_ref()
    }
    pub fn set_local_description(&mut self, desc: SessionDescription) {
        self.local_description = Some(desc);
    }
    pub fn set_remote_description(&mut self, desc: SessionDescription) {
        self.remote_description = Some(desc);
    }
    /// usec spent in the current state
    pub fn time_in_state(&self, now: u128) -> u128 {
        now.saturating_sub(self.entered_at)
    }

    /// The timeout trigger that is due, if any
    pub fn check_timeouts(&self, now: u128) -> Option<Trigger> {
        match self.state {
            SessionState::Negotiating if self.time_in_state(now) >= self.timeouts.negotiation => {
                Some(Trigger::NegotiationTimeout)
            }
            SessionState::Syncing if self.time_in_state(now) >= self.timeouts.sync => {
                Some(Trigger::SyncTimeout)
            }
            _ => None,
        }
    }

    /// Apply a trigger.  Ok(None) means it was accepted without changing state.
    pub fn apply(&mut self, trigger: Trigger, now: u128) -> Result<Option<StateChange>, DuetError> {
        use SessionState::*;

        let next = match (self.state, &trigger) {
            (Idle, Trigger::Start) => Some(Negotiating),
            (Idle, _) => return Err(self.invalid(&trigger)),

            (Negotiating, Trigger::OfferExchanged) => {
                self.offer_exchanged = true;
                self.negotiated_state()
            }
            (Negotiating, Trigger::AnswerExchanged) => {
                self.answer_exchanged = true;
                self.negotiated_state()
            }
            (Negotiating, Trigger::PathConfirmed) => {
                self.path_confirmed = true;
                self.negotiated_state()
            }
            (Negotiating, Trigger::NegotiationTimeout)
            | (Negotiating, Trigger::SignalingUnavailable(_))
            | (Syncing, Trigger::SignalingUnavailable(_)) => Some(Failed),

            (Syncing, Trigger::ClockSynchronized) => {
                self.unsynchronized = false;
                Some(Active)
            }
            (Syncing, Trigger::SyncTimeout) => {
                warn!("session {} going active without a synchronized clock", self.id);
                self.unsynchronized = true;
                Some(Active)
            }
            // late candidates or path checks after negotiation finished
            (Syncing, Trigger::OfferExchanged)
            | (Syncing, Trigger::AnswerExchanged)
            | (Syncing, Trigger::PathConfirmed)
            | (Syncing, Trigger::ResyncRequired)
            | (Active, Trigger::PathConfirmed)
            | (Active, Trigger::SyncTimeout) => None,

            (Active, Trigger::ClockSynchronized) => {
                if !self.unsynchronized {
                    return Ok(None);
                }
                info!("session {} clock synchronized late", self.id);
                self.unsynchronized = false;
                Some(Active)
            }
            (Active, Trigger::ResyncRequired) => Some(Syncing),
            (Active, Trigger::SignalingUnavailable(why)) => {
                // media keeps flowing without the relay, only clock probes stop
                warn!("session {} lost signaling while active: {}", self.id, why);
                None
            }

            (Negotiating, Trigger::Bye)
            | (Negotiating, Trigger::LocalDisconnect)
            | (Negotiating, Trigger::TransportLost)
            | (Syncing, Trigger::Bye)
            | (Syncing, Trigger::LocalDisconnect)
            | (Syncing, Trigger::TransportLost)
            | (Active, Trigger::Bye)
            | (Active, Trigger::LocalDisconnect)
            | (Active, Trigger::TransportLost) => Some(Ended),

            (Negotiating, Trigger::LocalError(_))
            | (Syncing, Trigger::LocalError(_))
            | (Active, Trigger::LocalError(_)) => Some(Failed),

            (Ended, Trigger::Bye)
            | (Ended, Trigger::LocalDisconnect)
            | (Ended, Trigger::TransportLost)
            | (Ended, Trigger::SignalingUnavailable(_))
            | (Failed, Trigger::Bye)
            | (Failed, Trigger::LocalDisconnect)
            | (Failed, Trigger::TransportLost)
            | (Failed, Trigger::SignalingUnavailable(_)) => {
                debug!("session {} already {}, ignoring {}", self.id, self.state, trigger);
                None
            }

            _ => return Err(self.invalid(&trigger)),
        };

        Ok(next.map(|to| self.enter(to, trigger, now)))
    }

    fn negotiated_state(&self) -> Option<SessionState> {
        if self.is_negotiated() {
            Some(SessionState::Syncing)
        } else {
            None
        }
    }

    fn enter(&mut self, to: SessionState, reason: Trigger, now: u128) -> StateChange {
        let change = StateChange {
            session_id: self.id.clone(),
            from: self.state,
            to: to,
            reason: reason,
        };
        info!("{}", change);
        self.state = to;
        self.entered_at = now;
        change
    }

    fn invalid(&self, trigger: &Trigger) -> DuetError {
        DuetError::InvalidTrigger {
            state: self.state,
            trigger: String::from(trigger.name()),
        }
    }
}

#[cfg(test)]
mod test_state_machine {
    use super::*;

    fn started(role: Role) -> Session {
        let mut s = Session::new("123456", role, SessionTimeouts::default());
        s.apply(Trigger::Start, 0).unwrap();
        s
    }

    #[test]
    fn idle_only_accepts_start() {
        let triggers = vec![
            Trigger::OfferExchanged,
            Trigger::AnswerExchanged,
            Trigger::PathConfirmed,
            Trigger::ClockSynchronized,
            Trigger::SyncTimeout,
            Trigger::NegotiationTimeout,
            Trigger::SignalingUnavailable(String::from("x")),
            Trigger::Bye,
            Trigger::LocalDisconnect,
            Trigger::TransportLost,
            Trigger::ResyncRequired,
            Trigger::LocalError(String::from("x")),
        ];
        for t in triggers {
            let mut s = Session::new("1", Role::Host, SessionTimeouts::default());
            match s.apply(t.clone(), 0) {
                Err(DuetError::InvalidTrigger { state, .. }) => assert_eq!(state, SessionState::Idle),
                other => panic!("{} accepted in idle: {:?}", t, other),
            }
            assert_eq!(s.state(), SessionState::Idle);
        }
        let mut s = Session::new("1", Role::Host, SessionTimeouts::default());
        let change = s.apply(Trigger::Start, 0).unwrap().unwrap();
        assert_eq!(change.from, SessionState::Idle);
        assert_eq!(change.to, SessionState::Negotiating);
    }

    #[test]
    fn negotiation_steps_in_any_order() {
        let mut s = started(Role::Guest);
        assert_eq!(s.apply(Trigger::PathConfirmed, 10).unwrap(), None);
        assert_eq!(s.apply(Trigger::AnswerExchanged, 20).unwrap(), None);
        let change = s.apply(Trigger::OfferExchanged, 30).unwrap().unwrap();
        assert_eq!(change.to, SessionState::Syncing);
        assert_eq!(change.reason, Trigger::OfferExchanged);
    }

    #[test]
    fn host_goes_active_unsynchronized() {
        let mut s = started(Role::Host);
        s.apply(Trigger::OfferExchanged, 0).unwrap();
        s.apply(Trigger::PathConfirmed, 4_000_000).unwrap();
        // answer arrives at 5s
        let change = s.apply(Trigger::AnswerExchanged, 5_000_000).unwrap().unwrap();
        assert_eq!(change.to, SessionState::Syncing);
        assert_eq!(s.check_timeouts(14_999_999), None);
        // still no offset at 15s
        let t = s.check_timeouts(15_000_000).unwrap();
        assert_eq!(t, Trigger::SyncTimeout);
        let change = s.apply(t, 15_000_000).unwrap().unwrap();
        assert_eq!(change.to, SessionState::Active);
        assert!(s.is_unsynchronized());
        // a valid offset later clears the flag
        let change = s.apply(Trigger::ClockSynchronized, 16_000_000).unwrap().unwrap();
        assert_eq!(change.from, SessionState::Active);
        assert_eq!(change.to, SessionState::Active);
        assert!(!s.is_unsynchronized());
        assert_eq!(s.apply(Trigger::ClockSynchronized, 17_000_000).unwrap(), None);
    }

    #[test]
    fn negotiation_timeout_fails() {
        let s = started(Role::Host);
        assert_eq!(s.check_timeouts(29_999_999), None);
        let mut s = s;
        let t = s.check_timeouts(30_000_000).unwrap();
        assert_eq!(t, Trigger::NegotiationTimeout);
        assert_eq!(s.apply(t, 30_000_000).unwrap().unwrap().to, SessionState::Failed);
        assert_eq!(s.check_timeouts(90_000_000), None);
    }

    #[test]
    fn signaling_loss_fails_negotiation() {
        let mut s = started(Role::Guest);
        let change = s
            .apply(Trigger::SignalingUnavailable(String::from("relay down")), 1)
            .unwrap()
            .unwrap();
        assert_eq!(change.to, SessionState::Failed);
    }

    fn active() -> Session {
        let mut s = started(Role::Host);
        s.apply(Trigger::OfferExchanged, 0).unwrap();
        s.apply(Trigger::AnswerExchanged, 0).unwrap();
        s.apply(Trigger::PathConfirmed, 0).unwrap();
        s.apply(Trigger::ClockSynchronized, 1).unwrap();
        assert_eq!(s.state(), SessionState::Active);
        s
    }

    #[test]
    fn active_ends_on_bye_disconnect_or_transport_loss() {
        for t in [Trigger::Bye, Trigger::LocalDisconnect, Trigger::TransportLost] {
            let mut s = active();
            assert_eq!(s.apply(t, 5).unwrap().unwrap().to, SessionState::Ended);
            // idempotent afterwards
            assert_eq!(s.apply(Trigger::Bye, 6).unwrap(), None);
            assert_eq!(s.apply(Trigger::LocalDisconnect, 6).unwrap(), None);
            assert!(s.apply(Trigger::Start, 7).is_err());
            assert_eq!(s.state(), SessionState::Ended);
        }
    }

    #[test]
    fn resync_goes_back_to_syncing() {
        let mut s = active();
        let change = s.apply(Trigger::ResyncRequired, 10).unwrap().unwrap();
        assert_eq!(change.to, SessionState::Syncing);
        assert_eq!(s.check_timeouts(10_000_010).unwrap(), Trigger::SyncTimeout);
    }

    #[test]
    fn local_error_fails_from_any_live_state() {
        let mut s = started(Role::Host);
        assert_eq!(
            s.apply(Trigger::LocalError(String::from("mic")), 1).unwrap().unwrap().to,
            SessionState::Failed
        );
        let mut s = active();
        assert_eq!(
            s.apply(Trigger::LocalError(String::from("mic")), 1).unwrap().unwrap().to,
            SessionState::Failed
        );
    }

    #[test]
    fn active_survives_signaling_loss() {
        let mut s = active();
        assert_eq!(
            s.apply(Trigger::SignalingUnavailable(String::from("relay")), 3).unwrap(),
            None
        );
        assert_eq!(s.state(), SessionState::Active);
    }

    #[test]
    fn clock_triggers_rejected_while_negotiating() {
        let mut s = started(Role::Host);
        assert!(s.apply(Trigger::ClockSynchronized, 1).is_err());
        assert!(s.apply(Trigger::SyncTimeout, 1).is_err());
        assert_eq!(s.state(), SessionState::Negotiating);
    }
}
