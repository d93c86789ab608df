//! In process relay.
//!
//! A [`MemoryHub`] plays the part of the relay server: every [`MemoryRelay`] handed out
//! by the hub can join session rooms, and text sent into a room is queued for every other
//! connected member.  Text sent into a room nobody else is in yet is held (up to
//! [`ROOM_BACKLOG`] frames) and handed to the next member to join.  The hub can be taken offline or have connections dropped, which is
//! how the reconnect paths of the signaling channel get exercised without a network.
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use log::debug;
use serde_json::Value;

use crate::common::box_error::BoxError;
use crate::signaling::relay::Relay;

/// frames held for a room with no one to deliver to
pub const ROOM_BACKLOG: usize = 64;

#[derive(Default)]
struct Member {
    connected: bool,
    rooms: HashSet<String>,
    inbox: VecDeque<String>,
}

#[derive(Default)]
struct HubState {
    next_id: usize,
    members: HashMap<usize, Member>,
    offline: bool,
    echo: bool,
    delivered: usize,
    backlog: HashMap<String, VecDeque<String>>,
}

#[derive(Clone, Default)]
pub struct MemoryHub {
    state: Arc<Mutex<HubState>>,
}

impl MemoryHub {
    pub fn new() -> MemoryHub {
        MemoryHub::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, HubState>, BoxError> {
        self.state
            .lock()
            .map_err(|_| "memory hub lock poisoned".into())
    }

    /// hand out a new (not yet connected) relay endpoint
    pub fn relay(&self) -> MemoryRelay {
        let id = match self.lock() {
            Ok(mut state) => {
                state.next_id += 1;
                let id = state.next_id;
                state.members.insert(id, Member::default());
                id
            }
            Err(_) => 0,
        };
        MemoryRelay {
            hub: self.clone(),
            id: id,
        }
    }

    /// While offline every connect and send fails and existing connections are dropped
    pub fn set_offline(&self, offline: bool) {
        if let Ok(mut state) = self.lock() {
            state.offline = offline;
            if offline {
                for member in state.members.values_mut() {
                    member.connected = false;
                }
            }
        }
    }

    /// also deliver frames back to their sender (some relays broadcast to the whole room)
    pub fn set_echo(&self, echo: bool) {
        if let Ok(mut state) = self.lock() {
            state.echo = echo;
        }
    }

    /// number of frames put into member inboxes so far
    pub fn delivered(&self) -> usize {
        self.lock().map(|s| s.delivered).unwrap_or(0)
    }

    /// push raw text to every connected member of a room, as if some other client sent it
    pub fn inject(&self, session_id: &str, text: &str) {
        if let Ok(mut state) = self.lock() {
            Self::route(&mut *state, None, session_id, text);
        }
    }

    fn route(state: &mut HubState, from: Option<usize>, session_id: &str, text: &str) {
        let echo = state.echo;
        let mut count = 0;
        let mut others = 0;
        for (id, member) in state.members.iter_mut() {
            if Some(*id) == from && !echo {
                continue;
            }
            if member.connected && member.rooms.contains(session_id) {
                member.inbox.push_back(String::from(text));
                count += 1;
                if Some(*id) != from {
                    others += 1;
                }
            }
        }
        state.delivered += count;
        if others == 0 {
            let held = state.backlog.entry(String::from(session_id)).or_default();
            if held.len() >= ROOM_BACKLOG {
                held.pop_front();
            }
            held.push_back(String::from(text));
            debug!("holding frame for empty room {} ({} held)", session_id, held.len());
        }
    }

    /// a member left a room, forget what was held for it once nobody is left
    fn vacate(state: &mut HubState, session_id: &str) {
        let occupied = state
            .members
            .values()
            .any(|m| m.connected && m.rooms.contains(session_id));
        if !occupied {
            state.backlog.remove(session_id);
        }
    }
}

pub struct MemoryRelay {
    hub: MemoryHub,
    id: usize,
}

impl MemoryRelay {
    fn with_member<T>(
        &self,
        f: impl FnOnce(&mut HubState, usize) -> Result<T, BoxError>,
    ) -> Result<T, BoxError> {
        let mut state = self.hub.lock()?;
        f(&mut *state, self.id)
    }

    fn require_connected(state: &HubState, id: usize) -> Result<(), BoxError> {
        match state.members.get(&id) {
            Some(m) if m.connected && !state.offline => Ok(()),
            _ => Err("memory relay not connected".into()),
        }
    }
}

impl Relay for MemoryRelay {
    fn connect(&mut self) -> Result<(), BoxError> {
        self.with_member(|state, id| {
            if state.offline {
                return Err("memory hub offline".into());
            }
            let member = state.members.entry(id).or_default();
            member.connected = true;
            // rooms do not survive a reconnect
            member.rooms.clear();
            member.inbox.clear();
            debug!("memory relay {} connected", id);
            Ok(())
        })
    }

    fn is_connected(&self) -> bool {
        self.with_member(|state, id| Ok(Self::require_connected(state, id).is_ok()))
            .unwrap_or(false)
    }

    fn join(&mut self, session_id: &str) -> Result<(), BoxError> {
        self.with_member(|state, id| {
            Self::require_connected(state, id)?;
            let held = state.backlog.remove(session_id).unwrap_or_default();
            if let Some(member) = state.members.get_mut(&id) {
                member.rooms.insert(String::from(session_id));
                state.delivered += held.len();
                member.inbox.extend(held);
            }
            Ok(())
        })
    }

    fn leave(&mut self, session_id: &str) -> Result<(), BoxError> {
        self.with_member(|state, id| {
            if let Some(member) = state.members.get_mut(&id) {
                member.rooms.remove(session_id);
            }
            MemoryHub::vacate(state, session_id);
            Ok(())
        })
    }

    fn send_text(&mut self, text: &str) -> Result<(), BoxError> {
        self.with_member(|state, id| {
            Self::require_connected(state, id)?;
            let raw: Value = serde_json::from_str(text)?;
            let session_id = raw["sessionId"].as_str().unwrap_or("").to_string();
            MemoryHub::route(state, Some(id), &session_id, text);
            Ok(())
        })
    }

    fn recv_text(&mut self) -> Result<Option<String>, BoxError> {
        self.with_member(|state, id| {
            Self::require_connected(state, id)?;
            Ok(state.members.get_mut(&id).and_then(|m| m.inbox.pop_front()))
        })
    }

    fn disconnect(&mut self) {
        let _res = self.with_member(|state, id| {
            let rooms = match state.members.get_mut(&id) {
                Some(member) => {
                    member.connected = false;
                    member.rooms.drain().collect()
                }
                None => vec![],
            };
            for room in rooms {
                MemoryHub::vacate(state, &room);
            }
            Ok(())
        });
    }
}

#[cfg(test)]
mod test_memory_relay {
    use super::*;

    #[test]
    fn routes_to_room_members_only() {
        let hub = MemoryHub::new();
        let mut a = hub.relay();
        let mut b = hub.relay();
        let mut c = hub.relay();
        for r in [&mut a, &mut b, &mut c] {
            r.connect().unwrap();
        }
        a.join("s1").unwrap();
        b.join("s1").unwrap();
        c.join("s2").unwrap();
        a.send_text(r#"{"sessionId":"s1","type":"bye"}"#).unwrap();
        assert!(b.recv_text().unwrap().is_some());
        assert!(c.recv_text().unwrap().is_none());
        // no echo by default
        assert!(a.recv_text().unwrap().is_none());
        assert_eq!(hub.delivered(), 1);
    }

    #[test]
    fn empty_room_holds_frames_for_the_next_member() {
        let hub = MemoryHub::new();
        let mut host = hub.relay();
        let mut guest = hub.relay();
        host.connect().unwrap();
        guest.connect().unwrap();
        host.join("s1").unwrap();
        host.send_text(r#"{"sessionId":"s1","type":"offer"}"#).unwrap();
        host.send_text(r#"{"sessionId":"s1","type":"candidate"}"#).unwrap();
        assert_eq!(hub.delivered(), 0);
        guest.join("s1").unwrap();
        assert!(guest.recv_text().unwrap().unwrap().contains("offer"));
        assert!(guest.recv_text().unwrap().unwrap().contains("candidate"));
        assert!(guest.recv_text().unwrap().is_none());
        assert_eq!(hub.delivered(), 2);
    }

    #[test]
    fn backlog_is_bounded_and_dropped_with_the_room() {
        let hub = MemoryHub::new();
        let mut a = hub.relay();
        let mut b = hub.relay();
        a.connect().unwrap();
        b.connect().unwrap();
        a.join("s1").unwrap();
        for i in 0..ROOM_BACKLOG + 10 {
            a.send_text(&format!(r#"{{"sessionId":"s1","n":{}}}"#, i)).unwrap();
        }
        b.join("s1").unwrap();
        let mut got = vec![];
        while let Some(t) = b.recv_text().unwrap() {
            got.push(t);
        }
        assert_eq!(got.len(), ROOM_BACKLOG);
        assert!(got[0].contains(r#""n":10"#));

        // the last one out takes the backlog with them
        b.leave("s1").unwrap();
        a.send_text(r#"{"sessionId":"s1","type":"bye"}"#).unwrap();
        a.leave("s1").unwrap();
        b.join("s1").unwrap();
        assert!(b.recv_text().unwrap().is_none());
    }

    #[test]
    fn offline_hub_fails() {
        let hub = MemoryHub::new();
        let mut a = hub.relay();
        a.connect().unwrap();
        hub.set_offline(true);
        assert!(!a.is_connected());
        assert!(a.send_text(r#"{"sessionId":"s1"}"#).is_err());
        assert!(a.connect().is_err());
        hub.set_offline(false);
        assert!(a.connect().is_ok());
        assert!(a.is_connected());
    }
}
