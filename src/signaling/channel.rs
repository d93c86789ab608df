//! The signaling channel adapter.
//!
//! One relay connection is shared by every session on the device (or on the server).
//! Outbound messages are queued per session and dispatched round robin, one message per
//! session per round, so a session with a big backlog never starves the others.  Each
//! message is retried with exponential backoff; when it runs out of attempts the session
//! gets a [`ChannelEvent::Unavailable`].
//!
//! Inbound frames are parsed, de-duplicated by `msgId` and queued per session.  Frames
//! with our own origin are relay echoes and are dropped.
//!
//! Nothing here blocks or spawns.  The owner calls [`SignalingChannel::poll`] from its
//! event loop.
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;

use log::{debug, info, trace, warn};

use crate::signaling::{
    message::SignalingMessage,
    relay::Relay,
    retry::{Backoff, RetryPolicy},
};

// remember this many inbound message ids per session for duplicate detection
const SEEN_WINDOW: usize = 256;
// upper bound on frames read from the relay in one poll
const MAX_READS_PER_POLL: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChannelConfig {
    pub retry: RetryPolicy,
    /// consecutive failed reconnects before the channel gives up
    pub reconnect_limit: u32,
    /// max messages handed to the relay per poll
    pub dispatch_budget: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        ChannelConfig {
            retry: RetryPolicy::default(),
            reconnect_limit: 5,
            dispatch_budget: 16,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// delivery for this session has failed for good
    Unavailable { session_id: String, reason: String },
    /// the relay connection came back after a drop
    Reconnected,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChannelStats {
    pub sent: u64,
    pub resent: u64,
    pub given_up: u64,
    pub received: u64,
    pub duplicates: u64,
    pub echoes: u64,
    pub malformed: u64,
    pub reconnects: u64,
}

impl fmt::Display for ChannelStats {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{{ sent: {}, resent: {}, given_up: {}, received: {}, dups: {}, echoes: {}, malformed: {}, reconnects: {} }}",
            self.sent,
            self.resent,
            self.given_up,
            self.received,
            self.duplicates,
            self.echoes,
            self.malformed,
            self.reconnects
        )
    }
}

struct Pending {
    text: String,
    kind: &'static str,
    backoff: Backoff,
}

#[derive(Default)]
struct SessionQueues {
    subscribed: bool,
    outbound: VecDeque<Pending>,
    inbound: VecDeque<SignalingMessage>,
    seen_order: VecDeque<String>,
    seen: HashSet<String>,
}

impl SessionQueues {
    /// true the first time an id is seen
    fn remember(&mut self, msg_id: &str) -> bool {
        if self.seen.contains(msg_id) {
            return false;
        }
        if self.seen_order.len() == SEEN_WINDOW {
            if let Some(old) = self.seen_order.pop_front() {
                self.seen.remove(&old);
            }
        }
        self.seen_order.push_back(String::from(msg_id));
        self.seen.insert(String::from(msg_id));
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LinkState {
    Disconnected,
    Connected,
    Failed,
}

pub struct SignalingChannel<R: Relay> {
    relay: R,
    config: ChannelConfig,
    origin: String,
    counter: u64,
    sessions: HashMap<String, SessionQueues>,
    rotation: VecDeque<String>,
    link: LinkState,
    ever_connected: bool,
    reconnect: Backoff,
    events: VecDeque<ChannelEvent>,
    stats: ChannelStats,
}

impl<R: Relay> SignalingChannel<R> {
    pub fn new(relay: R, config: ChannelConfig) -> SignalingChannel<R> {
        SignalingChannel {
            relay: relay,
            config: config,
            origin: format!("{:08x}", rand::random::<u32>()),
            counter: 0,
            sessions: HashMap::new(),
            rotation: VecDeque::new(),
            link: LinkState::Disconnected,
            ever_connected: false,
            reconnect: Backoff::new(),
            events: VecDeque::new(),
            stats: ChannelStats::default(),
        }
    }

    pub fn link_state(&self) -> LinkState {
        self.link
    }
    pub fn stats(&self) -> &ChannelStats {
        &self.stats
    }
    pub fn origin(&self) -> &str {
        &self.origin
    }
    /// messages still waiting to be handed to the relay for this session
    pub fn pending(&self, session_id: &str) -> usize {
        self.sessions
            .get(session_id)
            .map(|q| q.outbound.len())
            .unwrap_or(0)
    }
    pub fn is_subscribed(&self, session_id: &str) -> bool {
        self.sessions
            .get(session_id)
            .map(|q| q.subscribed)
            .unwrap_or(false)
    }

    fn queues(&mut self, session_id: &str) -> &mut SessionQueues {
        if !self.sessions.contains_key(session_id) {
            self.rotation.push_back(String::from(session_id));
        }
        self.sessions.entry(String::from(session_id)).or_default()
    }

    /// Start receiving messages for a session
    pub fn subscribe(&mut self, session_id: &str) {
        if self.link == LinkState::Failed {
            // a new session gets a fresh set of reconnect attempts
            info!("signaling channel retrying relay for new session {}", session_id);
            self.link = LinkState::Disconnected;
            self.reconnect.succeed();
        }
        self.queues(session_id).subscribed = true;
        if self.link == LinkState::Connected {
            if let Err(e) = self.relay.join(session_id) {
                self.link_dropped(&format!("join failed: {}", e));
            }
        }
        debug!("subscribed to session {}", session_id);
    }

    /// Stop receiving for a session.  Anything still queued outbound (a bye) keeps going.
    pub fn unsubscribe(&mut self, session_id: &str) {
        let remove = match self.sessions.get_mut(session_id) {
            Some(q) => {
                q.subscribed = false;
                q.inbound.clear();
                q.outbound.is_empty()
            }
            None => return,
        };
        if self.link == LinkState::Connected {
            let _res = self.relay.leave(session_id);
        }
        if remove {
            self.forget(session_id);
        }
        debug!("unsubscribed from session {}", session_id);
    }

    fn forget(&mut self, session_id: &str) {
        self.sessions.remove(session_id);
        self.rotation.retain(|s| s != session_id);
    }

    /// Queue a message for delivery.  Never blocks, failures come back from poll.
    pub fn send(&mut self, mut msg: SignalingMessage) {
        self.counter += 1;
        msg.msg_id = Some(format!("{}-{}", self.origin, self.counter));
        let pending = Pending {
            text: msg.as_json().to_string(),
            kind: msg.kind(),
            backoff: Backoff::new(),
        };
        trace!("queue {} for {}", msg.kind(), msg.session_id);
        self.queues(&msg.session_id).outbound.push_back(pending);
    }

    /// Messages received for a session, in arrival order.  The iterator reads more from
    /// the relay whenever the session's queue runs dry.
    pub fn receive<'a>(&'a mut self, session_id: &str) -> Incoming<'a, R> {
        Incoming {
            channel: self,
            session_id: String::from(session_id),
        }
    }

    /// Drive the channel: reconnect, read, dispatch.  Returns what happened.
    pub fn poll(&mut self, now: u128) -> Vec<ChannelEvent> {
        if self.link == LinkState::Disconnected && self.reconnect.ready(now) {
            self.try_connect(now);
        }
        match self.link {
            LinkState::Connected => {
                self.pump_inbound();
                self.dispatch(now);
            }
            LinkState::Disconnected => self.age_pending(now),
            LinkState::Failed => self.fail_all("relay unreachable"),
        }
        self.events.drain(..).collect()
    }

    /// drop the relay connection and all queues
    pub fn shutdown(&mut self) {
        self.relay.disconnect();
        self.sessions.clear();
        self.rotation.clear();
        self.link = LinkState::Disconnected;
    }

    fn try_connect(&mut self, now: u128) {
        match self.relay.connect() {
            Ok(()) => {
                self.reconnect.succeed();
                self.link = LinkState::Connected;
                if self.ever_connected {
                    info!("signaling channel reconnected");
                    self.stats.reconnects += 1;
                    self.events.push_back(ChannelEvent::Reconnected);
                }
                self.ever_connected = true;
                let rooms: Vec<String> = self
                    .sessions
                    .iter()
                    .filter(|(_, q)| q.subscribed)
                    .map(|(id, _)| id.clone())
                    .collect();
                for id in rooms {
                    if let Err(e) = self.relay.join(&id) {
                        self.link_dropped(&format!("rejoin of {} failed: {}", id, e));
                        return;
                    }
                }
            }
            Err(e) => {
                let policy = RetryPolicy {
                    max_attempts: self.config.reconnect_limit.max(1),
                    ..self.config.retry
                };
                if self.reconnect.fail(now, &policy) {
                    warn!(
                        "relay connect failed ({} so far): {}",
                        self.reconnect.failures(),
                        e
                    );
                } else {
                    warn!("relay connect failed, giving up: {}", e);
                    self.link = LinkState::Failed;
                }
            }
        }
    }

    fn link_dropped(&mut self, why: &str) {
        warn!("signaling link dropped: {}", why);
        self.relay.disconnect();
        self.link = LinkState::Disconnected;
    }

    fn pump_inbound(&mut self) {
        for _ in 0..MAX_READS_PER_POLL {
            match self.relay.recv_text() {
                Ok(Some(text)) => self.accept(&text),
                Ok(None) => break,
                Err(e) => {
                    self.link_dropped(&format!("read failed: {}", e));
                    break;
                }
            }
        }
    }

    fn accept(&mut self, text: &str) {
        let msg = match SignalingMessage::from_string(text) {
            Ok(m) => m,
            Err(e) => {
                self.stats.malformed += 1;
                warn!("dropping malformed signaling frame: {} ({})", e, text);
                return;
            }
        };
        if let Some(id) = &msg.msg_id {
            if id.split('-').next() == Some(self.origin.as_str()) {
                self.stats.echoes += 1;
                return;
            }
        }
        let queues = match self.sessions.get_mut(&msg.session_id) {
            Some(q) if q.subscribed => q,
            _ => {
                debug!("no subscriber for session {}, dropping {}", msg.session_id, msg.kind());
                return;
            }
        };
        if let Some(id) = &msg.msg_id {
            if !queues.remember(id) {
                self.stats.duplicates += 1;
                debug!("duplicate {} {} dropped", msg.kind(), id);
                return;
            }
        }
        self.stats.received += 1;
        queues.inbound.push_back(msg);
    }

    fn dispatch(&mut self, now: u128) {
        let mut budget = self.config.dispatch_budget.max(1);
        while budget > 0 && self.link == LinkState::Connected {
            let mut progressed = false;
            for _ in 0..self.rotation.len() {
                if budget == 0 || self.link != LinkState::Connected {
                    break;
                }
                let id = match self.rotation.pop_front() {
                    Some(id) => id,
                    None => break,
                };
                self.rotation.push_back(id.clone());
                if self.send_head(&id, now) {
                    progressed = true;
                    budget -= 1;
                }
            }
            if !progressed {
                break;
            }
        }
        self.sweep_unsubscribed();
    }

    /// try the head message of one session, true if it went out
    fn send_head(&mut self, session_id: &str, now: u128) -> bool {
        let text = match self.sessions.get(session_id).and_then(|q| q.outbound.front()) {
            Some(p) if p.backoff.ready(now) => p.text.clone(),
            _ => return false,
        };
        match self.relay.send_text(&text) {
            Ok(()) => {
                if let Some(p) = self
                    .sessions
                    .get_mut(session_id)
                    .and_then(|q| q.outbound.pop_front())
                {
                    self.stats.sent += 1;
                    if p.backoff.failures() > 0 {
                        self.stats.resent += 1;
                    }
                    trace!("sent {} for {}", p.kind, session_id);
                }
                true
            }
            Err(e) => {
                self.fail_head(session_id, now, &e.to_string());
                self.link_dropped(&format!("send failed: {}", e));
                false
            }
        }
    }

    /// count a failed attempt on the head message, give up on it when out of attempts
    fn fail_head(&mut self, session_id: &str, now: u128, why: &str) {
        let policy = self.config.retry;
        let exhausted = match self
            .sessions
            .get_mut(session_id)
            .and_then(|q| q.outbound.front_mut())
        {
            Some(p) => !p.backoff.fail(now, &policy),
            None => false,
        };
        if exhausted {
            if let Some(p) = self
                .sessions
                .get_mut(session_id)
                .and_then(|q| q.outbound.pop_front())
            {
                warn!(
                    "giving up on {} for {} after {} attempts",
                    p.kind,
                    session_id,
                    p.backoff.failures()
                );
                self.stats.given_up += 1;
                self.events.push_back(ChannelEvent::Unavailable {
                    session_id: String::from(session_id),
                    reason: format!("{} undeliverable: {}", p.kind, why),
                });
            }
        }
    }

    /// while the link is down, every message that was due counts an attempt
    fn age_pending(&mut self, now: u128) {
        let due: Vec<String> = self
            .sessions
            .iter()
            .filter(|(_, q)| q.outbound.front().map(|p| p.backoff.ready(now)).unwrap_or(false))
            .map(|(id, _)| id.clone())
            .collect();
        for id in due {
            self.fail_head(&id, now, "relay disconnected");
        }
        self.sweep_unsubscribed();
    }

    fn fail_all(&mut self, why: &str) {
        let ids: Vec<String> = self
            .sessions
            .iter()
            .filter(|(_, q)| q.subscribed || !q.outbound.is_empty())
            .map(|(id, _)| id.clone())
            .collect();
        for id in ids {
            let dropped = self
                .sessions
                .get_mut(&id)
                .map(|q| {
                    let n = q.outbound.len();
                    q.outbound.clear();
                    n
                })
                .unwrap_or(0);
            self.stats.given_up += dropped as u64;
            self.events.push_back(ChannelEvent::Unavailable {
                session_id: id.clone(),
                reason: String::from(why),
            });
            self.forget(&id);
        }
    }

    fn sweep_unsubscribed(&mut self) {
        let done: Vec<String> = self
            .sessions
            .iter()
            .filter(|(_, q)| !q.subscribed && q.outbound.is_empty())
            .map(|(id, _)| id.clone())
            .collect();
        for id in done {
            self.forget(&id);
        }
    }
}

/// Lazy stream of a session's inbound messages, see [`SignalingChannel::receive`]
pub struct Incoming<'a, R: Relay> {
    channel: &'a mut SignalingChannel<R>,
    session_id: String,
}

impl<'a, R: Relay> Iterator for Incoming<'a, R> {
    type Item = SignalingMessage;

    fn next(&mut self) -> Option<SignalingMessage> {
        let empty = self
            .channel
            .sessions
            .get(&self.session_id)
            .map(|q| q.inbound.is_empty())
            .unwrap_or(true);
        if empty && self.channel.link == LinkState::Connected {
            self.channel.pump_inbound();
        }
        self.channel
            .sessions
            .get_mut(&self.session_id)
            .and_then(|q| q.inbound.pop_front())
    }
}
