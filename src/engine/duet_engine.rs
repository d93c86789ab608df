//! The DuetEngine ties a duet session together.
//!
//! The engine drives off the [`DuetEngine::process`] function.  Each call handles, in
//! order: the signaling channel, inbound signaling messages, transport events, session
//! timeouts, clock probes, captured frames, inbound frames, playout and metrics.  Nothing
//! in there blocks, and everything is timed off the `now` passed in, so the whole engine
//! can be driven by a simulated clock in tests.
//!
//! Media threads talk to the engine through bounded queues: the capture side offers
//! chunks into [`DuetEngine::capture_sink`], the playback side takes one [`Playout`] per
//! frame interval out of [`DuetEngine::take_playout_source`].  State changes and metrics
//! snapshots go out over the mpsc Sender given to [`DuetEngine::new`].
use std::sync::mpsc::{self, Receiver, Sender};

use log::{debug, info, trace, warn};
use rand::Rng;
use serde::Serialize;

use crate::{
    clock::{
        sample::ClockOffset,
        sync_engine::{ClockEvent, ClockSyncEngine},
    },
    common::{duet_config::DuetConfig, duet_error::DuetError, stream_time_stat::MicroTimer},
    media::{
        audio_frame::{AudioFrame, Playout},
        frame_queue::{frame_queue, FrameSink, FrameSource},
        jitter_buffer::JitterBuffer,
        transform::{FrameTransform, OutboundStage},
    },
    metrics::{MetricsCollector, MetricsSnapshot},
    session::{
        state::{Role, SessionState, StateChange, Trigger},
        state_machine::Session,
    },
    signaling::{
        channel::{ChannelEvent, ChannelStats, SignalingChannel},
        message::{IceCandidate, MessageBody, SessionDescription, SharedEstimate, SignalingMessage},
        relay::Relay,
    },
    transport::{Transport, TransportEvent},
};

// playout ticks made up in one process call after a stall
const MAX_PLAYOUT_CATCH_UP: usize = 5;
// signaling messages handled in one process call, the rest wait for the next one
pub const MAX_MESSAGES_PER_PASS: usize = 64;

/// A captured chunk of audio: capture time and payload
pub type Capture = (u128, Vec<u8>);

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum EngineEvent {
    StateChanged(StateChange),
    Metrics(MetricsSnapshot),
}

pub struct DuetEngine<R: Relay, T: Transport> {
    config: DuetConfig,
    channel: SignalingChannel<R>,
    transport: T,
    session: Option<Session>,
    last_state: SessionState,
    torn_down: bool,
    clock: ClockSyncEngine,
    jitter: JitterBuffer,
    metrics: MetricsCollector,
    outbound: OutboundStage,
    events: Sender<EngineEvent>,
    transport_tx: Sender<TransportEvent>,
    transport_rx: Receiver<TransportEvent>,
    inbound_sink: FrameSink<AudioFrame>,
    inbound: FrameSource<AudioFrame>,
    capture_sink: FrameSink<Capture>,
    capture: FrameSource<Capture>,
    playout_sink: FrameSink<Playout>,
    playout_source: Option<FrameSource<Playout>>,
    playout_timer: MicroTimer,
    pending_candidates: Vec<IceCandidate>,
    remote_description_set: bool,
}

impl<R: Relay, T: Transport> DuetEngine<R, T> {
    pub fn new(
        relay: R,
        transport: T,
        transform: Box<dyn FrameTransform>,
        config: DuetConfig,
        events: Sender<EngineEvent>,
        now: u128,
    ) -> DuetEngine<R, T> {
        let (transport_tx, transport_rx) = mpsc::channel();
        let (inbound_sink, inbound) = frame_queue(config.frame_queue_capacity);
        let (capture_sink, capture) = frame_queue(config.frame_queue_capacity);
        let (playout_sink, playout_source) = frame_queue(config.frame_queue_capacity);
        DuetEngine {
            channel: SignalingChannel::new(relay, config.channel),
            transport: transport,
            session: None,
            last_state: SessionState::Idle,
            torn_down: true,
            clock: ClockSyncEngine::new(config.clock, now),
            jitter: JitterBuffer::build(config.jitter),
            metrics: MetricsCollector::build(config.metrics_interval, now),
            outbound: OutboundStage::new(transform),
            events: events,
            transport_tx,
            transport_rx,
            inbound_sink,
            inbound,
            capture_sink,
            capture,
            playout_sink,
            playout_source: Some(playout_source),
            playout_timer: MicroTimer::new(now, config.frame_interval),
            pending_candidates: vec![],
            remote_description_set: false,
            config: config,
        }
    }

    pub fn state(&self) -> SessionState {
        self.session
            .as_ref()
            .map(|s| s.state())
            .unwrap_or(self.last_state)
    }
    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }
    pub fn session_id(&self) -> Option<&str> {
        self.session.as_ref().map(|s| s.id())
    }
    pub fn is_unsynchronized(&self) -> bool {
        self.session
            .as_ref()
            .map(|s| s.is_unsynchronized())
            .unwrap_or(false)
    }
    pub fn channel_stats(&self) -> &ChannelStats {
        self.channel.stats()
    }
    pub fn latest_metrics(&self) -> Option<MetricsSnapshot> {
        self.metrics.latest().cloned()
    }
    pub fn current_offset(&self) -> Result<ClockOffset, DuetError> {
        self.clock.current_offset()
    }
    /// local and peer start times for playback `lead` usec from now
    pub fn schedule_start(&self, now: u128, lead: u128) -> Result<(u128, u128), DuetError> {
        self.clock.schedule_start(now, lead)
    }
    pub fn set_pitch(&mut self, semitones: f32) {
        self.outbound.set_pitch(semitones);
    }
    pub fn set_mute(&mut self, mute: bool) {
        self.outbound.set_mute(mute);
    }
    pub fn get_mute(&self) -> bool {
        self.outbound.get_mute()
    }
    /// where the capture thread puts its chunks
    pub fn capture_sink(&self) -> FrameSink<Capture> {
        self.capture_sink.clone()
    }
    /// the playback thread's end, there is only one
    pub fn take_playout_source(&mut self) -> Option<FrameSource<Playout>> {
        self.playout_source.take()
    }

    /// Host a new session.  Returns the six digit id the partner joins with.
    pub fn create_session(&mut self, now: u128) -> Result<String, DuetError> {
        let id = format!("{:06}", rand::thread_rng().gen_range(0..1_000_000));
        self.start_session(&id, Role::Host, now)?;
        Ok(id)
    }

    /// Join the session a host created
    pub fn join_session(&mut self, session_id: &str, now: u128) -> Result<(), DuetError> {
        let session_id = session_id.trim();
        if session_id.is_empty() {
            return Err(DuetError::MalformedMessage(String::from("empty session id")));
        }
        self.start_session(session_id, Role::Guest, now)
    }

    /// Leave the session.  Safe to call any number of times.
    pub fn disconnect(&mut self, now: u128) {
        match self.session.as_ref().map(|s| s.state()) {
            Some(state) if state.is_live() => self.trigger(Trigger::LocalDisconnect, now),
            _ => debug!("disconnect without a live session"),
        }
    }

    /// Leave any session and drop the relay connection, the bye goes out first
    pub fn shutdown(&mut self, now: u128) {
        self.disconnect(now);
        self.channel.poll(now);
        self.channel.shutdown();
    }

    /// Run one pass of the event loop
    pub fn process(&mut self, now: u128) {
        self.poll_channel(now);
        self.handle_signaling(now);
        self.handle_transport_events(now);
        self.check_timeouts(now);
        self.run_clock(now);
        self.send_captured();
        self.take_inbound(now);
        self.run_playout(now);
        self.publish_metrics(now);
        // flush whatever this pass queued
        self.poll_channel(now);
    }

    /// Send one captured chunk to the peer.  False if it could not go out.
    pub fn send_local_frame(&mut self, payload: Vec<u8>, capture_time: u128) -> bool {
        match self.state() {
            SessionState::Syncing | SessionState::Active => (),
            _ => return false,
        }
        let frame = self.outbound.prepare(payload, capture_time);
        match self.transport.send_frame(&frame) {
            Ok(()) => true,
            Err(e) => {
                trace!("frame {} not sent: {}", frame.seq, e);
                false
            }
        }
    }

    fn start_session(&mut self, id: &str, role: Role, now: u128) -> Result<(), DuetError> {
        if let Some(s) = &self.session {
            if s.state().is_live() {
                return Err(DuetError::SessionBusy(String::from(s.id())));
            }
        }
        self.transport
            .create_local_track_source()
            .map_err(|e| DuetError::LocalResource(e.to_string()))?;
        self.reset_media(now);
        self.transport
            .subscribe(self.transport_tx.clone(), self.inbound_sink.clone());

        let mut session = Session::new(id, role, self.config.timeouts);
        let change = session.apply(Trigger::Start, now)?;
        self.session = Some(session);
        self.torn_down = false;
        self.channel.subscribe(id);
        if let Some(change) = change {
            self.entered(change, now);
        }
        info!("{} session {} started", role, id);

        if role == Role::Host {
            match self.transport.create_offer() {
                Ok(offer) => {
                    if let Some(s) = self.session.as_mut() {
                        s.set_local_description(offer.clone());
                    }
                    self.channel
                        .send(SignalingMessage::new(id, MessageBody::Offer(offer)));
                    self.trigger(Trigger::OfferExchanged, now);
                }
                Err(e) => {
                    let err = DuetError::LocalResource(format!("offer failed: {}", e));
                    self.trigger(Trigger::LocalError(err.to_string()), now);
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    fn reset_media(&mut self, now: u128) {
        self.clock.reset();
        self.jitter.reset();
        self.metrics.reset(now);
        self.outbound.reset();
        self.pending_candidates.clear();
        self.remote_description_set = false;
        while self.transport_rx.try_recv().is_ok() {}
        self.inbound.drain();
        self.capture.drain();
    }

    fn trigger(&mut self, trigger: Trigger, now: u128) {
        let result = match self.session.as_mut() {
            Some(s) => s.apply(trigger, now),
            None => return,
        };
        match result {
            Ok(Some(change)) => self.entered(change, now),
            Ok(None) => (),
            Err(e) => warn!("{}", e),
        }
    }

    fn entered(&mut self, change: StateChange, now: u128) {
        let _res = self.events.send(EngineEvent::StateChanged(change.clone()));
        let role = match &self.session {
            Some(s) => s.role(),
            None => return,
        };
        match change.to {
            SessionState::Syncing => {
                if role == Role::Host {
                    self.clock.reset();
                    self.clock.start(now);
                }
            }
            SessionState::Active if change.from != SessionState::Active => {
                self.jitter.reset();
                self.playout_timer.reset(now);
            }
            SessionState::Ended | SessionState::Failed => {
                // no point saying bye to a peer that left or a relay that is gone
                let send_bye = !matches!(
                    change.reason,
                    Trigger::Bye | Trigger::SignalingUnavailable(_)
                );
                self.teardown(send_bye, &change.reason);
            }
            _ => (),
        }
    }

    fn teardown(&mut self, send_bye: bool, reason: &Trigger) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        if let Some(session) = self.session.take() {
            self.last_state = session.state();
            if send_bye {
                self.channel.send(SignalingMessage::new(
                    session.id(),
                    MessageBody::Bye {
                        reason: Some(reason.to_string()),
                    },
                ));
            }
            self.channel.unsubscribe(session.id());
            let lasted = chrono::Utc::now() - session.created_at();
            info!(
                "session {} {} after {}s",
                session.id(),
                session.state(),
                lasted.num_seconds()
            );
        }
        self.clock.reset();
        self.jitter.reset();
        self.transport.close();
        self.pending_candidates.clear();
        self.remote_description_set = false;
        while self.transport_rx.try_recv().is_ok() {}
        self.inbound.drain();
    }

    fn poll_channel(&mut self, now: u128) {
        for event in self.channel.poll(now) {
            match event {
                ChannelEvent::Unavailable { session_id, reason } => {
                    if self.session_id() == Some(session_id.as_str()) {
                        warn!("{}", DuetError::SignalingUnavailable(reason.clone()));
                        self.trigger(Trigger::SignalingUnavailable(reason), now);
                    }
                }
                ChannelEvent::Reconnected => info!("signaling relay reconnected"),
            }
        }
    }

    fn handle_signaling(&mut self, now: u128) {
        let id = match &self.session {
            Some(s) => String::from(s.id()),
            None => return,
        };
        let messages: Vec<SignalingMessage> =
            self.channel.receive(&id).take(MAX_MESSAGES_PER_PASS).collect();
        for msg in messages {
            if self.session.is_none() {
                break;
            }
            self.handle_message(msg, now);
        }
    }

    fn handle_message(&mut self, msg: SignalingMessage, now: u128) {
        let (role, state) = match &self.session {
            Some(s) => (s.role(), s.state()),
            None => return,
        };
        if msg.is_clock() && !matches!(state, SessionState::Syncing | SessionState::Active) {
            warn!(
                "{}",
                DuetError::MalformedMessage(format!("{} while {}", msg.kind(), state))
            );
            return;
        }
        trace!("handling {}", msg);
        match msg.body {
            MessageBody::Offer(desc) => self.on_offer(role, state, desc, now),
            MessageBody::Answer(desc) => self.on_answer(role, state, desc, now),
            MessageBody::IceCandidate(candidate) => self.on_candidate(candidate),
            MessageBody::ClockPing {
                seq,
                send_time: _,
                estimate,
                rtt_us,
            } => self.on_ping(role, &msg.session_id, seq, estimate, rtt_us, now),
            MessageBody::ClockPong {
                seq,
                receive_time,
                send_time,
            } => self.on_pong(role, seq, receive_time, send_time, now),
            MessageBody::Bye { reason } => {
                info!("peer left: {}", reason.unwrap_or_default());
                self.trigger(Trigger::Bye, now);
            }
        }
    }

    fn on_offer(&mut self, role: Role, state: SessionState, desc: SessionDescription, now: u128) {
        if role != Role::Guest || state != SessionState::Negotiating || self.remote_description_set {
            debug!("ignoring offer as {} in {}", role, state);
            return;
        }
        if let Err(e) = self.transport.set_remote_description(&desc) {
            warn!("{}", DuetError::MalformedMessage(format!("offer rejected: {}", e)));
            return;
        }
        self.accept_remote(desc);
        self.trigger(Trigger::OfferExchanged, now);
        match self.transport.create_answer() {
            Ok(answer) => {
                let id = match self.session.as_mut() {
                    Some(s) => {
                        s.set_local_description(answer.clone());
                        String::from(s.id())
                    }
                    None => return,
                };
                self.channel
                    .send(SignalingMessage::new(&id, MessageBody::Answer(answer)));
                self.trigger(Trigger::AnswerExchanged, now);
            }
            Err(e) => self.trigger(Trigger::LocalError(format!("answer failed: {}", e)), now),
        }
    }

    fn on_answer(&mut self, role: Role, state: SessionState, desc: SessionDescription, now: u128) {
        if role != Role::Host || state != SessionState::Negotiating || self.remote_description_set {
            debug!("ignoring answer as {} in {}", role, state);
            return;
        }
        if let Err(e) = self.transport.set_remote_description(&desc) {
            warn!("{}", DuetError::MalformedMessage(format!("answer rejected: {}", e)));
            return;
        }
        self.accept_remote(desc);
        self.trigger(Trigger::AnswerExchanged, now);
    }

    /// remote description is in, candidates held so far can go to the transport
    fn accept_remote(&mut self, desc: SessionDescription) {
        self.remote_description_set = true;
        if let Some(s) = self.session.as_mut() {
            s.set_remote_description(desc);
        }
        let held: Vec<IceCandidate> = self.pending_candidates.drain(..).collect();
        for candidate in held {
            self.on_candidate(candidate);
        }
    }

    fn on_candidate(&mut self, candidate: IceCandidate) {
        if !self.remote_description_set {
            debug!("holding candidate until the remote description is set");
            self.pending_candidates.push(candidate);
            return;
        }
        if let Err(e) = self.transport.add_ice_candidate(&candidate) {
            warn!("candidate {} rejected: {}", candidate.candidate, e);
        }
    }

    fn on_ping(
        &mut self,
        role: Role,
        session_id: &str,
        seq: u64,
        estimate: Option<SharedEstimate>,
        rtt_us: Option<f64>,
        now: u128,
    ) {
        if role != Role::Guest {
            return;
        }
        // the guest never probes, it shares the host's round trips
        if let Some(rtt) = rtt_us {
            self.metrics.record_rtt(rtt);
        }
        self.channel.send(SignalingMessage::new(
            session_id,
            MessageBody::ClockPong {
                seq,
                receive_time: now,
                send_time: now,
            },
        ));
        let event = match estimate {
            Some(estimate) => self.clock.adopt(estimate, now),
            None => self.clock.peer_resyncing(),
        };
        if let Some(event) = event {
            self.clock_event(role, event, now);
        }
    }

    fn on_pong(&mut self, role: Role, seq: u64, receive_time: u128, send_time: u128, now: u128) {
        if role != Role::Host {
            return;
        }
        match self.clock.on_pong(seq, receive_time, send_time, now) {
            Ok(event) => {
                if let Some(rtt) = self.clock.last_rtt() {
                    self.metrics.record_rtt(rtt);
                }
                if let Some(event) = event {
                    self.clock_event(role, event, now);
                }
            }
            Err(e) => debug!("{}", e),
        }
    }

    fn clock_event(&mut self, role: Role, event: ClockEvent, now: u128) {
        match event {
            ClockEvent::Synchronized(offset) => {
                info!("shared clock established {}", offset);
                self.trigger(Trigger::ClockSynchronized, now);
            }
            ClockEvent::ResyncRequired => {
                self.clock.reset();
                self.trigger(Trigger::ResyncRequired, now);
                if role == Role::Host && !self.clock.is_running() && self.state() == SessionState::Syncing {
                    self.clock.start(now);
                }
            }
        }
    }

    fn handle_transport_events(&mut self, now: u128) {
        while let Ok(event) = self.transport_rx.try_recv() {
            let id = match &self.session {
                Some(s) => String::from(s.id()),
                None => continue,
            };
            match event {
                TransportEvent::LocalCandidate(candidate) => {
                    self.channel
                        .send(SignalingMessage::new(&id, MessageBody::IceCandidate(candidate)));
                }
                TransportEvent::PathConfirmed => self.trigger(Trigger::PathConfirmed, now),
                TransportEvent::PeerLost(why) => {
                    warn!("{}: {}", DuetError::TransportLost, why);
                    self.trigger(Trigger::TransportLost, now);
                }
            }
        }
    }

    fn check_timeouts(&mut self, now: u128) {
        let due = match &self.session {
            Some(s) => s.check_timeouts(now),
            None => None,
        };
        if let Some(trigger) = due {
            match trigger {
                Trigger::SyncTimeout => warn!("{}", DuetError::SyncTimeout),
                Trigger::NegotiationTimeout => warn!("{}", DuetError::NegotiationTimeout),
                _ => (),
            }
            self.trigger(trigger, now);
        }
    }

    fn run_clock(&mut self, now: u128) {
        let id = match &self.session {
            Some(s) if s.role() == Role::Host => String::from(s.id()),
            _ => return,
        };
        if let Some((seq, send_time)) = self.clock.poll_probe(now) {
            self.channel.send(SignalingMessage::new(
                &id,
                MessageBody::ClockPing {
                    seq,
                    send_time,
                    estimate: self.clock.shared_estimate(),
                    rtt_us: self.clock.last_rtt(),
                },
            ));
        }
    }

    fn send_captured(&mut self) {
        for (capture_time, payload) in self.capture.drain() {
            self.send_local_frame(payload, capture_time);
        }
    }

    fn take_inbound(&mut self, now: u128) {
        let frames = self.inbound.drain();
        if self.state() != SessionState::Active {
            return;
        }
        for frame in frames {
            let frame = frame.arrived(now);
            self.metrics.record_transit(&frame);
            self.jitter.push(frame);
        }
    }

    fn run_playout(&mut self, now: u128) {
        if self.state() != SessionState::Active {
            return;
        }
        let mut ticks = 0;
        while self.playout_timer.expired(now) && ticks < MAX_PLAYOUT_CATCH_UP {
            self.playout_timer.advance();
            ticks += 1;
            let item = self.jitter.pop();
            if !self.playout_sink.offer(item) {
                trace!("playback is not keeping up");
            }
        }
        if self.playout_timer.expired(now) {
            debug!("playout fell behind, skipping ahead");
            self.playout_timer.reset(now);
        }
    }

    fn publish_metrics(&mut self, now: u128) {
        if !self.state().is_live() {
            return;
        }
        if let Some(snap) = self.metrics.poll(now, &self.jitter, self.clock.lost_probes()) {
            self.jitter.adapt(snap.jitter_variance);
            for gap in self.jitter.take_exceeded() {
                warn!("{}", gap);
            }
            debug!("metrics: {}", snap);
            let _res = self.events.send(EngineEvent::Metrics(snap));
        }
    }
}

#[cfg(test)]
mod test_duet_engine {
    use super::*;
    use crate::media::transform::Passthrough;
    use crate::signaling::memory_relay::{MemoryHub, MemoryRelay};
    use crate::transport::MockTransport;

    fn quiet_transport() -> MockTransport {
        let mut t = MockTransport::new();
        t.expect_create_local_track_source().returning(|| Ok(()));
        t.expect_subscribe().return_const(());
        t.expect_create_offer().returning(|| {
            Ok(SessionDescription {
                sdp: String::from("v=0 offer"),
            })
        });
        t.expect_create_answer().returning(|| {
            Ok(SessionDescription {
                sdp: String::from("v=0 answer"),
            })
        });
        t.expect_set_remote_description().returning(|_| Ok(()));
        t.expect_add_ice_candidate().returning(|_| Ok(()));
        t.expect_send_frame().returning(|_| Ok(()));
        t.expect_close().return_const(());
        t
    }

    fn engine(
        hub: &MemoryHub,
        transport: MockTransport,
    ) -> (DuetEngine<MemoryRelay, MockTransport>, Receiver<EngineEvent>) {
        let (tx, rx) = mpsc::channel();
        let engine = DuetEngine::new(
            hub.relay(),
            transport,
            Box::new(Passthrough::default()),
            DuetConfig::default(),
            tx,
            0,
        );
        (engine, rx)
    }

    fn changes(rx: &Receiver<EngineEvent>) -> Vec<StateChange> {
        rx.try_iter()
            .filter_map(|e| match e {
                EngineEvent::StateChanged(c) => Some(c),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn one_live_session_at_a_time() {
        let hub = MemoryHub::new();
        let (mut host, rx) = engine(&hub, quiet_transport());
        let id = host.create_session(0).unwrap();
        assert_eq!(id.len(), 6);
        assert_eq!(host.state(), SessionState::Negotiating);
        match host.create_session(1) {
            Err(DuetError::SessionBusy(busy)) => assert_eq!(busy, id),
            other => panic!("{:?}", other),
        }
        assert!(matches!(host.join_session("000001", 1), Err(DuetError::SessionBusy(_))));
        host.disconnect(2);
        assert_eq!(host.state(), SessionState::Ended);
        host.disconnect(3);
        let seen = changes(&rx);
        assert_eq!(seen.iter().filter(|c| c.to == SessionState::Ended).count(), 1);
        // the device is free again
        assert!(host.create_session(4).is_ok());
    }

    #[test]
    fn missing_microphone_is_a_local_resource_error() {
        let hub = MemoryHub::new();
        let mut t = MockTransport::new();
        t.expect_create_local_track_source()
            .returning(|| Err("no capture device".into()));
        let (mut host, _rx) = engine(&hub, t);
        assert!(matches!(host.create_session(0), Err(DuetError::LocalResource(_))));
        assert_eq!(host.state(), SessionState::Idle);
    }

    #[test]
    fn candidates_wait_for_remote_description() {
        let hub = MemoryHub::new();
        let mut t = MockTransport::new();
        let mut seq = mockall::Sequence::new();
        t.expect_create_local_track_source().returning(|| Ok(()));
        t.expect_subscribe().return_const(());
        t.expect_create_answer().returning(|| {
            Ok(SessionDescription {
                sdp: String::from("v=0 answer"),
            })
        });
        t.expect_set_remote_description()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        t.expect_add_ice_candidate()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        t.expect_close().return_const(());
        let (mut guest, _rx) = engine(&hub, t);
        guest.join_session("424242", 0).unwrap();
        guest.process(0);

        // a candidate overtakes the offer
        let candidate = SignalingMessage::new(
            "424242",
            MessageBody::IceCandidate(IceCandidate {
                candidate: String::from("candidate:1 1 udp 1 10.0.0.2 5000 typ host"),
                sdp_mid: None,
                sdp_mline_index: None,
            }),
        );
        let offer = SignalingMessage::new(
            "424242",
            MessageBody::Offer(SessionDescription {
                sdp: String::from("v=0 offer"),
            }),
        );
        hub.inject("424242", &candidate.as_json().to_string());
        guest.process(10);
        hub.inject("424242", &offer.as_json().to_string());
        guest.process(20);
        assert_eq!(guest.session().unwrap().remote_description().unwrap().sdp, "v=0 offer");
        assert_eq!(guest.session().unwrap().local_description().unwrap().sdp, "v=0 answer");
    }

    #[test]
    fn clock_messages_rejected_while_negotiating() {
        let hub = MemoryHub::new();
        let (mut guest, _rx) = engine(&hub, quiet_transport());
        guest.join_session("777777", 0).unwrap();
        guest.process(0);
        let ping = SignalingMessage::new(
            "777777",
            MessageBody::ClockPing {
                seq: 1,
                send_time: 5,
                estimate: Some(SharedEstimate {
                    offset_us: 10,
                    error_us: 100.0,
                }),
                rtt_us: None,
            },
        );
        hub.inject("777777", &ping.as_json().to_string());
        guest.process(10);
        assert!(guest.current_offset().is_err());
        assert_eq!(guest.state(), SessionState::Negotiating);
        // and no pong went back
        assert_eq!(guest.channel_stats().sent, 0);
    }

    #[test]
    fn transport_loss_ends_the_session() {
        let hub = MemoryHub::new();
        let (mut host, rx) = engine(&hub, quiet_transport());
        host.create_session(0).unwrap();
        host.transport_tx
            .send(TransportEvent::PeerLost(String::from("ice failed")))
            .unwrap();
        host.process(10);
        assert_eq!(host.state(), SessionState::Ended);
        let last = changes(&rx).pop().unwrap();
        assert_eq!(last.reason, Trigger::TransportLost);
    }

    #[test]
    fn negotiation_timeout_fails_the_host() {
        let hub = MemoryHub::new();
        let (mut host, rx) = engine(&hub, quiet_transport());
        host.create_session(0).unwrap();
        let mut now = 0;
        while now <= 30_000_000 {
            host.process(now);
            now += 500_000;
        }
        assert_eq!(host.state(), SessionState::Failed);
        let last = changes(&rx).pop().unwrap();
        assert_eq!(last.reason, Trigger::NegotiationTimeout);
        assert!(host.session().is_none());
    }

    #[test]
    fn relay_outage_fails_negotiation() {
        let hub = MemoryHub::new();
        hub.set_offline(true);
        let (mut host, rx) = engine(&hub, quiet_transport());
        host.create_session(0).unwrap();
        let mut now = 0;
        while now <= 20_000_000 && host.state() == SessionState::Negotiating {
            host.process(now);
            now += 100_000;
        }
        assert_eq!(host.state(), SessionState::Failed);
        assert!(matches!(
            changes(&rx).pop().unwrap().reason,
            Trigger::SignalingUnavailable(_)
        ));
    }

    #[test]
    fn frames_are_not_sent_before_the_path() {
        let hub = MemoryHub::new();
        let (mut host, _rx) = engine(&hub, quiet_transport());
        assert!(!host.send_local_frame(vec![1], 0));
        host.create_session(0).unwrap();
        assert!(!host.send_local_frame(vec![1], 0));
    }

    #[test]
    fn a_busy_relay_cannot_stall_one_pass() {
        let hub = MemoryHub::new();
        let (mut guest, _rx) = engine(&hub, quiet_transport());
        guest.join_session("424242", 0).unwrap();
        guest.process(0);
        for n in 0..100 {
            let candidate = SignalingMessage::new(
                "424242",
                MessageBody::IceCandidate(IceCandidate {
                    candidate: format!("candidate:{} 1 udp 1 10.0.0.1 5000 typ host", n),
                    sdp_mid: None,
                    sdp_mline_index: None,
                }),
            );
            hub.inject("424242", &candidate.as_json().to_string());
        }
        guest.process(10);
        assert_eq!(guest.pending_candidates.len(), MAX_MESSAGES_PER_PASS);
        guest.process(20);
        assert_eq!(guest.pending_candidates.len(), 100);
    }
}
