//! Two engines singing to each other over the in-memory relay and the loopback
//! transport, on a simulated clock.
use std::sync::mpsc::{self, Receiver};

use duet_sync::{
    common::duet_config::DuetConfig,
    engine::duet_engine::{DuetEngine, EngineEvent},
    media::{audio_frame::Playout, transform::Passthrough},
    session::state::{SessionState, StateChange, Trigger},
    signaling::memory_relay::{MemoryHub, MemoryRelay},
    transport::loopback::LoopbackTransport,
};

type Engine = DuetEngine<MemoryRelay, LoopbackTransport>;

const TICK: u128 = 10_000;

fn engine(hub: &MemoryHub, transport: LoopbackTransport) -> (Engine, Receiver<EngineEvent>) {
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

/// run both engines until `done` or `limit`, returns the time reached
fn run_until(
    host: &mut Engine,
    guest: &mut Engine,
    mut now: u128,
    limit: u128,
    done: impl Fn(&Engine, &Engine) -> bool,
) -> u128 {
    while now < limit && !done(host, guest) {
        now += TICK;
        host.process(now);
        guest.process(now);
    }
    now
}

#[test]
fn host_and_guest_sing_together() {
    let hub = MemoryHub::new();
    let (host_end, guest_end) = LoopbackTransport::pair();
    let (mut host, host_events) = engine(&hub, host_end);
    let (mut guest, guest_events) = engine(&hub, guest_end);
    let playout = guest.take_playout_source().unwrap();
    assert!(guest.take_playout_source().is_none());

    let id = host.create_session(0).unwrap();
    // the host's offer goes out before the guest is even there
    let mut now = 0;
    while now < 300_000 {
        now += TICK;
        host.process(now);
    }
    guest.join_session(&id, now).unwrap();

    now = run_until(&mut host, &mut guest, now, 10_000_000, |h, g| {
        h.state() == SessionState::Active && g.state() == SessionState::Active
    });
    assert_eq!(host.state(), SessionState::Active);
    assert_eq!(guest.state(), SessionState::Active);
    assert!(!host.is_unsynchronized());
    assert!(!guest.is_unsynchronized());

    // both ends agree on the shared clock (the simulated clocks are identical)
    let host_offset = host.current_offset().unwrap();
    let guest_offset = guest.current_offset().unwrap();
    assert!(host_offset.offset_us.abs() <= TICK as i64);
    assert_eq!(host_offset.offset_us, -guest_offset.offset_us);
    let (local, remote) = host.schedule_start(now, 3_000_000).unwrap();
    assert_eq!(local, now + 3_000_000);
    assert!((remote as i128 - local as i128).abs() <= TICK as i128);

    let host_path: Vec<SessionState> = changes(&host_events).iter().map(|c| c.to).collect();
    assert_eq!(
        host_path,
        vec![SessionState::Negotiating, SessionState::Syncing, SessionState::Active]
    );
    let guest_path: Vec<SessionState> = changes(&guest_events).iter().map(|c| c.to).collect();
    assert_eq!(
        guest_path,
        vec![SessionState::Negotiating, SessionState::Syncing, SessionState::Active]
    );

    // one frame per 20 ms, muted for the last stretch
    let capture = host.capture_sink();
    for i in 0..200u128 {
        if i == 160 {
            host.set_mute(true);
        }
        now += TICK;
        if i % 2 == 0 {
            assert!(capture.offer((now, vec![7; 16])));
        }
        host.process(now);
        guest.process(now);
    }

    let mut last_seq = 0;
    let mut frames = 0;
    let mut muted = 0;
    for item in playout.drain() {
        if let Playout::Frame(frame) = item {
            assert!(frame.seq > last_seq);
            last_seq = frame.seq;
            frames += 1;
            if frame.payload.iter().all(|b| *b == 0) {
                muted += 1;
            } else {
                assert_eq!(frame.payload, vec![7; 16]);
            }
        }
    }
    assert!(frames >= 80, "only {} frames played", frames);
    assert!(muted >= 5);

    let metrics = guest.latest_metrics().unwrap();
    assert!(metrics.delivered > 0);
    assert_eq!(metrics.loss_rate, 0.0);
    assert!(host.latest_metrics().unwrap().rtt_mean_ms > 0.0);
    // the guest never probes but still reports the round trip
    assert!(metrics.rtt_mean_ms > 0.0);

    host.disconnect(now);
    assert_eq!(host.state(), SessionState::Ended);
    run_until(&mut host, &mut guest, now, now + 1_000_000, |_, g| {
        g.state() == SessionState::Ended
    });
    assert_eq!(guest.state(), SessionState::Ended);
    let last = changes(&guest_events).pop().unwrap();
    assert!(last.reason == Trigger::Bye || last.reason == Trigger::TransportLost);
    assert!(guest.session().is_none());
}

#[test]
fn nobody_answers() {
    let hub = MemoryHub::new();
    let (host_end, _guest_end) = LoopbackTransport::pair();
    let (mut host, events) = engine(&hub, host_end);
    host.create_session(0).unwrap();
    let mut now = 0;
    while now < 31_000_000 {
        now += 100_000;
        host.process(now);
    }
    assert_eq!(host.state(), SessionState::Failed);
    let last = changes(&events).pop().unwrap();
    assert_eq!(last.from, SessionState::Negotiating);
    assert_eq!(last.reason, Trigger::NegotiationTimeout);
    // a fresh session can be started after a failure
    assert!(host.create_session(now).is_ok());
}

#[test]
fn relay_down_fails_the_join() {
    let hub = MemoryHub::new();
    hub.set_offline(true);
    let (_host_end, guest_end) = LoopbackTransport::pair();
    let (mut guest, events) = engine(&hub, guest_end);
    guest.join_session("123456", 0).unwrap();
    let mut now = 0;
    while now < 29_000_000 && guest.state() == SessionState::Negotiating {
        now += 100_000;
        guest.process(now);
    }
    assert_eq!(guest.state(), SessionState::Failed);
    assert!(matches!(
        changes(&events).pop().unwrap().reason,
        Trigger::SignalingUnavailable(_)
    ));
}

#[test]
fn guest_leaving_ends_the_host() {
    let hub = MemoryHub::new();
    let (host_end, guest_end) = LoopbackTransport::pair();
    let (mut host, host_events) = engine(&hub, host_end);
    let (mut guest, _guest_events) = engine(&hub, guest_end);
    let id = host.create_session(0).unwrap();
    guest.join_session(&id, 0).unwrap();
    let now = run_until(&mut host, &mut guest, 0, 5_000_000, |h, _| {
        h.state() == SessionState::Syncing
    });
    assert_eq!(host.state(), SessionState::Syncing);

    // leaving mid probe still tears everything down
    guest.disconnect(now);
    guest.disconnect(now);
    assert_eq!(guest.state(), SessionState::Ended);
    run_until(&mut host, &mut guest, now, now + 1_000_000, |h, _| {
        h.state() == SessionState::Ended
    });
    assert_eq!(host.state(), SessionState::Ended);
    assert_eq!(
        changes(&host_events)
            .iter()
            .filter(|c| c.to == SessionState::Ended)
            .count(),
        1
    );
}
