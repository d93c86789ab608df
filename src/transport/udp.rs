//! Plain udp media transport for the command line client.
//!
//! No ICE and no encryption: the SDP carries the address to send to and a random token.
//! The host candidate repeats that address, and when one of the configured STUN servers
//! answers at build time a server reflexive candidate follows it.  The receiver thread
//! probes every remote candidate until the peer answers from one of them, which confirms
//! the path and fixes where media goes.  Audio frames travel one per datagram, see
//! [`DuetPacket`].
use socket2::{Domain, SockAddr, Socket, Type};
use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket},
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::Sender,
        Arc, Mutex,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use log::{debug, info, warn};
use simple_error::bail;

use crate::common::box_error::BoxError;
use crate::media::{audio_frame::AudioFrame, frame_queue::FrameSink};
use crate::signaling::message::{IceCandidate, SessionDescription};
use crate::transport::{
    duet_packet::{DuetPacket, PacketKind},
    stun, Transport, TransportEvent,
};

const READ_TIMEOUT: Duration = Duration::from_millis(50);
const PROBE_INTERVAL: Duration = Duration::from_millis(250);
// probes double as keepalives once the path is up and no audio is flowing
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(1);
// silence from a confirmed peer for this long means it is gone
const PEER_TIMEOUT: Duration = Duration::from_secs(5);
// per STUN server, only paid once when the transport is built
const STUN_TIMEOUT: Duration = Duration::from_millis(800);
// low delay type of service
const LOW_DELAY_TOS: u32 = 0x10;

/// bind a udp socket with the low delay TOS bit set
pub fn low_delay_socket(port: u16) -> Result<UdpSocket, BoxError> {
    let raw_sock = Socket::new(Domain::IPV4, Type::DGRAM, None)?;
    if let Err(e) = raw_sock.set_tos(LOW_DELAY_TOS) {
        warn!("could not set TOS on media socket: {}", e);
    }
    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)), port);
    raw_sock.bind(&SockAddr::from(addr))?;
    Ok(UdpSocket::from(raw_sock))
}

#[derive(Default)]
struct Peer {
    /// where media goes, the first candidate until the peer answers from somewhere
    remote: Option<SocketAddr>,
    candidates: Vec<SocketAddr>,
    remote_token: Option<u32>,
    events: Option<Sender<TransportEvent>>,
    frames: Option<FrameSink<AudioFrame>>,
}

impl Peer {
    fn emit(&self, event: TransportEvent) {
        if let Some(tx) = &self.events {
            let _res = tx.send(event);
        }
    }
}

pub struct UdpTransport {
    sock: UdpSocket,
    advertised_ip: String,
    reflexive: Option<SocketAddr>,
    token: u32,
    peer: Arc<Mutex<Peer>>,
    running: Arc<AtomicBool>,
    confirmed: Arc<AtomicBool>,
    receiver: Option<JoinHandle<()>>,
    track: bool,
}

impl UdpTransport {
    /// `port` 0 picks any free port.  `advertised_ip` is what the peer should send to.
    /// `stun_servers` (`stun:host:port`) are asked for our outside address, none is fine.
    pub fn build(port: u16, advertised_ip: &str, stun_servers: &[String]) -> Result<UdpTransport, BoxError> {
        let sock = low_delay_socket(port)?;
        let reflexive = stun::discover(&sock, stun_servers, STUN_TIMEOUT);
        if reflexive.is_none() && !stun_servers.is_empty() {
            warn!("no stun server answered, offering the host candidate only");
        }
        sock.set_read_timeout(Some(READ_TIMEOUT))?;
        Ok(UdpTransport {
            sock: sock,
            advertised_ip: String::from(advertised_ip),
            reflexive: reflexive,
            token: rand::random::<u32>(),
            peer: Arc::new(Mutex::new(Peer::default())),
            running: Arc::new(AtomicBool::new(false)),
            confirmed: Arc::new(AtomicBool::new(false)),
            receiver: None,
            track: false,
        })
    }

    pub fn local_port(&self) -> Result<u16, BoxError> {
        Ok(self.sock.local_addr()?.port())
    }

    fn description(&self) -> Result<SessionDescription, BoxError> {
        let port = self.local_port()?;
        Ok(SessionDescription {
            sdp: format!(
                "v=0\r\no=- {} 1 IN IP4 {}\r\ns=duet\r\nc=IN IP4 {}\r\nt=0 0\r\nm=audio {} RTP/AVP 0\r\na=duet-token:{}\r\n",
                self.token, self.advertised_ip, self.advertised_ip, port, self.token
            ),
        })
    }

    pub fn reflexive_addr(&self) -> Option<SocketAddr> {
        self.reflexive
    }

    fn candidates(&self) -> Result<Vec<IceCandidate>, BoxError> {
        let port = self.local_port()?;
        let mut lines = vec![format!(
            "candidate:1 1 udp 2122260223 {} {} typ host",
            self.advertised_ip, port
        )];
        if let Some(mapped) = self.reflexive {
            lines.push(format!(
                "candidate:2 1 udp 1686052607 {} {} typ srflx raddr {} rport {}",
                mapped.ip(),
                mapped.port(),
                self.advertised_ip,
                port
            ));
        }
        Ok(lines
            .into_iter()
            .map(|line| IceCandidate {
                candidate: line,
                sdp_mid: Some(String::from("0")),
                sdp_mline_index: Some(0),
            })
            .collect())
    }

    fn announce_candidates(&self) -> Result<(), BoxError> {
        for candidate in self.candidates()? {
            self.emit(TransportEvent::LocalCandidate(candidate))?;
        }
        Ok(())
    }

    fn emit(&self, event: TransportEvent) -> Result<(), BoxError> {
        let peer = self.peer.lock().map_err(|_| "udp peer lock poisoned")?;
        peer.emit(event);
        Ok(())
    }

    fn send_packet(&self, packet: &DuetPacket) -> Result<(), BoxError> {
        let remote = match self.peer.lock().map_err(|_| "udp peer lock poisoned")?.remote {
            Some(addr) => addr,
            None => {
                bail!("no remote address")
            }
        };
        self.sock.send_to(packet.get_send_buffer(), remote)?;
        Ok(())
    }

    fn set_remote(&mut self, addr: SocketAddr, token: Option<u32>) -> Result<(), BoxError> {
        {
            let mut peer = self.peer.lock().map_err(|_| "udp peer lock poisoned")?;
            if !peer.candidates.contains(&addr) {
                peer.candidates.push(addr);
            }
            if peer.remote.is_none() {
                peer.remote = Some(addr);
            }
            if token.is_some() {
                peer.remote_token = token;
            }
        }
        debug!("udp transport probing {}", addr);
        let probe = DuetPacket::new(PacketKind::Probe, self.token);
        self.sock.send_to(probe.get_send_buffer(), addr)?;
        Ok(())
    }

    fn start_receiver(&mut self) -> Result<(), BoxError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let sock = self.sock.try_clone()?;
        let peer = self.peer.clone();
        let running = self.running.clone();
        let confirmed = self.confirmed.clone();
        let token = self.token;
        self.receiver = Some(thread::spawn(move || {
            receive_loop(sock, peer, running, confirmed, token);
        }));
        Ok(())
    }
}

/// pull `<ip> <port>` out of a host candidate line
pub fn parse_candidate(candidate: &str) -> Result<SocketAddr, BoxError> {
    let fields: Vec<&str> = candidate.split_whitespace().collect();
    if fields.len() < 6 || !fields[2].eq_ignore_ascii_case("udp") {
        bail!("unsupported candidate: {}", candidate);
    }
    let ip: IpAddr = fields[4].parse()?;
    let port: u16 = fields[5].parse()?;
    Ok(SocketAddr::new(ip, port))
}

/// address and token from one of our SDP blobs
pub fn parse_sdp(sdp: &str) -> Result<(SocketAddr, u32), BoxError> {
    let mut ip: Option<IpAddr> = None;
    let mut port: Option<u16> = None;
    let mut token: Option<u32> = None;
    for line in sdp.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("c=IN IP4 ") {
            ip = Some(rest.trim().parse()?);
        } else if let Some(rest) = line.strip_prefix("m=audio ") {
            port = rest.split_whitespace().next().map(|p| p.parse()).transpose()?;
        } else if let Some(rest) = line.strip_prefix("a=duet-token:") {
            token = Some(rest.trim().parse()?);
        }
    }
    match (ip, port, token) {
        (Some(ip), Some(port), Some(token)) => Ok((SocketAddr::new(ip, port), token)),
        _ => {
            bail!("sdp without connection, media port or token")
        }
    }
}

fn receive_loop(
    sock: UdpSocket,
    peer: Arc<Mutex<Peer>>,
    running: Arc<AtomicBool>,
    confirmed: Arc<AtomicBool>,
    token: u32,
) {
    let mut last_probe = Instant::now();
    let mut last_heard = Instant::now();
    let mut packet = DuetPacket::empty();
    while running.load(Ordering::SeqCst) {
        let received = sock.recv_from(packet.get_buffer());
        let mut guard = match peer.lock() {
            Ok(g) => g,
            Err(_) => break,
        };
        match received {
            Ok((amt, from)) => {
                if let Err(e) = packet.set_nbytes(amt) {
                    debug!("dropping datagram from {}: {}", from, e);
                    continue;
                }
                if guard.remote_token != Some(packet.get_token()) {
                    debug!("dropping datagram from unknown peer {}", from);
                    continue;
                }
                if packet.get_kind() == Some(PacketKind::Bye) {
                    if confirmed.swap(false, Ordering::SeqCst) {
                        guard.emit(TransportEvent::PeerLost(String::from("peer hung up")));
                    }
                    continue;
                }
                last_heard = Instant::now();
                if guard.remote != Some(from) {
                    debug!("peer answers from {}", from);
                    guard.remote = Some(from);
                }
                if !confirmed.swap(true, Ordering::SeqCst) {
                    info!("udp path to {} confirmed", from);
                    guard.emit(TransportEvent::PathConfirmed);
                }
                match packet.get_kind() {
                    Some(PacketKind::Probe) => {
                        let ack = DuetPacket::new(PacketKind::ProbeAck, token);
                        let _res = sock.send_to(ack.get_send_buffer(), from);
                    }
                    Some(PacketKind::Audio) => {
                        if let Some(frames) = &guard.frames {
                            frames.offer(packet.to_frame());
                        }
                    }
                    _ => (),
                }
            }
            Err(_timeout) => {
                let is_confirmed = confirmed.load(Ordering::SeqCst);
                let every = match is_confirmed {
                    true => KEEPALIVE_INTERVAL,
                    false => PROBE_INTERVAL,
                };
                if last_probe.elapsed() >= every {
                    last_probe = Instant::now();
                    let probe = DuetPacket::new(PacketKind::Probe, token);
                    // until the peer answers any of its candidates may be the way through
                    let targets = match (is_confirmed, guard.remote) {
                        (true, Some(addr)) => vec![addr],
                        _ => guard.candidates.clone(),
                    };
                    for addr in targets {
                        let _res = sock.send_to(probe.get_send_buffer(), addr);
                    }
                }
                if confirmed.load(Ordering::SeqCst) && last_heard.elapsed() >= PEER_TIMEOUT {
                    confirmed.store(false, Ordering::SeqCst);
                    warn!("no media from peer for {:?}", PEER_TIMEOUT);
                    guard.emit(TransportEvent::PeerLost(String::from("peer went silent")));
                }
            }
        }
    }
    debug!("udp receiver exiting");
}

impl Transport for UdpTransport {
    fn create_local_track_source(&mut self) -> Result<(), BoxError> {
        self.track = true;
        Ok(())
    }

    fn subscribe(&mut self, events: Sender<TransportEvent>, frames: FrameSink<AudioFrame>) {
        if let Ok(mut peer) = self.peer.lock() {
            peer.events = Some(events);
            peer.frames = Some(frames);
        }
        if let Err(e) = self.start_receiver() {
            warn!("udp receiver did not start: {}", e);
        }
    }

    fn create_offer(&mut self) -> Result<SessionDescription, BoxError> {
        if !self.track {
            bail!("no local track");
        }
        self.announce_candidates()?;
        self.description()
    }

    fn create_answer(&mut self) -> Result<SessionDescription, BoxError> {
        if !self.track {
            bail!("no local track");
        }
        self.announce_candidates()?;
        self.description()
    }

    fn set_remote_description(&mut self, desc: &SessionDescription) -> Result<(), BoxError> {
        let (addr, token) = parse_sdp(&desc.sdp)?;
        self.set_remote(addr, Some(token))
    }

    fn add_ice_candidate(&mut self, candidate: &IceCandidate) -> Result<(), BoxError> {
        let addr = parse_candidate(&candidate.candidate)?;
        self.set_remote(addr, None)
    }

    fn send_frame(&mut self, frame: &AudioFrame) -> Result<(), BoxError> {
        if !self.confirmed.load(Ordering::SeqCst) {
            bail!("udp path not confirmed");
        }
        self.send_packet(&DuetPacket::audio(frame, self.token)?)
    }

    fn close(&mut self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let _res = self.send_packet(&DuetPacket::new(PacketKind::Bye, self.token));
        if let Some(handle) = self.receiver.take() {
            let _res = handle.join();
        }
        self.confirmed.store(false, Ordering::SeqCst);
        if let Ok(mut peer) = self.peer.lock() {
            *peer = Peer::default();
        }
        // a new session gets a new token
        self.token = rand::random::<u32>();
        info!("udp transport closed");
    }
}

impl Drop for UdpTransport {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod test_udp_transport {
    use super::*;
    use crate::media::frame_queue::frame_queue;
    use crate::transport::stun::test_stun as stun_test;
    use std::sync::mpsc;

    #[test]
    fn parses_sdp_and_candidates() {
        let sdp = "v=0\r\nc=IN IP4 10.0.0.9\r\nm=audio 7891 RTP/AVP 0\r\na=duet-token:42\r\n";
        let (addr, token) = parse_sdp(sdp).unwrap();
        assert_eq!(addr, "10.0.0.9:7891".parse().unwrap());
        assert_eq!(token, 42);
        assert!(parse_sdp("v=0\r\n").is_err());
        let addr = parse_candidate("candidate:1 1 udp 2122260223 192.168.1.4 5000 typ host").unwrap();
        assert_eq!(addr, "192.168.1.4:5000".parse().unwrap());
        assert!(parse_candidate("candidate:1 1 tcp 1 1.2.3.4 5 typ host").is_err());
    }

    #[test]
    fn two_ends_on_localhost() {
        let mut a = UdpTransport::build(0, "127.0.0.1", &[]).unwrap();
        let mut b = UdpTransport::build(0, "127.0.0.1", &[]).unwrap();
        let (a_tx, a_rx) = mpsc::channel();
        let (b_tx, b_rx) = mpsc::channel();
        let (a_sink, _a_frames) = frame_queue(8);
        let (b_sink, b_frames) = frame_queue(8);
        a.subscribe(a_tx, a_sink);
        b.subscribe(b_tx, b_sink);
        a.create_local_track_source().unwrap();
        b.create_local_track_source().unwrap();

        let offer = a.create_offer().unwrap();
        b.set_remote_description(&offer).unwrap();
        let answer = b.create_answer().unwrap();
        a.set_remote_description(&answer).unwrap();

        let wait_for_path = |rx: &mpsc::Receiver<TransportEvent>| loop {
            match rx.recv_timeout(Duration::from_secs(3)) {
                Ok(TransportEvent::PathConfirmed) => return true,
                Ok(_) => continue,
                Err(_) => return false,
            }
        };
        assert!(wait_for_path(&a_rx));
        assert!(wait_for_path(&b_rx));

        a.send_frame(&AudioFrame::new(1, 1000, vec![4, 2])).unwrap();
        let got = b_frames.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(got.seq, 1);
        assert_eq!(got.payload, vec![4, 2]);

        a.close();
        let lost = loop {
            match b_rx.recv_timeout(Duration::from_secs(2)) {
                Ok(TransportEvent::PeerLost(_)) => break true,
                Ok(_) => continue,
                Err(_) => break false,
            }
        };
        assert!(lost);
    }

    #[test]
    fn offers_the_reflexive_candidate_second() {
        let (url, server) = stun_test::one_shot_server();
        let mut a = UdpTransport::build(0, "127.0.0.1", &[url]).unwrap();
        server.join().unwrap();
        let port = a.local_port().unwrap();
        assert_eq!(a.reflexive_addr(), Some(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)));

        let (tx, rx) = mpsc::channel();
        let (sink, _frames) = frame_queue(8);
        a.subscribe(tx, sink);
        a.create_local_track_source().unwrap();
        a.create_offer().unwrap();
        let offered: Vec<String> = rx
            .try_iter()
            .filter_map(|e| match e {
                TransportEvent::LocalCandidate(c) => Some(c.candidate),
                _ => None,
            })
            .collect();
        assert_eq!(offered.len(), 2);
        assert!(offered[0].ends_with("typ host"));
        assert!(offered[1].contains("typ srflx"));
        assert_eq!(parse_candidate(&offered[1]).unwrap().port(), port);
    }

    #[test]
    fn dead_candidate_does_not_block_the_path() {
        let mut a = UdpTransport::build(0, "127.0.0.1", &[]).unwrap();
        let mut b = UdpTransport::build(0, "127.0.0.1", &[]).unwrap();
        let (a_tx, a_rx) = mpsc::channel();
        let (b_tx, b_rx) = mpsc::channel();
        let (a_sink, a_frames) = frame_queue(8);
        let (b_sink, _b_frames) = frame_queue(8);
        a.subscribe(a_tx, a_sink);
        b.subscribe(b_tx, b_sink);
        a.create_local_track_source().unwrap();
        b.create_local_track_source().unwrap();

        // b hears about an address nobody listens on before the real one
        let dead = IceCandidate {
            candidate: String::from("candidate:9 1 udp 1 127.0.0.1 9 typ host"),
            sdp_mid: None,
            sdp_mline_index: None,
        };
        b.add_ice_candidate(&dead).unwrap();
        let offer = a.create_offer().unwrap();
        b.set_remote_description(&offer).unwrap();
        let answer = b.create_answer().unwrap();
        a.set_remote_description(&answer).unwrap();

        let confirmed = |rx: &mpsc::Receiver<TransportEvent>| loop {
            match rx.recv_timeout(Duration::from_secs(3)) {
                Ok(TransportEvent::PathConfirmed) => return true,
                Ok(_) => continue,
                Err(_) => return false,
            }
        };
        assert!(confirmed(&b_rx));
        assert!(confirmed(&a_rx));
        b.send_frame(&AudioFrame::new(5, 1000, vec![1])).unwrap();
        assert_eq!(a_frames.recv_timeout(Duration::from_secs(2)).unwrap().seq, 5);
    }
}
