//! A pair of in-process transports wired to each other.
//!
//! Offer and answer are token SDP blobs.  The path is confirmed as soon as the remote
//! description is set and at least one remote candidate has been added, so the ordering
//! rules of real ICE still matter.  Frames sent on one end come out of the other end's
//! frame sink.
use std::sync::{mpsc::Sender, Arc, Mutex};

use log::{debug, info};

use crate::common::box_error::BoxError;
use crate::media::{audio_frame::AudioFrame, frame_queue::FrameSink};
use crate::signaling::message::{IceCandidate, SessionDescription};
use crate::transport::{Transport, TransportEvent};

#[derive(Default)]
struct Endpoint {
    events: Option<Sender<TransportEvent>>,
    frames: Option<FrameSink<AudioFrame>>,
    open: bool,
}

type Shared = Arc<Mutex<[Endpoint; 2]>>;

pub struct LoopbackTransport {
    side: usize,
    link: Shared,
    track: bool,
    remote: Option<SessionDescription>,
    remote_candidates: usize,
    confirmed: bool,
}

impl LoopbackTransport {
    pub fn pair() -> (LoopbackTransport, LoopbackTransport) {
        let link: Shared = Arc::new(Mutex::new([Endpoint::default(), Endpoint::default()]));
        (Self::end(0, link.clone()), Self::end(1, link))
    }

    fn end(side: usize, link: Shared) -> LoopbackTransport {
        LoopbackTransport {
            side,
            link,
            track: false,
            remote: None,
            remote_candidates: 0,
            confirmed: false,
        }
    }

    fn with_link<T>(&self, f: impl FnOnce(&mut [Endpoint; 2]) -> T) -> Result<T, BoxError> {
        let mut ends = self.link.lock().map_err(|_| "loopback link poisoned")?;
        Ok(f(&mut *ends))
    }

    fn emit(&self, event: TransportEvent) -> Result<(), BoxError> {
        let side = self.side;
        self.with_link(|ends| {
            if let Some(tx) = &ends[side].events {
                let _res = tx.send(event);
            }
        })
    }

    fn description(&self, kind: &str) -> SessionDescription {
        SessionDescription {
            sdp: format!(
                "v=0\r\no=- {} 1 IN IP4 127.0.0.1\r\ns=duet-{}\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\n",
                self.side, kind
            ),
        }
    }

    fn candidate(&self) -> IceCandidate {
        IceCandidate {
            candidate: format!("candidate:{} 1 udp 2122260223 127.0.0.1 {} typ host", self.side + 1, 50000 + self.side),
            sdp_mid: Some(String::from("0")),
            sdp_mline_index: Some(0),
        }
    }

    fn check_path(&mut self) -> Result<(), BoxError> {
        if !self.confirmed && self.remote.is_some() && self.remote_candidates > 0 {
            self.confirmed = true;
            debug!("loopback {} path confirmed", self.side);
            self.emit(TransportEvent::PathConfirmed)?;
        }
        Ok(())
    }
}

impl Transport for LoopbackTransport {
    fn create_local_track_source(&mut self) -> Result<(), BoxError> {
        self.track = true;
        Ok(())
    }

    fn subscribe(&mut self, events: Sender<TransportEvent>, frames: FrameSink<AudioFrame>) {
        let side = self.side;
        let _res = self.with_link(|ends| {
            ends[side].events = Some(events);
            ends[side].frames = Some(frames);
            ends[side].open = true;
        });
    }

    fn create_offer(&mut self) -> Result<SessionDescription, BoxError> {
        if !self.track {
            return Err("no local track".into());
        }
        self.emit(TransportEvent::LocalCandidate(self.candidate()))?;
        Ok(self.description("offer"))
    }

    fn create_answer(&mut self) -> Result<SessionDescription, BoxError> {
        if !self.track {
            return Err("no local track".into());
        }
        if self.remote.is_none() {
            return Err("answer requested before the offer was set".into());
        }
        self.emit(TransportEvent::LocalCandidate(self.candidate()))?;
        Ok(self.description("answer"))
    }

    fn set_remote_description(&mut self, desc: &SessionDescription) -> Result<(), BoxError> {
        if !desc.sdp.starts_with("v=0") {
            return Err(format!("unparsable sdp: {}", desc.sdp).into());
        }
        self.remote = Some(desc.clone());
        self.check_path()
    }

    fn add_ice_candidate(&mut self, candidate: &IceCandidate) -> Result<(), BoxError> {
        if self.remote.is_none() {
            return Err("candidate before remote description".into());
        }
        debug!("loopback {} got candidate {}", self.side, candidate.candidate);
        self.remote_candidates += 1;
        self.check_path()
    }

    fn send_frame(&mut self, frame: &AudioFrame) -> Result<(), BoxError> {
        if !self.confirmed {
            return Err("transport path not confirmed".into());
        }
        let other = 1 - self.side;
        self.with_link(|ends| {
            if let (true, Some(sink)) = (ends[other].open, &ends[other].frames) {
                sink.offer(frame.clone());
            }
        })
    }

    fn close(&mut self) {
        let side = self.side;
        let other = 1 - side;
        let was_open = self
            .with_link(|ends| {
                let was_open = ends[side].open;
                ends[side] = Endpoint::default();
                if was_open {
                    if let (true, Some(tx)) = (ends[other].open, &ends[other].events) {
                        let _res = tx.send(TransportEvent::PeerLost(String::from("peer closed")));
                    }
                }
                was_open
            })
            .unwrap_or(false);
        if was_open {
            info!("loopback transport {} closed", side);
        }
        self.confirmed = false;
        self.remote = None;
        self.remote_candidates = 0;
    }
}
