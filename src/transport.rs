//! The seam to the real-time media transport.
//!
//! The engine never touches sockets or codecs for audio.  It drives a [`Transport`]
//! through offer/answer and candidates, pushes outgoing frames into it, and receives
//! remote frames and path events over the channels it hands to `subscribe`.
use std::sync::mpsc::Sender;

#[cfg(test)]
use mockall::automock;

use crate::common::box_error::BoxError;
use crate::media::{audio_frame::AudioFrame, frame_queue::FrameSink};
use crate::signaling::message::{IceCandidate, SessionDescription};

pub mod duet_packet;
pub mod loopback;
pub mod stun;
pub mod udp;

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// a candidate the peer needs to hear about
    LocalCandidate(IceCandidate),
    /// media can flow
    PathConfirmed,
    PeerLost(String),
}

#[cfg_attr(test, automock)]
pub trait Transport: Send {
    /// open the microphone side
    fn create_local_track_source(&mut self) -> Result<(), BoxError>;
    /// where remote frames and transport events should go
    fn subscribe(&mut self, events: Sender<TransportEvent>, frames: FrameSink<AudioFrame>);
    fn create_offer(&mut self) -> Result<SessionDescription, BoxError>;
    /// only valid after the remote offer has been set
    fn create_answer(&mut self) -> Result<SessionDescription, BoxError>;
    fn set_remote_description(&mut self, desc: &SessionDescription) -> Result<(), BoxError>;
    fn add_ice_candidate(&mut self, candidate: &IceCandidate) -> Result<(), BoxError>;
    fn send_frame(&mut self, frame: &AudioFrame) -> Result<(), BoxError>;
    fn close(&mut self);
}
