//! The datagram the udp transport puts on the wire.
//!
//! ```text
//! kind: u8 | reserved: [u8; 3] | token: u32 | seq: u64 | capture_time: u64 | payload
//! ```
//!
//! Everything is network endian.  `token` is the sender's random token from its SDP,
//! the receiver drops datagrams whose token does not match the peer it negotiated with.
use byteorder::{ByteOrder, NetworkEndian};
use simple_error::bail;
use std::fmt;

use crate::common::box_error::BoxError;
use crate::media::audio_frame::AudioFrame;

pub const DUET_BUF_SIZE: usize = 1500;
pub const DUET_HEADER_SIZE: usize = 1 + 3 + 4 + 8 + 8;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PacketKind {
    /// path check, answered with an ack
    Probe,
    ProbeAck,
    Audio,
    Bye,
}

impl PacketKind {
    fn code(&self) -> u8 {
        match self {
            PacketKind::Probe => 1,
            PacketKind::ProbeAck => 2,
            PacketKind::Audio => 3,
            PacketKind::Bye => 4,
        }
    }
    fn from_code(code: u8) -> Option<PacketKind> {
        match code {
            1 => Some(PacketKind::Probe),
            2 => Some(PacketKind::ProbeAck),
            3 => Some(PacketKind::Audio),
            4 => Some(PacketKind::Bye),
            _ => None,
        }
    }
}

pub struct DuetPacket {
    buffer: [u8; DUET_BUF_SIZE],
    nbytes: usize,
}

impl DuetPacket {
    pub fn new(kind: PacketKind, token: u32) -> DuetPacket {
        let mut packet = DuetPacket {
            buffer: [0; DUET_BUF_SIZE],
            nbytes: DUET_HEADER_SIZE,
        };
        packet.buffer[0] = kind.code();
        NetworkEndian::write_u32(&mut packet.buffer[4..8], token);
        packet
    }

    /// An audio packet for a frame.  Payloads that do not fit are an error.
    pub fn audio(frame: &AudioFrame, token: u32) -> Result<DuetPacket, BoxError> {
        if frame.payload.len() > DUET_BUF_SIZE - DUET_HEADER_SIZE {
            bail!("frame payload of {} bytes does not fit a packet", frame.payload.len());
        }
        let mut packet = DuetPacket::new(PacketKind::Audio, token);
        packet.set_sequence_num(frame.seq);
        packet.set_capture_time(frame.capture_time as u64);
        let end = DUET_HEADER_SIZE + frame.payload.len();
        packet.buffer[DUET_HEADER_SIZE..end].copy_from_slice(&frame.payload);
        packet.nbytes = end;
        Ok(packet)
    }

    /// an empty packet to receive into
    pub fn empty() -> DuetPacket {
        DuetPacket {
            buffer: [0; DUET_BUF_SIZE],
            nbytes: 0,
        }
    }

    pub fn get_kind(&self) -> Option<PacketKind> {
        PacketKind::from_code(self.buffer[0])
    }
    pub fn get_token(&self) -> u32 {
        NetworkEndian::read_u32(&self.buffer[4..8])
    }
    pub fn get_sequence_num(&self) -> u64 {
        NetworkEndian::read_u64(&self.buffer[8..16])
    }
    pub fn set_sequence_num(&mut self, seq: u64) {
        NetworkEndian::write_u64(&mut self.buffer[8..16], seq)
    }
    pub fn get_capture_time(&self) -> u64 {
        NetworkEndian::read_u64(&self.buffer[16..24])
    }
    pub fn set_capture_time(&mut self, t: u64) {
        NetworkEndian::write_u64(&mut self.buffer[16..24], t)
    }
    /// receive target
    pub fn get_buffer(&mut self) -> &mut [u8] {
        &mut self.buffer
    }
    pub fn get_send_buffer(&self) -> &[u8] {
        &self.buffer[0..self.nbytes]
    }
    /// how much was read into the buffer
    pub fn set_nbytes(&mut self, amt: usize) -> Result<(), BoxError> {
        if amt < DUET_HEADER_SIZE || amt > DUET_BUF_SIZE {
            bail!("invalid packet of {} bytes", amt);
        }
        if self.get_kind().is_none() {
            bail!("unknown packet kind {}", self.buffer[0]);
        }
        self.nbytes = amt;
        Ok(())
    }

    /// the frame carried by an audio packet
    pub fn to_frame(&self) -> AudioFrame {
        AudioFrame::new(
            self.get_sequence_num(),
            self.get_capture_time() as u128,
            self.buffer[DUET_HEADER_SIZE..self.nbytes].to_vec(),
        )
    }
}

impl fmt::Display for DuetPacket {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{{ kind: {:?}, token: {}, seq: {}, capture: {}, nbytes: {} }}",
            self.get_kind(),
            self.get_token(),
            self.get_sequence_num(),
            self.get_capture_time(),
            self.nbytes
        )
    }
}

#[cfg(test)]
mod test_duet_packet {
    use super::*;

    #[test]
    fn header_fields() {
        let mut packet = DuetPacket::new(PacketKind::Probe, 0xdeadbeef);
        packet.set_sequence_num(77);
        assert_eq!(packet.get_kind(), Some(PacketKind::Probe));
        assert_eq!(packet.get_token(), 0xdeadbeef);
        assert_eq!(packet.get_sequence_num(), 77);
        assert_eq!(packet.get_send_buffer().len(), DUET_HEADER_SIZE);
        // network order on the wire
        assert_eq!(&packet.get_send_buffer()[4..8], &[0xde, 0xad, 0xbe, 0xef]);
    }

    #[test]
    fn carries_a_frame() {
        let frame = AudioFrame::new(12, 3_000_000, vec![5, 6, 7]);
        let sent = DuetPacket::audio(&frame, 1).unwrap();
        let mut got = DuetPacket::empty();
        let n = sent.get_send_buffer().len();
        got.get_buffer()[..n].copy_from_slice(sent.get_send_buffer());
        got.set_nbytes(n).unwrap();
        assert_eq!(got.to_frame(), frame);
    }

    #[test]
    fn rejects_junk() {
        let mut got = DuetPacket::empty();
        assert!(got.set_nbytes(3).is_err());
        got.get_buffer()[0] = 99;
        assert!(got.set_nbytes(DUET_HEADER_SIZE).is_err());
        let big = AudioFrame::new(1, 0, vec![0; DUET_BUF_SIZE]);
        assert!(DuetPacket::audio(&big, 1).is_err());
    }
}
