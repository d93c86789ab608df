//! Outbound processing of the singer's frames.
//!
//! The pitch shifter lives outside this crate.  It is plugged in as a
//! [`FrameTransform`], which only sees opaque payloads.  [`OutboundStage`] applies the
//! transform, stamps sequence numbers and handles the local mute.
use log::info;

#[cfg(test)]
use mockall::automock;

use crate::media::audio_frame::AudioFrame;

#[cfg_attr(test, automock)]
pub trait FrameTransform: Send {
    /// shift in semitones, 0 means untouched and the transform is bypassed
    fn set_pitch(&mut self, semitones: f32);
    fn pitch(&self) -> f32;
    fn do_transform(&mut self, payload: &mut Vec<u8>);
}

/// Transform used when no pitch shifter is plugged in
#[derive(Debug, Default)]
pub struct Passthrough {
    semitones: f32,
}

impl FrameTransform for Passthrough {
    fn set_pitch(&mut self, semitones: f32) {
        self.semitones = semitones;
    }
    fn pitch(&self) -> f32 {
        self.semitones
    }
    fn do_transform(&mut self, _payload: &mut Vec<u8>) {}
}

pub struct OutboundStage {
    transform: Box<dyn FrameTransform>,
    muted: bool,
    next_seq: u64,
}

impl OutboundStage {
    pub fn new(transform: Box<dyn FrameTransform>) -> OutboundStage {
        OutboundStage {
            transform: transform,
            muted: false,
            next_seq: 1,
        }
    }

    pub fn set_pitch(&mut self, semitones: f32) {
        info!("pitch shift set to {} semitones", semitones);
        self.transform.set_pitch(semitones);
    }
    pub fn pitch(&self) -> f32 {
        self.transform.pitch()
    }
    pub fn get_mute(&self) -> bool {
        self.muted
    }
    pub fn set_mute(&mut self, mute: bool) {
        self.muted = mute;
    }

    /// Turn a captured payload into the next outgoing frame.  A muted singer still sends
    /// frames (zeroed) so the peer's sequence stays unbroken.
    pub fn prepare(&mut self, mut payload: Vec<u8>, capture_time: u128) -> AudioFrame {
        if self.muted {
            payload.iter_mut().for_each(|b| *b = 0);
        } else if self.transform.pitch() != 0.0 {
            self.transform.do_transform(&mut payload);
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        AudioFrame::new(seq, capture_time, payload)
    }

    /// sequence numbers start over for a new session
    pub fn reset(&mut self) {
        self.next_seq = 1;
    }
}
