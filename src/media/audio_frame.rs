use serde::Serialize;

/// One encoded chunk of audio as it travels between the singers.  `capture_time` is on
/// the sender's clock, `arrival_time` on ours (zero until it arrives).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AudioFrame {
    pub seq: u64,
    pub capture_time: u128,
    #[serde(skip)]
    pub payload: Vec<u8>,
    pub arrival_time: u128,
}

impl AudioFrame {
    pub fn new(seq: u64, capture_time: u128, payload: Vec<u8>) -> AudioFrame {
        AudioFrame {
            seq,
            capture_time,
            payload,
            arrival_time: 0,
        }
    }
    /// stamp the local arrival time
    pub fn arrived(mut self, now: u128) -> AudioFrame {
        self.arrival_time = now;
        self
    }
    /// arrival minus capture, in msec.  Includes the clock offset, so only its variation
    /// means anything.
    pub fn transit_ms(&self) -> f64 {
        (self.arrival_time as i128 - self.capture_time as i128) as f64 / 1000.0
    }
}

/// What the jitter buffer hands to playback each frame interval
#[derive(Debug, Clone, PartialEq)]
pub enum Playout {
    Frame(AudioFrame),
    /// this frame never arrived, playback should conceal it
    Gap { seq: u64 },
    /// nothing to play, the buffer is (re)filling
    Silence,
}

impl Playout {
    pub fn seq(&self) -> Option<u64> {
        match self {
            Playout::Frame(f) => Some(f.seq),
            Playout::Gap { seq } => Some(*seq),
            Playout::Silence => None,
        }
    }
}
