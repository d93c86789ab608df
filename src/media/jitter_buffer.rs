use std::collections::BTreeMap;
use std::fmt;

use log::{debug, trace};
use serde::Serialize;

use crate::common::{duet_error::DuetError, stream_time_stat::StreamTimeStat};
use crate::media::audio_frame::{AudioFrame, Playout};

// frames held beyond this many times the ceiling are dropped from the head
const HOLD_FACTOR: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct JitterConfig {
    /// frames to hold before playout starts
    pub initial_depth: usize,
    pub floor: usize,
    pub ceiling: usize,
    /// transit variance (msec^2) above which the depth grows
    pub high_water: f64,
    /// transit variance (msec^2) below which the depth may shrink
    pub low_water: f64,
    /// metrics intervals the variance has to stay low before the depth shrinks
    pub calm_intervals: u32,
}

impl Default for JitterConfig {
    fn default() -> Self {
        JitterConfig {
            initial_depth: 2,
            floor: 1,
            ceiling: 12,
            high_water: 25.0,
            low_water: 4.0,
            calm_intervals: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Admission {
    Queued,
    /// behind the playout point, dropped
    Late,
    Duplicate,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct JitterStats {
    pub delivered: u64,
    pub lost: u64,
    pub late: u64,
    pub duplicates: u64,
    pub underruns: u64,
    pub overruns: u64,
    pub gap_bursts: u64,
}

pub struct JitterBuffer {
    config: JitterConfig,
    frames: BTreeMap<u64, AudioFrame>,
    next_seq: Option<u64>,
    // first slot that went through playout or eviction, anything older was never counted
    start_seq: Option<u64>,
    target_depth: usize,
    filling: bool,
    calm: u32,
    gap_run: u64,
    exceeded: Vec<DuetError>,
    depth_stats: StreamTimeStat,
    stats: JitterStats,
}

impl fmt::Display for JitterBuffer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{{ target: {}, depth: {}, avg_depth: {:.2}, delivered: {}, lost: {}, late: {}, underruns: {} }}",
            self.target_depth,
            self.frames.len(),
            self.depth_stats.get_mean(),
            self.stats.delivered,
            self.stats.lost,
            self.stats.late,
            self.stats.underruns
        )
    }
}

impl JitterBuffer {
    pub fn build(config: JitterConfig) -> JitterBuffer {
        let floor = config.floor.max(1);
        let ceiling = config.ceiling.max(floor);
        let config = JitterConfig {
            floor,
            ceiling,
            initial_depth: config.initial_depth.max(floor).min(ceiling),
            ..config
        };
        JitterBuffer {
            config: config,
            frames: BTreeMap::new(),
            next_seq: None,
            start_seq: None,
            target_depth: config.initial_depth,
            filling: true,
            calm: 0,
            gap_run: 0,
            exceeded: vec![],
            depth_stats: StreamTimeStat::build(50),
            stats: JitterStats::default(),
        }
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }
    pub fn target_depth(&self) -> usize {
        self.target_depth
    }
    pub fn avg_depth(&self) -> f64 {
        self.depth_stats.get_mean()
    }
    pub fn is_filling(&self) -> bool {
        self.filling
    }
    pub fn stats(&self) -> &JitterStats {
        &self.stats
    }

    /// Accept an arriving frame
    pub fn push(&mut self, frame: AudioFrame) -> Admission {
        if let Some(next) = self.next_seq {
            if frame.seq < next {
                self.stats.late += 1;
                if self.start_seq.map(|s| frame.seq < s).unwrap_or(false) {
                    // older than anything played, its slot was never concealed
                    self.stats.lost += 1;
                }
                trace!("late frame {} (playing {})", frame.seq, next);
                return Admission::Late;
            }
        }
        if self.frames.contains_key(&frame.seq) {
            self.stats.duplicates += 1;
            return Admission::Duplicate;
        }
        self.frames.insert(frame.seq, frame);

        // the consumer stalled, drop from the head rather than grow without bound
        while self.frames.len() > self.config.ceiling * HOLD_FACTOR {
            let head = match self.frames.keys().next() {
                Some(k) => *k,
                None => break,
            };
            self.frames.remove(&head);
            self.stats.overruns += 1;
            // the evicted frame plus any missing slots skipped over with it
            let skipped = self.next_seq.map(|n| head.saturating_sub(n)).unwrap_or(0);
            self.stats.lost += 1 + skipped;
            if self.start_seq.is_none() {
                self.start_seq = Some(head);
            }
            self.next_seq = Some(head + 1);
        }
        Admission::Queued
    }

    /// Release the next item for playout.  Called once per frame interval.
    pub fn pop(&mut self) -> Playout {
        self.depth_stats.add_sample(self.frames.len() as f64);

        if self.filling {
            if self.frames.len() < self.target_depth {
                return Playout::Silence;
            }
            self.filling = false;
            if self.next_seq.is_none() {
                self.next_seq = self.frames.keys().next().cloned();
                self.start_seq = self.next_seq;
            }
            debug!("jitter buffer filled to {}", self.frames.len());
        }

        let next = match (self.frames.is_empty(), self.next_seq) {
            (false, Some(n)) => n,
            _ => {
                self.stats.underruns += 1;
                self.filling = true;
                return Playout::Silence;
            }
        };
        self.next_seq = Some(next + 1);

        if let Some(frame) = self.frames.remove(&next) {
            self.stats.delivered += 1;
            self.gap_run = 0;
            return Playout::Frame(frame);
        }

        // later frames are waiting, this one is missing
        self.stats.lost += 1;
        self.gap_run += 1;
        if self.gap_run == self.target_depth as u64 + 1 {
            self.stats.gap_bursts += 1;
            debug!("gap of {} frames at {}", self.gap_run, next);
            self.exceeded.push(DuetError::FrameGapExceeded {
                missing: self.gap_run,
            });
        }
        Playout::Gap { seq: next }
    }

    /// Gap bursts longer than the depth since the last call
    pub fn take_exceeded(&mut self) -> Vec<DuetError> {
        self.exceeded.drain(..).collect()
    }

    /// Depth policy, run once per metrics interval with the current transit variance
    pub fn adapt(&mut self, jitter_variance: f64) {
        let before = self.target_depth;
        if jitter_variance > self.config.high_water {
            self.calm = 0;
            self.target_depth = (self.target_depth + 1).min(self.config.ceiling);
        } else if jitter_variance < self.config.low_water {
            self.calm += 1;
            if self.calm >= self.config.calm_intervals {
                self.calm = 0;
                self.target_depth = self.target_depth.saturating_sub(1).max(self.config.floor);
            }
        } else {
            self.calm = 0;
        }
        if before != self.target_depth {
            debug!(
                "jitter target depth {} -> {} (variance {:.2})",
                before, self.target_depth, jitter_variance
            );
        }
    }

    /// Drop every frame and start over
    pub fn reset(&mut self) {
        self.frames.clear();
        self.next_seq = None;
        self.start_seq = None;
        self.target_depth = self.config.initial_depth;
        self.filling = true;
        self.calm = 0;
        self.gap_run = 0;
        self.exceeded.clear();
        self.depth_stats.clear();
        self.stats = JitterStats::default();
    }
}
