//! Session health numbers.
//!
//! The collector is fed round trips from the clock engine and transit times from
//! arriving frames.  Every metrics interval it publishes a [`MetricsSnapshot`], an
//! immutable copy that the engine hands out and that drives the jitter buffer's depth.
use std::fmt;

use serde::Serialize;

use crate::common::stream_time_stat::{MicroTimer, StreamTimeStat};
use crate::media::{audio_frame::AudioFrame, jitter_buffer::JitterBuffer};

const RTT_WINDOW: usize = 32;
const TRANSIT_WINDOW: usize = 100;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub rtt_mean_ms: f64,
    pub rtt_variance: f64,
    /// variance of frame transit time (msec^2)
    pub jitter_variance: f64,
    pub loss_rate: f64,
    pub buffer_depth: usize,
    pub target_depth: usize,
    pub delivered: u64,
    pub lost: u64,
    pub late: u64,
    pub gap_bursts: u64,
    pub lost_probes: u64,
    pub taken_at: u128,
}

impl MetricsSnapshot {
    pub fn as_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

impl fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{{ rtt: {:.1}ms, jitter_var: {:.2}, loss: {:.1}%, depth: {}/{}, gaps: {} }}",
            self.rtt_mean_ms,
            self.jitter_variance,
            self.loss_rate * 100.0,
            self.buffer_depth,
            self.target_depth,
            self.gap_bursts
        )
    }
}

pub struct MetricsCollector {
    rtt: StreamTimeStat,
    transit: StreamTimeStat,
    timer: MicroTimer,
    latest: Option<MetricsSnapshot>,
}

impl MetricsCollector {
    pub fn build(interval: u128, now: u128) -> MetricsCollector {
        MetricsCollector {
            rtt: StreamTimeStat::build(RTT_WINDOW),
            transit: StreamTimeStat::build(TRANSIT_WINDOW),
            timer: MicroTimer::new(now, interval),
            latest: None,
        }
    }

    /// a clock probe round trip in usec
    pub fn record_rtt(&mut self, rtt_us: f64) {
        self.rtt.add_sample(rtt_us / 1000.0);
    }

    pub fn record_transit(&mut self, frame: &AudioFrame) {
        self.transit.add_sample(frame.transit_ms());
    }

    pub fn jitter_variance(&self) -> f64 {
        self.transit.get_variance()
    }

    pub fn latest(&self) -> Option<&MetricsSnapshot> {
        self.latest.as_ref()
    }

    /// Publish a snapshot when the interval is up
    pub fn poll(&mut self, now: u128, jitter: &JitterBuffer, lost_probes: u64) -> Option<MetricsSnapshot> {
        if !self.timer.expired(now) {
            return None;
        }
        self.timer.reset(now);
        Some(self.snapshot(now, jitter, lost_probes))
    }

    pub fn snapshot(&mut self, now: u128, jitter: &JitterBuffer, lost_probes: u64) -> MetricsSnapshot {
        let stats = jitter.stats();
        let played = stats.delivered + stats.lost;
        let snap = MetricsSnapshot {
            rtt_mean_ms: self.rtt.get_mean(),
            rtt_variance: self.rtt.get_variance(),
            jitter_variance: self.transit.get_variance(),
            loss_rate: if played == 0 {
                0.0
            } else {
                stats.lost as f64 / played as f64
            },
            buffer_depth: jitter.depth(),
            target_depth: jitter.target_depth(),
            delivered: stats.delivered,
            lost: stats.lost,
            late: stats.late,
            gap_bursts: stats.gap_bursts,
            lost_probes: lost_probes,
            taken_at: now,
        };
        self.latest = Some(snap.clone());
        snap
    }

    pub fn reset(&mut self, now: u128) {
        self.rtt.clear();
        self.transit.clear();
        self.timer.reset(now);
        self.latest = None;
    }
}
