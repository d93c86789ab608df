//! Clock synchronization between the two singers.
//!
//! The host runs the probe protocol: every probe interval it sends a ping stamped with
//! its clock, the guest answers with its receive and send times, and the host records a
//! [`ClockSample`].  After every accepted sample the offset is recomputed from the window:
//!
//! 1. samples whose round trip is more than `outlier_multiple` times the median are
//!    dropped from the computation (the window itself is untouched),
//! 2. if fewer than `min_samples` survive, the previous estimate stands,
//! 3. offset is the mean of the surviving per-sample offsets, the error bound is half
//!    the best round trip (the symmetric path assumption can be off by at most that)
//!    plus the spread of the offsets.
//!
//! The estimate is valid once the window holds `min_samples` and the error bound is
//! under `max_error_us`.  From then on the probe rate drops to the synced interval and
//! each new estimate is compared with the one we synchronized on; `drift_limit`
//! recomputations in a row outside the error bound ask for a resync.
//!
//! The guest does not probe.  It adopts the estimate the host piggybacks on its pings.
use std::collections::{HashMap, VecDeque};

use log::{debug, info, warn};

use crate::clock::sample::{ClockOffset, ClockSample};
use crate::common::{duet_error::DuetError, ms_to_micros, stream_time_stat::MicroTimer};
use crate::signaling::message::SharedEstimate;

// never call a round trip an outlier for being less than this far above the median
const MIN_OUTLIER_MARGIN_US: f64 = 1000.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClockConfig {
    pub window: usize,
    pub min_samples: usize,
    pub outlier_multiple: f64,
    pub max_error_us: f64,
    pub drift_limit: u32,
    pub probe_interval: u128,
    pub synced_probe_interval: u128,
    pub probe_timeout: u128,
}

impl Default for ClockConfig {
    fn default() -> Self {
        ClockConfig {
            window: 32,
            min_samples: 8,
            outlier_multiple: 3.0,
            max_error_us: 30_000.0,
            drift_limit: 3,
            probe_interval: ms_to_micros(200),
            synced_probe_interval: ms_to_micros(1000),
            probe_timeout: ms_to_micros(2000),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClockEvent {
    /// the estimate became valid
    Synchronized(ClockOffset),
    /// the estimate wandered outside its error bound and stayed there
    ResyncRequired,
}

pub struct ClockSyncEngine {
    config: ClockConfig,
    window: VecDeque<ClockSample>,
    latest: Option<ClockOffset>,
    valid: Option<ClockOffset>,
    anchor: Option<ClockOffset>,
    synchronized: bool,
    drift_count: u32,
    next_seq: u64,
    outstanding: HashMap<u64, u128>,
    probe_timer: MicroTimer,
    probe_due: bool,
    running: bool,
    lost_probes: u64,
    last_filtered: usize,
    last_rtt: Option<f64>,
}

impl ClockSyncEngine {
    pub fn new(config: ClockConfig, now: u128) -> ClockSyncEngine {
        ClockSyncEngine {
            config: config,
            window: VecDeque::with_capacity(config.window),
            latest: None,
            valid: None,
            anchor: None,
            synchronized: false,
            drift_count: 0,
            next_seq: 1,
            outstanding: HashMap::new(),
            probe_timer: MicroTimer::new(now, config.probe_interval),
            probe_due: false,
            running: false,
            lost_probes: 0,
            last_filtered: 0,
            last_rtt: None,
        }
    }

    /// Begin probing.  The first ping goes out on the next poll.
    pub fn start(&mut self, now: u128) {
        self.running = true;
        self.probe_due = true;
        self.probe_timer.reset(now);
    }

    /// Stop probing.  Estimates are kept.
    pub fn stop(&mut self) {
        self.running = false;
        self.probe_due = false;
        self.outstanding.clear();
    }

    /// Forget everything, back to a fresh engine that is not probing
    pub fn reset(&mut self) {
        self.stop();
        self.window.clear();
        self.latest = None;
        self.valid = None;
        self.anchor = None;
        self.synchronized = false;
        self.drift_count = 0;
        self.last_filtered = 0;
        self.probe_timer.set_interval(self.config.probe_interval);
    }

    pub fn is_running(&self) -> bool {
        self.running
    }
    pub fn is_synchronized(&self) -> bool {
        self.synchronized
    }
    /// last valid offset
    pub fn current_offset(&self) -> Result<ClockOffset, DuetError> {
        self.valid.ok_or(DuetError::ClockUnavailable)
    }
    /// last computed estimate, valid or not
    pub fn latest_estimate(&self) -> Option<ClockOffset> {
        self.latest
    }
    pub fn window_len(&self) -> usize {
        self.window.len()
    }
    /// samples that survived the outlier filter in the last recomputation
    pub fn filtered_len(&self) -> usize {
        self.last_filtered
    }
    pub fn lost_probes(&self) -> u64 {
        self.lost_probes
    }
    pub fn last_rtt(&self) -> Option<f64> {
        self.last_rtt
    }
    pub fn probe_interval(&self) -> u128 {
        self.probe_timer.get_interval()
    }

    /// What the host puts on its pings for the guest
    pub fn shared_estimate(&self) -> Option<SharedEstimate> {
        if !self.synchronized {
            return None;
        }
        self.valid.map(|v| SharedEstimate {
            offset_us: v.offset_us,
            error_us: v.error_bound_us,
        })
    }

    /// Local time at which both sides should start playback, `lead` from now, along with
    /// the same instant on the peer's clock.
    pub fn schedule_start(&self, now: u128, lead: u128) -> Result<(u128, u128), DuetError> {
        let offset = self.current_offset()?;
        let local = now + lead;
        Ok((local, offset.to_remote_time(local)))
    }

    /// Returns (seq, send time) when a ping is due.  Also expires probes that were never
    /// answered.
    pub fn poll_probe(&mut self, now: u128) -> Option<(u64, u128)> {
        let timeout = self.config.probe_timeout;
        let before = self.outstanding.len();
        self.outstanding.retain(|_, sent| now.saturating_sub(*sent) < timeout);
        let expired = before - self.outstanding.len();
        if expired > 0 {
            self.lost_probes += expired as u64;
            debug!("{} clock probes expired", expired);
        }
        if !self.running {
            return None;
        }
        if !(self.probe_due || self.probe_timer.expired(now)) {
            return None;
        }
        self.probe_due = false;
        self.probe_timer.reset(now);
        let seq = self.next_seq;
        self.next_seq += 1;
        self.outstanding.insert(seq, now);
        Some((seq, now))
    }

    /// Handle the guest's answer to one of our pings
    pub fn on_pong(
        &mut self,
        seq: u64,
        remote_receive: u128,
        remote_send: u128,
        now: u128,
    ) -> Result<Option<ClockEvent>, DuetError> {
        let sent = match self.outstanding.remove(&seq) {
            Some(t) => t,
            None => {
                return Err(DuetError::MalformedMessage(format!(
                    "pong {} does not match an outstanding ping",
                    seq
                )))
            }
        };
        match ClockSample::new(seq, sent, remote_receive, remote_send, now) {
            Some(sample) => Ok(self.record(sample, now)),
            None => Err(DuetError::MalformedMessage(format!(
                "pong {} has impossible timestamps",
                seq
            ))),
        }
    }

    /// Add a sample to the window and recompute
    pub fn record(&mut self, sample: ClockSample, now: u128) -> Option<ClockEvent> {
        if self.window.len() == self.config.window {
            self.window.pop_front();
        }
        self.last_rtt = Some(sample.round_trip() as f64);
        self.window.push_back(sample);
        self.recompute(now)
    }

    /// Guest side: take over the host's estimate (negated, it is measured the other way)
    pub fn adopt(&mut self, estimate: SharedEstimate, now: u128) -> Option<ClockEvent> {
        let offset = ClockOffset {
            offset_us: estimate.offset_us,
            error_bound_us: estimate.error_us,
            updated_at: now,
            samples_used: self.config.min_samples,
        }
        .inverted(now);
        self.latest = Some(offset);
        self.evaluate(offset)
    }

    /// Guest side: the host stopped sharing an estimate, it is resyncing
    pub fn peer_resyncing(&mut self) -> Option<ClockEvent> {
        if !self.synchronized {
            return None;
        }
        info!("peer is resyncing the clock");
        self.reset();
        Some(ClockEvent::ResyncRequired)
    }

    fn recompute(&mut self, now: u128) -> Option<ClockEvent> {
        if self.window.len() < self.config.min_samples {
            return None;
        }
        let kept = self.filtered();
        if kept.len() < self.config.min_samples {
            // keep whatever we had before
            debug!(
                "only {} of {} clock samples survive the outlier filter",
                kept.len(),
                self.window.len()
            );
            return None;
        }
        self.last_filtered = kept.len();

        let n = kept.len() as f64;
        let offsets: Vec<f64> = kept.iter().map(|s| s.offset() as f64).collect();
        let mean = offsets.iter().sum::<f64>() / n;
        let spread = (offsets.iter().map(|o| (o - mean) * (o - mean)).sum::<f64>() / n).sqrt();
        let best_rtt = kept
            .iter()
            .map(|s| s.round_trip() as f64)
            .fold(f64::MAX, f64::min);

        let estimate = ClockOffset {
            offset_us: mean.round() as i64,
            error_bound_us: best_rtt / 2.0 + spread,
            updated_at: now,
            samples_used: kept.len(),
        };
        self.latest = Some(estimate);
        self.evaluate(estimate)
    }

    /// samples whose round trip is within the outlier limit
    fn filtered(&self) -> Vec<ClockSample> {
        let mut rtts: Vec<f64> = self.window.iter().map(|s| s.round_trip() as f64).collect();
        rtts.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let mid = rtts.len() / 2;
        let median = if rtts.len() % 2 == 0 {
            (rtts[mid - 1] + rtts[mid]) / 2.0
        } else {
            rtts[mid]
        };
        let limit = (median * self.config.outlier_multiple).max(median + MIN_OUTLIER_MARGIN_US);
        self.window
            .iter()
            .filter(|s| (s.round_trip() as f64) <= limit)
            .cloned()
            .collect()
    }

    fn evaluate(&mut self, estimate: ClockOffset) -> Option<ClockEvent> {
        let within_bound = estimate.error_bound_us < self.config.max_error_us;
        if !self.synchronized {
            if within_bound {
                info!("clock synchronized: {}", estimate);
                self.valid = Some(estimate);
                self.anchor = Some(estimate);
                self.synchronized = true;
                self.drift_count = 0;
                self.probe_timer.set_interval(self.config.synced_probe_interval);
                return Some(ClockEvent::Synchronized(estimate));
            }
            return None;
        }

        if within_bound {
            self.valid = Some(estimate);
        }
        let drifted = match self.anchor {
            Some(anchor) => {
                let bound = anchor.error_bound_us.max(estimate.error_bound_us);
                !within_bound || ((estimate.offset_us - anchor.offset_us).abs() as f64) > bound
            }
            None => !within_bound,
        };
        if drifted {
            self.drift_count += 1;
            debug!("clock drift {} of {}: {}", self.drift_count, self.config.drift_limit, estimate);
        } else {
            self.drift_count = 0;
        }
        if self.drift_count >= self.config.drift_limit {
            warn!("clock drifted out of its error bound, resync required");
            self.drift_count = 0;
            return Some(ClockEvent::ResyncRequired);
        }
        None
    }
}
