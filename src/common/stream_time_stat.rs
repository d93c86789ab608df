//! Timing helpers for the event loop.
//!
//! [`StreamTimeStat`] keeps a sliding window of samples (round trip times, transit
//! times) and reports mean, variance and peak over that window.  [`MicroTimer`] is the
//! timer every timeout and periodic task in the engine is built on.
use std::collections::VecDeque;
use std::fmt;

use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct StreamTimeStat {
    samples: VecDeque<f64>,
    window: usize,
}

impl StreamTimeStat {
    pub fn build(window_size: usize) -> StreamTimeStat {
        StreamTimeStat {
            samples: VecDeque::with_capacity(window_size.max(1)),
            window: window_size.max(1),
        }
    }
    pub fn clear(&mut self) -> () {
        self.samples.clear();
    }
    pub fn len(&self) -> usize {
        self.samples.len()
    }
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
    pub fn get_window(&self) -> usize {
        self.window
    }
    pub fn add_sample(&mut self, sample: f64) -> () {
        if self.samples.len() == self.window {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }
    pub fn get_mean(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().sum::<f64>() / self.samples.len() as f64
    }
    /// population variance over the window
    pub fn get_variance(&self) -> f64 {
        if self.samples.len() < 2 {
            return 0.0;
        }
        let mean = self.get_mean();
        self.samples.iter().map(|s| (s - mean) * (s - mean)).sum::<f64>() / self.samples.len() as f64
    }
    pub fn get_sigma(&self) -> f64 {
        self.get_variance().sqrt()
    }
    pub fn get_peak(&self) -> f64 {
        self.samples.iter().cloned().fold(0.0, f64::max)
    }
}

impl fmt::Display for StreamTimeStat {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{{ peak: {:.2}, mean: {:.2}, sigma: {:.2} window: {} }}",
            self.get_peak(),
            self.get_mean(),
            self.get_sigma(),
            self.window
        )
    }
}

#[cfg(test)]
mod test_stream_time_stat {
    use super::*;

    #[test]
    fn build() {
        let stat = StreamTimeStat::build(100);
        assert_eq!(stat.get_mean(), 0.0);
        assert_eq!(stat.get_variance(), 0.0);
    }
    #[test]
    fn mean_and_variance() {
        let mut stat = StreamTimeStat::build(4);
        for s in [2.0, 4.0, 4.0, 6.0] {
            stat.add_sample(s);
        }
        assert_eq!(stat.get_mean(), 4.0);
        assert_eq!(stat.get_variance(), 2.0);
        assert_eq!(stat.get_peak(), 6.0);
    }
    #[test]
    fn window_slides() {
        let mut stat = StreamTimeStat::build(2);
        stat.add_sample(100.0);
        stat.add_sample(1.0);
        stat.add_sample(1.0);
        assert_eq!(stat.len(), 2);
        assert_eq!(stat.get_mean(), 1.0);
        assert_eq!(stat.get_variance(), 0.0);
    }
}

/// Interval timer on the engine's microsecond clock.
#[derive(Debug, Clone)]
pub struct MicroTimer {
    last_time: u128,
    interval: u128,
}

impl MicroTimer {
    pub fn new(now: u128, interval: u128) -> MicroTimer {
        MicroTimer {
            last_time: now,
            interval: interval,
        }
    }
    pub fn set_interval(&mut self, interval: u128) -> () {
        self.interval = interval;
    }
    pub fn get_interval(&self) -> u128 {
        self.interval
    }
    /// true once the full interval has elapsed
    pub fn expired(&self, now: u128) -> bool {
        now >= self.last_time + self.interval
    }
    pub fn reset(&mut self, now: u128) {
        self.last_time = now;
    }
    /// move on by exactly one interval, for periodic work that has to catch up
    pub fn advance(&mut self) {
        self.last_time += self.interval;
    }
    pub fn since(&self, now: u128) -> u128 {
        now.saturating_sub(self.last_time)
    }
}
