//! One probe round trip and the offset derived from a window of them.
use serde::Serialize;
use std::fmt;

/// Timestamps of one ping/pong exchange, in microseconds.  `local_*` are on our clock,
/// `remote_*` on the peer's.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ClockSample {
    pub seq: u64,
    pub local_send: u128,
    pub remote_receive: u128,
    pub remote_send: u128,
    pub local_receive: u128,
}

impl ClockSample {
    /// Build a sample, rejecting timestamps that can not come from a real exchange
    pub fn new(
        seq: u64,
        local_send: u128,
        remote_receive: u128,
        remote_send: u128,
        local_receive: u128,
    ) -> Option<ClockSample> {
        if local_receive < local_send || remote_send < remote_receive {
            return None;
        }
        if remote_send - remote_receive > local_receive - local_send {
            // peer claims to have held the ping longer than the whole round trip
            return None;
        }
        Some(ClockSample {
            seq,
            local_send,
            remote_receive,
            remote_send,
            local_receive,
        })
    }

    /// network round trip, peer processing time excluded
    pub fn round_trip(&self) -> i128 {
        (self.local_receive - self.local_send) as i128 - (self.remote_send - self.remote_receive) as i128
    }

    /// remote clock minus local clock, assuming symmetric paths
    pub fn offset(&self) -> i128 {
        ((self.remote_receive as i128 - self.local_send as i128)
            + (self.remote_send as i128 - self.local_receive as i128))
            / 2
    }
}

/// The shared clock estimate.  `offset_us` is remote minus local.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ClockOffset {
    pub offset_us: i64,
    pub error_bound_us: f64,
    pub updated_at: u128,
    pub samples_used: usize,
}

impl ClockOffset {
    /// translate a time on our clock to the peer's clock
    pub fn to_remote_time(&self, local: u128) -> u128 {
        (local as i128 + self.offset_us as i128).max(0) as u128
    }
    /// translate a time on the peer's clock to ours
    pub fn to_local_time(&self, remote: u128) -> u128 {
        (remote as i128 - self.offset_us as i128).max(0) as u128
    }
    /// The same estimate seen from the other side
    pub fn inverted(&self, now: u128) -> ClockOffset {
        ClockOffset {
            offset_us: -self.offset_us,
            error_bound_us: self.error_bound_us,
            updated_at: now,
            samples_used: self.samples_used,
        }
    }
}

impl fmt::Display for ClockOffset {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{{ offset: {:.2}ms, error: {:.2}ms, samples: {} }}",
            self.offset_us as f64 / 1000.0,
            self.error_bound_us / 1000.0,
            self.samples_used
        )
    }
}

#[cfg(test)]
mod test_clock_sample {
    use super::*;

    #[test]
    fn offset_and_round_trip() {
        // peer clock runs 5ms ahead, 10ms each way, 1ms processing
        let s = ClockSample::new(1, 1_000_000, 1_015_000, 1_016_000, 1_021_000).unwrap();
        assert_eq!(s.round_trip(), 20_000);
        assert_eq!(s.offset(), 5_000);
    }

    #[test]
    fn rejects_impossible_samples() {
        assert!(ClockSample::new(1, 100, 50, 60, 90).is_none());
        assert!(ClockSample::new(1, 100, 60, 50, 200).is_none());
        assert!(ClockSample::new(1, 100, 0, 500, 200).is_none());
    }

    #[test]
    fn time_translation() {
        let off = ClockOffset {
            offset_us: -2_000,
            error_bound_us: 100.0,
            updated_at: 0,
            samples_used: 8,
        };
        assert_eq!(off.to_remote_time(10_000), 8_000);
        assert_eq!(off.to_local_time(8_000), 10_000);
        assert_eq!(off.inverted(5).offset_us, 2_000);
    }
}
