//! These modules are shared by every part of the duet engine and its binaries.
use std::time::{SystemTime, UNIX_EPOCH};

pub mod box_error;
pub mod config;
pub mod duet_config;
pub mod duet_error;
pub mod stream_time_stat;

/// Wall clock in microseconds.  The event loop passes this value down to every component
/// so that timers, clock samples and frame arrivals all share one time base.
pub fn get_micro_time() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros())
        .unwrap_or(0)
}

/// convert milliseconds (the unit used in settings) to the microseconds used internally
pub fn ms_to_micros(ms: u32) -> u128 {
    ms as u128 * 1000
}

#[cfg(test)]
mod test_common {
    use super::*;

    #[test]
    fn micro_time_moves_forward() {
        let a = get_micro_time();
        let b = get_micro_time();
        assert!(b >= a);
        assert!(a > 0);
    }
    #[test]
    fn converts_ms() {
        assert_eq!(ms_to_micros(500), 500_000);
    }
}
