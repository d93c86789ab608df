//! Typed settings for the duet engine.
//!
//! The keys below can be overridden in settings.json, everything is in milliseconds
//! there and converted to microseconds here.
use log::info;

use crate::{
    clock::sync_engine::ClockConfig,
    common::{box_error::BoxError, config::Config, ms_to_micros},
    media::jitter_buffer::JitterConfig,
    session::state_machine::SessionTimeouts,
    signaling::{channel::ChannelConfig, retry::RetryPolicy},
};

pub const DEFAULT_SETTINGS_FILE: &str = "settings.json";

#[derive(Debug, Clone)]
pub struct DuetConfig {
    pub relay_url: String,
    pub ice_servers: Vec<String>,
    /// cadence of the playout stage (one frame per tick)
    pub frame_interval: u128,
    pub metrics_interval: u128,
    pub frame_queue_capacity: usize,
    pub channel: ChannelConfig,
    pub clock: ClockConfig,
    pub jitter: JitterConfig,
    pub timeouts: SessionTimeouts,
}

impl Default for DuetConfig {
    fn default() -> Self {
        DuetConfig {
            relay_url: String::from("ws://localhost:9002"),
            ice_servers: vec![
                String::from("stun:stun1.l.google.com:19302"),
                String::from("stun:stun2.l.google.com:19302"),
            ],
            frame_interval: ms_to_micros(20),
            metrics_interval: ms_to_micros(1000),
            frame_queue_capacity: 64,
            channel: ChannelConfig::default(),
            clock: ClockConfig::default(),
            jitter: JitterConfig::default(),
            timeouts: SessionTimeouts::default(),
        }
    }
}

/// built in defaults, in the units used by the settings file
pub fn default_settings() -> json::JsonValue {
    json::object! {
        "relay_url": "ws://localhost:9002",
        "ice_servers": ["stun:stun1.l.google.com:19302", "stun:stun2.l.google.com:19302"],
        "frame_interval_ms": 20,
        "metrics_interval_ms": 1000,
        "frame_queue_capacity": 64,
        "retry_base_ms": 500,
        "retry_cap_ms": 8000,
        "retry_attempts": 5,
        "reconnect_limit": 5,
        "dispatch_budget": 16,
        "negotiation_timeout_ms": 30000,
        "sync_timeout_ms": 10000,
        "clock_window": 32,
        "clock_min_samples": 8,
        "outlier_multiple": 3.0,
        "max_clock_error_ms": 30.0,
        "drift_limit": 3,
        "probe_interval_ms": 200,
        "probe_interval_synced_ms": 1000,
        "probe_timeout_ms": 2000,
        "jitter_initial_depth": 2,
        "jitter_floor": 1,
        "jitter_ceiling": 12,
        "jitter_high_water": 25.0,
        "jitter_low_water": 4.0,
        "jitter_calm_intervals": 3
    }
}

impl DuetConfig {
    /// Load from a settings file (settings.json when None)
    pub fn load(config_file: Option<&str>) -> Result<DuetConfig, BoxError> {
        let filename = config_file.unwrap_or(DEFAULT_SETTINGS_FILE);
        info!("Using config file: {}", filename);
        let config = Config::build(String::from(filename), default_settings())?;
        Self::from_config(&config)
    }

    pub fn from_config(config: &Config) -> Result<DuetConfig, BoxError> {
        let ms = |key: &str| -> Result<u128, BoxError> { Ok(ms_to_micros(config.get_u32_value(key, None)?)) };
        let count = |key: &str| -> Result<usize, BoxError> { Ok(config.get_u32_value(key, None)? as usize) };

        let duet = DuetConfig {
            relay_url: config.get_str_value("relay_url", None)?,
            ice_servers: config.get_str_list_value("ice_servers", None)?,
            frame_interval: ms("frame_interval_ms")?,
            metrics_interval: ms("metrics_interval_ms")?,
            frame_queue_capacity: count("frame_queue_capacity")?,
            channel: ChannelConfig {
                retry: RetryPolicy {
                    base_delay: ms("retry_base_ms")?,
                    max_delay: ms("retry_cap_ms")?,
                    max_attempts: config.get_u32_value("retry_attempts", None)?,
                },
                reconnect_limit: config.get_u32_value("reconnect_limit", None)?,
                dispatch_budget: count("dispatch_budget")?,
            },
            clock: ClockConfig {
                window: count("clock_window")?,
                min_samples: count("clock_min_samples")?,
                outlier_multiple: config.get_f64_value("outlier_multiple", None)?,
                max_error_us: config.get_f64_value("max_clock_error_ms", None)? * 1000.0,
                drift_limit: config.get_u32_value("drift_limit", None)?,
                probe_interval: ms("probe_interval_ms")?,
                synced_probe_interval: ms("probe_interval_synced_ms")?,
                probe_timeout: ms("probe_timeout_ms")?,
            },
            jitter: JitterConfig {
                initial_depth: count("jitter_initial_depth")?,
                floor: count("jitter_floor")?,
                ceiling: count("jitter_ceiling")?,
                high_water: config.get_f64_value("jitter_high_water", None)?,
                low_water: config.get_f64_value("jitter_low_water", None)?,
                calm_intervals: config.get_u32_value("jitter_calm_intervals", None)?,
            },
            timeouts: SessionTimeouts {
                negotiation: ms("negotiation_timeout_ms")?,
                sync: ms("sync_timeout_ms")?,
            },
        };
        duet.validate()?;
        Ok(duet)
    }

    fn validate(&self) -> Result<(), BoxError> {
        if self.jitter.floor == 0 || self.jitter.floor > self.jitter.ceiling {
            return Err(format!(
                "jitter floor {} must be at least 1 and not above ceiling {}",
                self.jitter.floor, self.jitter.ceiling
            )
            .into());
        }
        if self.clock.min_samples == 0 || self.clock.min_samples > self.clock.window {
            return Err(format!(
                "clock_min_samples {} must be between 1 and clock_window {}",
                self.clock.min_samples, self.clock.window
            )
            .into());
        }
        if self.channel.retry.max_attempts == 0 {
            return Err("retry_attempts must be at least 1".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod test_duet_config {
    use super::*;

    #[test]
    fn defaults_match_builtin_settings() {
        let config = Config::from_defaults(default_settings());
        let duet = DuetConfig::from_config(&config).unwrap();
        let def = DuetConfig::default();
        assert_eq!(duet.relay_url, def.relay_url);
        assert_eq!(duet.channel.retry.base_delay, 500_000);
        assert_eq!(duet.channel.retry.max_delay, 8_000_000);
        assert_eq!(duet.timeouts.negotiation, def.timeouts.negotiation);
        assert_eq!(duet.timeouts.sync, 10_000_000);
        assert_eq!(duet.clock.window, 32);
        assert_eq!(duet.clock.max_error_us, def.clock.max_error_us);
        assert_eq!(duet.jitter.initial_depth, 2);
        assert_eq!(duet.ice_servers.len(), 2);
    }

    #[test]
    fn overrides_and_validation() {
        let mut config = Config::from_defaults(default_settings());
        config.set_value("sync_timeout_ms", 2500).unwrap();
        let duet = DuetConfig::from_config(&config).unwrap();
        assert_eq!(duet.timeouts.sync, 2_500_000);

        config.set_value("jitter_floor", 0).unwrap();
        assert!(DuetConfig::from_config(&config).is_err());
    }
}
