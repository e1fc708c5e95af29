//! Environment overrides for [`DeviceConfig`].
//!
//! - `DEPTH_MONITOR_DEPTH_MODE`: `nfov_binned`, `nfov_unbinned`, `wfov_binned`,
//!   `wfov_unbinned` or `passive_ir` (parsed, then rejected by validation)
//! - `DEPTH_MONITOR_FPS`: `5`, `15` or `30`
//! - `DEPTH_MONITOR_STREAMING_INDICATOR`: show the streaming LED (`1`/`0`)
//! - `DEPTH_MONITOR_FETCH_TIMEOUT_MS`: per-frame wait in milliseconds
//!
//! Unrecognised values fall back to the defaults.

use crate::types::{DepthMode, DeviceConfig, FrameRate};
use crate::Result;
use std::time::Duration;

pub const ENV_DEPTH_MODE: &str = "DEPTH_MONITOR_DEPTH_MODE";
pub const ENV_FPS: &str = "DEPTH_MONITOR_FPS";
pub const ENV_STREAMING_INDICATOR: &str = "DEPTH_MONITOR_STREAMING_INDICATOR";
pub const ENV_FETCH_TIMEOUT_MS: &str = "DEPTH_MONITOR_FETCH_TIMEOUT_MS";

impl DeviceConfig {
    /// Default configuration with environment overrides applied, validated.
    pub fn from_env() -> Result<DeviceConfig> {
        let config = Self::from_lookup(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> DeviceConfig {
        let defaults = DeviceConfig::default();

        let depth_mode = read_string(&lookup, ENV_DEPTH_MODE)
            .map(|v| {
                DepthMode::parse(&v).unwrap_or_else(|| {
                    log::warn!(
                        "Unknown {}='{}', using {:?}",
                        ENV_DEPTH_MODE,
                        v,
                        defaults.depth_mode
                    );
                    defaults.depth_mode
                })
            })
            .unwrap_or(defaults.depth_mode);

        let frame_rate = read_u64(&lookup, ENV_FPS)
            .and_then(|hz| u32::try_from(hz).ok())
            .and_then(|hz| {
                let rate = FrameRate::from_hz(hz);
                if rate.is_none() {
                    log::warn!("Unsupported {}={}, using 15", ENV_FPS, hz);
                }
                rate
            })
            .unwrap_or(defaults.frame_rate);

        let disable_streaming_indicator = read_bool(&lookup, ENV_STREAMING_INDICATOR)
            .map(|show| !show)
            .unwrap_or(defaults.disable_streaming_indicator);

        let fetch_timeout = read_u64(&lookup, ENV_FETCH_TIMEOUT_MS)
            .filter(|&ms| ms > 0)
            .map(Duration::from_millis)
            .unwrap_or(defaults.fetch_timeout);

        DeviceConfig {
            depth_mode,
            frame_rate,
            disable_streaming_indicator,
            color_enabled: false,
            fetch_timeout,
        }
    }
}

fn read_string(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    lookup(name)
        .map(|v| v.trim().to_ascii_lowercase())
        .filter(|v| !v.is_empty())
}

fn read_bool(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<bool> {
    read_string(lookup, name).and_then(|v| match v.as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    })
}

fn read_u64(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<u64> {
    read_string(lookup, name).and_then(|v| v.parse::<u64>().ok())
}
