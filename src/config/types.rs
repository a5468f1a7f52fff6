use std::path::PathBuf;
use serde::{Deserialize, Serialize};

use crate::device::constants::{
    CONNECT_DEADLINE, CONNECT_RETRIES, DEFAULT_NAME_FILTER, DEFAULT_PRESSURE_MAX, DEFAULT_PRESSURE_MIN,
    LINK_POLL_DELAY, RESCAN_INITIAL_DELAY, RESCAN_INTERVAL, RETRY_DELAY, SCAN_TIMEOUT,
};
use crate::device::scanner::NameMatch;
use crate::error::ConfigError;

/// Pressure values outside of this (inclusive) range are dropped as invalid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryRange {
    pub min: i32,
    pub max: i32,
}

impl TelemetryRange {
    pub fn contains(&self, value: i32) -> bool {
        (self.min..=self.max).contains(&value)
    }
}

impl Default for TelemetryRange {
    fn default() -> Self {
        TelemetryRange { min: DEFAULT_PRESSURE_MIN, max: DEFAULT_PRESSURE_MAX }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub name_filter: String,
    pub name_match: NameMatch,
    pub telemetry_range: TelemetryRange,
    pub scan_timeout_ms: u64,
    pub connect_retries: u32,
    pub retry_delay_ms: u64,
    pub rescan_initial_delay_ms: u64,
    pub rescan_interval_ms: u64,
    pub connect_deadline_ms: u64,
    pub link_poll_delay_ms: u64,
    // who the archived readings belong to; nothing is archived without it
    pub identity: Option<String>,
    pub archive_path: Option<PathBuf>,
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let range = self.telemetry_range;
        if range.min > range.max {
            return Err(ConfigError::InvalidRange { min: range.min, max: range.max });
        }

        let durations = [
            ("scanTimeoutMs", self.scan_timeout_ms),
            ("retryDelayMs", self.retry_delay_ms),
            ("rescanIntervalMs", self.rescan_interval_ms),
            ("linkPollDelayMs", self.link_poll_delay_ms),
        ];
        if let Some(&(field, _)) = durations.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::ZeroDuration { field });
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            name_filter: String::from(DEFAULT_NAME_FILTER),
            name_match: NameMatch::Contains,
            telemetry_range: TelemetryRange::default(),
            scan_timeout_ms: SCAN_TIMEOUT,
            connect_retries: CONNECT_RETRIES,
            retry_delay_ms: RETRY_DELAY,
            rescan_initial_delay_ms: RESCAN_INITIAL_DELAY,
            rescan_interval_ms: RESCAN_INTERVAL,
            connect_deadline_ms: CONNECT_DEADLINE,
            link_poll_delay_ms: LINK_POLL_DELAY,
            identity: None,
            archive_path: None,
        }
    }
}
