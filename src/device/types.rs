use std::str::FromStr;
use std::time::SystemTime;

use crate::error::DeviceError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Scanning,
    Connecting,
    Connected,
    Disconnecting,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let result = match self {
            ConnectionState::Disconnected => "Disconnected",
            ConnectionState::Scanning => "Scanning",
            ConnectionState::Connecting => "Connecting",
            ConnectionState::Connected => "Connected",
            ConnectionState::Disconnecting => "Disconnecting",
        };

        write!(f, "{}", result)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    Idle,
    Scanning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Inflate,
    Deflate,
    EmergencyStop,
    Calibrate,
}

pub const COMMANDS: [Command; 4] = [
    Command::Inflate,
    Command::Deflate,
    Command::EmergencyStop,
    Command::Calibrate,
];

impl Command {
    /// The literal name understood by the cuff firmware.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Inflate => "INFLATE",
            Command::Deflate => "DEFLATE",
            Command::EmergencyStop => "EMERGENCY_STOP",
            Command::Calibrate => "CALIBRATE",
        }
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for Command {
    type Err = DeviceError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let value = value.trim();
        COMMANDS
            .into_iter()
            .find(|command| command.name().eq_ignore_ascii_case(value))
            .ok_or_else(|| DeviceError::UnknownCommand { name: value.to_string() })
    }
}

/// A pressure value received from the cuff. `received_at` is `None` for the baseline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TelemetryReading {
    pub value: i32,
    pub received_at: Option<SystemTime>,
}

impl TelemetryReading {
    pub fn baseline() -> Self {
        TelemetryReading { value: 0, received_at: None }
    }

    pub fn received(value: i32) -> Self {
        TelemetryReading { value, received_at: Some(SystemTime::now()) }
    }

    pub fn is_baseline(&self) -> bool {
        self.value == 0 && self.received_at.is_none()
    }
}

impl Default for TelemetryReading {
    fn default() -> Self {
        TelemetryReading::baseline()
    }
}

/// A peripheral as captured from its advertisement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peripheral {
    /// Platform specific identifier used to reach the peripheral again
    pub id: String,
    pub address: String,
    pub name: String,
}
