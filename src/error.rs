use std::io;
use std::str::Utf8Error;
use thiserror::Error;
use btleplug;
use serde_json;

use crate::device::types::Command;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to determine path to config file")]
    NoConfigPath,

    #[error("Failed to acquire file lock on config file: {source}")]
    CanNotLock { source: io::Error },

    #[error("Failed to encode/decode config as utf-8: {source}")]
    Utf8Error { #[from] source: Utf8Error },

    #[error("Failed to read/write config file: {source}")]
    IOError { #[from] source: io::Error },

    #[error("Failed to parse/build config file: {source}")]
    JsonError { #[from] source: serde_json::Error },

    #[error("Invalid telemetry range {min}..={max}")]
    InvalidRange { min: i32, max: i32 },

    #[error("{field} must be greater than zero")]
    ZeroDuration { field: &'static str },
}

impl ConfigError {
    pub fn is_file_not_found_error(&self) -> bool {
        match self {
            ConfigError::IOError { source } => source.kind() == io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("Failed to write archive file: {source}")]
    IOError { #[from] source: io::Error },

    #[error("Failed to encode save event: {source}")]
    JsonError { #[from] source: serde_json::Error },
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConsoleError {
    #[error("Unknown command {name:?}; type \"help\" for a list of commands")]
    UnknownCommand { name: String },

    #[error("Invalid amount {value:?}; expected a number of millilitres")]
    InvalidAmount { value: String },

    #[error("Missing amount; usage: water <millilitres>")]
    MissingAmount,
}

#[derive(Error, Debug)]
pub enum AppRunError {
    #[error("Failed to start application (runtime): {source}")]
    Runtime { #[from] source: io::Error },

    #[error("Failed to start application (config): {source}")]
    ConfigError { #[from] source: ConfigError },

    #[error("Failed to start application (device): {source}")]
    DeviceError { #[from] source: DeviceError },

    #[error("Archive sink stopped: {source}")]
    ArchiveError { #[from] source: ArchiveError },
}

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("Bluetooth permission denied")]
    PermissionDenied,

    #[error("No bluetooth adapter available")]
    RadioUnavailable,

    #[error("Scan failed: {reason}")]
    ScanFailed { reason: String },

    #[error("Connecting to peripheral failed: {reason}")]
    ConnectFailed { reason: String },

    #[error("Unsupported device: {reason}")]
    UnsupportedDevice { reason: String },

    #[error("Invalid pressure data: {frame:?}")]
    MalformedTelemetry { frame: String },

    #[error("Pressure value {value} is outside of {min}..={max}")]
    TelemetryOutOfRange { value: i32, min: i32, max: i32 },

    #[error("Failed to send command {command}: {reason}")]
    CommandWriteFailed { command: Command, reason: String },

    #[error("Not connected")]
    NotConnected,

    #[error("Unknown command {name:?}")]
    UnknownCommand { name: String },

    #[error("The connection manager has stopped")]
    ManagerStopped,

    #[error("Error communicating with device (btleplug): {source}")]
    Btle { source: btleplug::Error },
}

impl From<btleplug::Error> for DeviceError {
    fn from(source: btleplug::Error) -> Self {
        match source {
            btleplug::Error::PermissionDenied => DeviceError::PermissionDenied,
            source => DeviceError::Btle { source },
        }
    }
}

impl DeviceError {
    /// Errors that a new scan will not fix without user intervention.
    pub fn needs_remediation(&self) -> bool {
        matches!(self, DeviceError::PermissionDenied | DeviceError::RadioUnavailable)
    }
}
