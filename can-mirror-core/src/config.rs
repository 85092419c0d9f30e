//! Component configuration types
//!
//! Plain serde-friendly settings for the acquisition machine, the trace
//! writer and the decoded-signal loggers. Application-level file formats
//! (TOML sessions, command-line overrides) are owned by the caller.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Settings for the acquisition state machine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcquisitionConfig {
    /// Driver channel name (e.g. "can0", "PCAN_USBBUS1")
    pub channel: String,

    /// Bus bitrate in bit/s
    #[serde(default = "default_bitrate")]
    pub bitrate: u32,

    /// Delay between failed initialization attempts (default: 800ms)
    #[serde(default = "default_reconnect_backoff_ms")]
    pub reconnect_backoff_ms: u64,

    /// Yield after an empty receive queue (default: 1ms)
    #[serde(default = "default_idle_yield_ms")]
    pub idle_yield_ms: u64,

    /// Yield after an unexpected read error (default: 2ms)
    #[serde(default = "default_error_yield_ms")]
    pub error_yield_ms: u64,
}

fn default_bitrate() -> u32 {
    250_000
}

fn default_reconnect_backoff_ms() -> u64 {
    800
}

fn default_idle_yield_ms() -> u64 {
    1
}

fn default_error_yield_ms() -> u64 {
    2
}

impl AcquisitionConfig {
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            bitrate: default_bitrate(),
            reconnect_backoff_ms: default_reconnect_backoff_ms(),
            idle_yield_ms: default_idle_yield_ms(),
            error_yield_ms: default_error_yield_ms(),
        }
    }

    /// Builder method: set the bitrate
    pub fn with_bitrate(mut self, bitrate: u32) -> Self {
        self.bitrate = bitrate;
        self
    }

    /// Builder method: set the reconnect backoff
    pub fn with_reconnect_backoff(mut self, backoff: Duration) -> Self {
        self.reconnect_backoff_ms = backoff.as_millis() as u64;
        self
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }

    pub fn idle_yield(&self) -> Duration {
        Duration::from_millis(self.idle_yield_ms)
    }

    pub fn error_yield(&self) -> Duration {
        Duration::from_millis(self.error_yield_ms)
    }
}

/// Settings for the trace writer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceConfig {
    /// Rotate once the current file reaches this many bytes (default: 10 MiB)
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,

    /// Generator tag written into the header
    #[serde(default = "default_generator")]
    pub generator: String,
}

fn default_max_file_size() -> u64 {
    10 * 1024 * 1024
}

fn default_generator() -> String {
    "PCAN-View v5.0.1.007".to_string()
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            max_file_size: default_max_file_size(),
            generator: default_generator(),
        }
    }
}

impl TraceConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder method: set the rotation threshold in bytes
    pub fn with_max_file_size(mut self, bytes: u64) -> Self {
        self.max_file_size = bytes;
        self
    }

    /// Builder method: set the generator tag
    pub fn with_generator(mut self, generator: impl Into<String>) -> Self {
        self.generator = generator.into();
        self
    }
}

/// Settings shared by both decoded-signal logger strategies
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalLoggerConfig {
    /// Directory receiving the CSV files
    pub output_dir: PathBuf,

    /// File name prefix for the eager strategy; the selector strategy uses
    /// the activated variant's name instead
    #[serde(default = "default_prefix")]
    pub file_prefix: String,

    /// Snapshot interval in milliseconds (default: 500ms)
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
}

fn default_prefix() -> String {
    "signals".to_string()
}

fn default_interval_ms() -> u64 {
    500
}

impl SignalLoggerConfig {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            file_prefix: default_prefix(),
            interval_ms: default_interval_ms(),
        }
    }

    /// Builder method: set the file name prefix
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.file_prefix = prefix.into();
        self
    }

    /// Builder method: set the snapshot interval
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }
}
