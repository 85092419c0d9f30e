//! Core types for the CAN mirror/logging pipeline
//!
//! This module defines the frame model shared by every component, the
//! direction tag used by the trace writer, decoded signal values and the
//! crate-wide error type.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Result type for core operations
pub type Result<T> = std::result::Result<T, CoreError>;

/// Maximum payload of a classic CAN frame
pub const MAX_DLC: usize = 8;

/// Mask for 11-bit standard identifiers
pub const STANDARD_ID_MASK: u32 = 0x7FF;

/// Mask for 29-bit extended identifiers
pub const EXTENDED_ID_MASK: u32 = 0x1FFF_FFFF;

/// A classic CAN frame as exchanged with the hardware driver.
///
/// Only the first `len` bytes of `data` are meaningful; the rest are kept
/// zeroed so that copies can be written back to the driver unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Frame {
    /// CAN identifier (11-bit or 29-bit)
    pub id: u32,
    /// True if this is an extended (29-bit) identifier
    pub extended: bool,
    /// True if this is a remote transmission request
    pub remote: bool,
    /// Data length (0..=8)
    len: u8,
    /// Payload, zero-padded to 8 bytes
    data: [u8; MAX_DLC],
}

impl Frame {
    /// Create a data frame. Fails if `data` is longer than 8 bytes or the
    /// identifier does not fit the selected format.
    pub fn new(id: u32, extended: bool, data: &[u8]) -> Result<Self> {
        if data.len() > MAX_DLC {
            return Err(CoreError::InvalidData(format!(
                "payload of {} bytes exceeds {} bytes",
                data.len(),
                MAX_DLC
            )));
        }

        let mask = if extended { EXTENDED_ID_MASK } else { STANDARD_ID_MASK };
        if id & !mask != 0 {
            return Err(CoreError::InvalidData(format!(
                "identifier 0x{:X} does not fit a {} frame",
                id,
                if extended { "29-bit" } else { "11-bit" }
            )));
        }

        let mut padded = [0u8; MAX_DLC];
        padded[..data.len()].copy_from_slice(data);

        Ok(Self {
            id,
            extended,
            remote: false,
            len: data.len() as u8,
            data: padded,
        })
    }

    /// Create a frame from a zero-padded payload and an explicit length.
    /// The length is clamped to 8 and bytes beyond it are cleared.
    pub fn from_padded(id: u32, extended: bool, len: usize, data: [u8; MAX_DLC]) -> Self {
        let len = len.min(MAX_DLC);
        let mut padded = data;
        padded[len..].fill(0);

        Self {
            id,
            extended,
            remote: false,
            len: len as u8,
            data: padded,
        }
    }

    /// Mark the frame as a remote transmission request
    pub fn with_remote(mut self, remote: bool) -> Self {
        self.remote = remote;
        self
    }

    /// Number of meaningful payload bytes
    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The meaningful payload bytes
    pub fn payload(&self) -> &[u8] {
        &self.data[..self.len()]
    }

    /// The full zero-padded payload
    pub fn padded_data(&self) -> [u8; MAX_DLC] {
        self.data
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04X} [{}]", self.id, self.len)?;
        for byte in self.payload() {
            write!(f, " {:02X}", byte)?;
        }
        Ok(())
    }
}

/// Opaque driver-supplied timestamp, convertible to microseconds.
///
/// Monotonic only within one connection session; the counter may restart
/// from an arbitrary origin after a reconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct HardwareTimestamp {
    micros: u64,
}

impl HardwareTimestamp {
    pub fn from_micros(micros: u64) -> Self {
        Self { micros }
    }

    /// Build from the millisecond counter and its microsecond remainder
    pub fn from_parts(millis: u64, micros: u16) -> Self {
        Self {
            micros: millis * 1000 + micros as u64,
        }
    }

    pub fn as_micros(&self) -> u64 {
        self.micros
    }
}

/// Direction tag of a trace entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    /// Received from the bus
    Rx,
    /// Transmitted by this host
    Tx,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Rx => f.pad("Rx"),
            Direction::Tx => f.pad("Tx"),
        }
    }
}

/// Errors that can occur in the core pipeline
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Driver error: {0}")]
    Driver(#[from] crate::driver::DriverError),

    #[error("Failed to parse DBC file: {0}")]
    DbcParse(String),

    #[error("Message not found: CAN ID 0x{0:X}")]
    MessageNotFound(u32),

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to rotate trace file: {0}")]
    Rotation(String),

    #[error("Writer halted after an earlier fault")]
    Halted,

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A decoded signal with its current value
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedSignal {
    /// Signal name from the database
    pub name: String,
    /// Physical value
    pub value: SignalValue,
    /// Engineering unit (e.g., "km/h", "V")
    pub unit: Option<String>,
    /// Raw value before scaling
    pub raw_value: i64,
}

/// Signal value types produced by the decoder
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SignalValue {
    /// Unscaled integer value
    Integer(i64),
    /// Floating-point value (after scaling/offset)
    Float(f64),
}

impl Default for SignalValue {
    fn default() -> Self {
        SignalValue::Integer(0)
    }
}

impl fmt::Display for SignalValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalValue::Integer(v) => write!(f, "{}", v),
            SignalValue::Float(v) => {
                // Whole values inside the exactly representable range print as integers
                if v.fract() == 0.0 && v.abs() < 1e15 {
                    return write!(f, "{}", *v as i64);
                }
                let text = format!("{:.6}", v);
                let trimmed = text.trim_end_matches('0').trim_end_matches('.');
                if trimmed.is_empty() || trimmed == "-" || trimmed == "-0" {
                    write!(f, "0")
                } else {
                    write!(f, "{}", trimmed)
                }
            }
        }
    }
}

impl SignalValue {
    /// Convert signal value to f64
    pub fn as_f64(&self) -> f64 {
        match self {
            SignalValue::Integer(v) => *v as f64,
            SignalValue::Float(v) => *v,
        }
    }
}
