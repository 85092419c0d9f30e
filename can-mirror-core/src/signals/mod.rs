//! Signal databases
//!
//! The decoded-signal loggers only need two things from a database: the
//! ordered list of columns it can produce and a decoder from
//! `(identifier, payload)` to signal values. [`SignalSource`] is that
//! boundary; [`SignalDatabase`] implements it on top of DBC files.

pub mod database;
pub mod dbc;

pub use database::{
    ByteOrder, DatabaseStats, MessageDefinition, MultiplexerInfo, SignalDatabase,
    SignalDefinition, ValueType,
};

use crate::types::{DecodedSignal, Result};

/// One output column of a decoded-signal log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalColumn {
    pub name: String,
    /// Engineering unit, empty when the database has none
    pub unit: String,
}

impl SignalColumn {
    pub fn new(name: impl Into<String>, unit: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            unit: unit.into(),
        }
    }
}

/// Opaque decoder used by the signal loggers
pub trait SignalSource: Send + Sync {
    /// Columns in stable order: messages sorted by name, then signals in
    /// definition order
    fn columns(&self) -> Vec<SignalColumn>;

    /// Decode a payload. Fails with `MessageNotFound` for unknown
    /// identifiers and `InvalidData` for malformed payloads.
    fn decode(&self, can_id: u32, payload: &[u8]) -> Result<Vec<DecodedSignal>>;
}
