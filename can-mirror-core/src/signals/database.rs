//! Signal database
//!
//! Message and signal definitions loaded from DBC files, queryable by
//! frame identifier.

use crate::message_decoder::MessageDecoder;
use crate::signals::{dbc, SignalColumn, SignalSource};
use crate::types::{CoreError, DecodedSignal, Result};
use std::collections::HashMap;
use std::path::Path;

/// A CAN message definition
#[derive(Debug, Clone)]
pub struct MessageDefinition {
    /// Frame identifier without the extended flag bit
    pub id: u32,
    pub name: String,
    /// Declared payload size in bytes
    pub size: usize,
    pub sender: Option<String>,
    /// Signals in definition order
    pub signals: Vec<SignalDefinition>,
    pub is_multiplexed: bool,
    pub multiplexer_signal: Option<String>,
    /// File the definition came from
    pub source: String,
}

/// A CAN signal definition
#[derive(Debug, Clone)]
pub struct SignalDefinition {
    pub name: String,
    /// Start bit as written in the database (LSB for Intel, MSB for Motorola)
    pub start_bit: u16,
    /// Length in bits
    pub length: u16,
    pub byte_order: ByteOrder,
    pub value_type: ValueType,
    pub factor: f64,
    pub offset: f64,
    pub min: f64,
    pub max: f64,
    /// Engineering unit (e.g. "rpm", "V")
    pub unit: Option<String>,
    /// Set for signals that are only present for some multiplexer values
    pub multiplexer_info: Option<MultiplexerInfo>,
}

/// Byte order for signal extraction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    /// Intel format
    LittleEndian,
    /// Motorola format
    BigEndian,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    Signed,
    Unsigned,
}

/// Multiplexer information for multiplexed signals
#[derive(Debug, Clone)]
pub struct MultiplexerInfo {
    /// Name of the multiplexer signal that controls this signal
    pub multiplexer_signal: String,
    /// Multiplexer value(s) for which this signal is active
    pub multiplexer_values: Vec<u64>,
}

/// Database statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatabaseStats {
    pub num_messages: usize,
    pub num_signals: usize,
}

/// Signal database keyed by frame identifier
#[derive(Debug, Default)]
pub struct SignalDatabase {
    messages: HashMap<u32, MessageDefinition>,
}

impl SignalDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every message of a DBC file
    pub fn from_dbc_file(path: &Path) -> Result<Self> {
        let mut db = Self::new();
        for message in dbc::parse_dbc_file(path)? {
            db.add_message(message);
        }
        Ok(db)
    }

    /// Build a database from DBC text
    pub fn from_dbc_str(content: &str, source: &str) -> Result<Self> {
        let mut db = Self::new();
        for message in dbc::parse_dbc_str(content, source)? {
            db.add_message(message);
        }
        Ok(db)
    }

    /// Add a message definition. A later definition for the same
    /// identifier replaces the earlier one.
    pub fn add_message(&mut self, message: MessageDefinition) {
        if let Some(previous) = self.messages.insert(message.id, message) {
            log::warn!(
                "Message 0x{:X} ({}) redefined, keeping the later definition",
                previous.id,
                previous.name
            );
        }
    }

    pub fn get_message(&self, can_id: u32) -> Option<&MessageDefinition> {
        self.messages.get(&can_id)
    }

    /// Messages sorted by name
    pub fn messages_by_name(&self) -> Vec<&MessageDefinition> {
        let mut messages: Vec<&MessageDefinition> = self.messages.values().collect();
        messages.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        messages
    }

    pub fn stats(&self) -> DatabaseStats {
        DatabaseStats {
            num_messages: self.messages.len(),
            num_signals: self.messages.values().map(|m| m.signals.len()).sum(),
        }
    }
}

impl SignalSource for SignalDatabase {
    fn columns(&self) -> Vec<SignalColumn> {
        self.messages_by_name()
            .into_iter()
            .flat_map(|msg| msg.signals.iter())
            .map(|sig| SignalColumn {
                name: sig.name.clone(),
                unit: sig.unit.clone().unwrap_or_default(),
            })
            .collect()
    }

    fn decode(&self, can_id: u32, payload: &[u8]) -> Result<Vec<DecodedSignal>> {
        let message = self
            .get_message(can_id)
            .ok_or(CoreError::MessageNotFound(can_id))?;

        if payload.len() < message.size {
            return Err(CoreError::InvalidData(format!(
                "{}: {} bytes, expected {}",
                message.name,
                payload.len(),
                message.size
            )));
        }

        Ok(MessageDecoder::decode_message(payload, message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SignalValue;

    fn signal(name: &str, start_bit: u16, length: u16, factor: f64, unit: Option<&str>) -> SignalDefinition {
        SignalDefinition {
            name: name.to_string(),
            start_bit,
            length,
            byte_order: ByteOrder::LittleEndian,
            value_type: ValueType::Unsigned,
            factor,
            offset: 0.0,
            min: 0.0,
            max: 0.0,
            unit: unit.map(str::to_string),
            multiplexer_info: None,
        }
    }

    fn message(id: u32, name: &str, size: usize, signals: Vec<SignalDefinition>) -> MessageDefinition {
        MessageDefinition {
            id,
            name: name.to_string(),
            size,
            sender: None,
            signals,
            is_multiplexed: false,
            multiplexer_signal: None,
            source: "test.dbc".to_string(),
        }
    }

    fn sample_db() -> SignalDatabase {
        let mut db = SignalDatabase::new();
        db.add_message(message(
            0x200,
            "Zeta",
            2,
            vec![signal("Current", 0, 16, 0.1, Some("A"))],
        ));
        db.add_message(message(
            0x100,
            "Alpha",
            2,
            vec![signal("Speed", 0, 8, 1.0, Some("km/h")), signal("Gear", 8, 4, 1.0, None)],
        ));
        db
    }

    #[test]
    fn test_empty_database() {
        let db = SignalDatabase::new();
        assert_eq!(db.stats(), DatabaseStats { num_messages: 0, num_signals: 0 });
        assert!(db.columns().is_empty());
    }

    #[test]
    fn test_columns_sorted_by_message_name() {
        let columns = sample_db().columns();
        let names: Vec<&str> = columns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["Speed", "Gear", "Current"]);
        assert_eq!(columns[0].unit, "km/h");
        assert_eq!(columns[1].unit, "");
    }

    #[test]
    fn test_decode_known_message() {
        let signals = sample_db().decode(0x200, &[0x0F, 0x00]).unwrap();
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].name, "Current");
        assert_eq!(signals[0].raw_value, 15);
        assert_eq!(signals[0].value.to_string(), "1.5");
    }

    #[test]
    fn test_decode_errors() {
        let db = sample_db();
        assert!(matches!(db.decode(0x300, &[0; 8]), Err(CoreError::MessageNotFound(0x300))));
        assert!(matches!(db.decode(0x100, &[1]), Err(CoreError::InvalidData(_))));
    }

    #[test]
    fn test_longer_payload_is_accepted() {
        let signals = sample_db().decode(0x100, &[40, 0x03, 0xFF]).unwrap();
        assert_eq!(signals[0].value, SignalValue::Integer(40));
        assert_eq!(signals[1].value, SignalValue::Integer(3));
    }
}
