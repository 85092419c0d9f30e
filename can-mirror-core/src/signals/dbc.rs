//! DBC loader
//!
//! Converts Vector DBC files parsed by `can-dbc` into message definitions.

use crate::signals::database::{
    ByteOrder, MessageDefinition, MultiplexerInfo, SignalDefinition, ValueType,
};
use crate::types::{CoreError, Result, EXTENDED_ID_MASK};
use std::path::Path;

/// Parse a DBC file and return message definitions
pub fn parse_dbc_file(path: &Path) -> Result<Vec<MessageDefinition>> {
    log::info!("Parsing DBC file: {:?}", path);

    let bytes = std::fs::read(path).map_err(|e| {
        CoreError::DbcParse(format!("Failed to read file {:?}: {}", path, e))
    })?;

    // Databases exported on Windows are often Latin-1
    let content = match String::from_utf8(bytes) {
        Ok(text) => text,
        Err(e) => {
            log::warn!("DBC file {:?} is not UTF-8, decoding as Latin-1", path);
            e.into_bytes().iter().map(|&b| b as char).collect()
        }
    };

    let source = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("unknown.dbc");

    let messages = parse_dbc_str(&content, source)?;
    log::info!("Parsed {} messages from {:?}", messages.len(), path);
    Ok(messages)
}

/// Parse DBC text
pub fn parse_dbc_str(content: &str, source: &str) -> Result<Vec<MessageDefinition>> {
    let dbc = can_dbc::DBC::from_slice(content.as_bytes()).map_err(|e| {
        CoreError::DbcParse(format!("Failed to parse DBC {}: {:?}", source, e))
    })?;

    dbc.messages()
        .iter()
        .map(|msg| convert_message(msg, source))
        .collect()
}

fn convert_message(dbc_msg: &can_dbc::Message, source: &str) -> Result<MessageDefinition> {
    let multiplexer_signal = dbc_msg
        .signals()
        .iter()
        .find(|s| matches!(s.multiplexer_indicator(), can_dbc::MultiplexIndicator::Multiplexor))
        .map(|s| s.name().to_string());

    let is_multiplexed = multiplexer_signal.is_some()
        || dbc_msg.signals().iter().any(|s| {
            matches!(
                s.multiplexer_indicator(),
                can_dbc::MultiplexIndicator::MultiplexedSignal(_)
            )
        });

    let signals = dbc_msg
        .signals()
        .iter()
        .map(|s| convert_signal(s, multiplexer_signal.as_deref()))
        .collect::<Result<Vec<_>>>()?;

    Ok(MessageDefinition {
        // Bit 31 flags extended identifiers in DBC files
        id: dbc_msg.message_id().0 & EXTENDED_ID_MASK,
        name: dbc_msg.message_name().to_string(),
        size: *dbc_msg.message_size() as usize,
        sender: match dbc_msg.transmitter() {
            can_dbc::Transmitter::NodeName(name) => Some(name.to_string()),
            _ => None,
        },
        signals,
        is_multiplexed,
        multiplexer_signal,
        source: source.to_string(),
    })
}

fn convert_signal(
    dbc_sig: &can_dbc::Signal,
    multiplexer_signal: Option<&str>,
) -> Result<SignalDefinition> {
    let byte_order = match *dbc_sig.byte_order() {
        can_dbc::ByteOrder::LittleEndian => ByteOrder::LittleEndian,
        can_dbc::ByteOrder::BigEndian => ByteOrder::BigEndian,
    };

    let value_type = match *dbc_sig.value_type() {
        can_dbc::ValueType::Signed => ValueType::Signed,
        can_dbc::ValueType::Unsigned => ValueType::Unsigned,
    };

    let multiplexer_info = match *dbc_sig.multiplexer_indicator() {
        can_dbc::MultiplexIndicator::MultiplexedSignal(switch_value) => Some(MultiplexerInfo {
            multiplexer_signal: multiplexer_signal
                .ok_or_else(|| {
                    CoreError::DbcParse(format!(
                        "Multiplexed signal '{}' without a multiplexer",
                        dbc_sig.name()
                    ))
                })?
                .to_string(),
            multiplexer_values: vec![switch_value],
        }),
        _ => None,
    };

    Ok(SignalDefinition {
        name: dbc_sig.name().to_string(),
        start_bit: *dbc_sig.start_bit() as u16,
        length: *dbc_sig.signal_size() as u16,
        byte_order,
        value_type,
        factor: *dbc_sig.factor(),
        offset: *dbc_sig.offset(),
        min: *dbc_sig.min(),
        max: *dbc_sig.max(),
        unit: Some(dbc_sig.unit().to_string()).filter(|u| !u.is_empty()),
        multiplexer_info,
    })
}
