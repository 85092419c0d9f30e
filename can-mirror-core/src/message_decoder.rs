//! Message Decoding Engine
//!
//! Extracts signal values from raw payloads based on the definitions in the
//! signal database. Handles bit extraction, byte order, sign extension,
//! multiplexing and physical value conversion.

use crate::signals::database::{ByteOrder, MessageDefinition, SignalDefinition, ValueType};
use crate::types::{DecodedSignal, SignalValue};

/// Message decoder - extracts signals from CAN payloads
pub struct MessageDecoder;

impl MessageDecoder {
    /// Decode every signal of `message_def` present in `data`.
    ///
    /// Multiplexed signals are only returned when the multiplexer selects
    /// them. Signals that do not fit the payload are skipped.
    pub fn decode_message(data: &[u8], message_def: &MessageDefinition) -> Vec<DecodedSignal> {
        let multiplexer_value = message_def
            .multiplexer_signal
            .as_ref()
            .and_then(|name| message_def.signals.iter().find(|s| &s.name == name))
            .and_then(|mux| Self::extract_signal_value(data, mux))
            .map(|v| v as u64);

        message_def
            .signals
            .iter()
            .filter(|signal| match &signal.multiplexer_info {
                Some(mux_info) => multiplexer_value
                    .map(|v| mux_info.multiplexer_values.contains(&v))
                    .unwrap_or(false),
                None => true,
            })
            .filter_map(|signal| Self::decode_signal(data, signal))
            .collect()
    }

    /// Decode a single signal from payload data
    fn decode_signal(data: &[u8], signal: &SignalDefinition) -> Option<DecodedSignal> {
        let raw_value = Self::extract_signal_value(data, signal)?;

        let value = if signal.factor == 1.0 && signal.offset == 0.0 {
            SignalValue::Integer(raw_value)
        } else {
            SignalValue::Float(signal.offset + signal.factor * raw_value as f64)
        };

        Some(DecodedSignal {
            name: signal.name.clone(),
            value,
            unit: signal.unit.clone(),
            raw_value,
        })
    }

    /// Extract the raw (sign-extended) value of a signal
    fn extract_signal_value(data: &[u8], signal: &SignalDefinition) -> Option<i64> {
        let start_bit = signal.start_bit as usize;
        let length = signal.length as usize;
        if length == 0 || length > 64 {
            return None;
        }

        let raw_value = match signal.byte_order {
            ByteOrder::LittleEndian => Self::extract_little_endian(data, start_bit, length),
            ByteOrder::BigEndian => Self::extract_big_endian(data, start_bit, length),
        };

        let Some(raw_value) = raw_value else {
            log::trace!(
                "Signal '{}' does not fit a {} byte payload",
                signal.name,
                data.len()
            );
            return None;
        };

        Some(match signal.value_type {
            ValueType::Unsigned => raw_value as i64,
            ValueType::Signed => Self::sign_extend(raw_value, length),
        })
    }

    /// Intel byte order: the start bit is the LSB, bits are numbered LSB
    /// first within each byte and the signal grows towards higher bytes.
    fn extract_little_endian(data: &[u8], start_bit: usize, length: usize) -> Option<u64> {
        let mut result: u64 = 0;

        for i in 0..length {
            let bit_pos = start_bit + i;
            let byte = *data.get(bit_pos / 8)?;
            let bit_value = (byte >> (bit_pos % 8)) & 0x01;
            result |= (bit_value as u64) << i;
        }

        Some(result)
    }

    /// Motorola byte order: the start bit is the MSB. Walking towards the
    /// LSB moves down within a byte and wraps to bit 7 of the next byte.
    fn extract_big_endian(data: &[u8], start_bit: usize, length: usize) -> Option<u64> {
        let mut result: u64 = 0;
        let mut bit_pos = start_bit;

        for _ in 0..length {
            let byte = *data.get(bit_pos / 8)?;
            let bit_value = (byte >> (bit_pos % 8)) & 0x01;
            result = (result << 1) | bit_value as u64;

            bit_pos = if bit_pos % 8 == 0 { bit_pos + 15 } else { bit_pos - 1 };
        }

        Some(result)
    }

    /// Sign-extend a value from N bits to 64 bits
    fn sign_extend(value: u64, bit_length: usize) -> i64 {
        if bit_length >= 64 {
            return value as i64;
        }

        let sign_bit = 1u64 << (bit_length - 1);
        if (value & sign_bit) != 0 {
            let mask = !0u64 << bit_length;
            (value | mask) as i64
        } else {
            value as i64
        }
    }
}
