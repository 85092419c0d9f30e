//! Cyclic transmit list
//!
//! Operator-defined frames sent periodically while the bus is connected,
//! and the JSON history file that keeps the list between sessions.

use crate::driver::BusWriter;
use crate::types::{Frame, Result, MAX_DLC};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fs;
use std::path::{Path, PathBuf};

/// One row of the transmit list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransmitEntry {
    #[serde(default)]
    pub enabled: bool,
    pub can_id: u32,
    #[serde(default)]
    pub extended: bool,
    /// Declared data length; `data` is zero-padded or truncated to it
    #[serde(default = "default_length")]
    pub length: u8,
    #[serde(default)]
    pub data: Vec<u8>,
    /// Transmit period in milliseconds; 0 disables cyclic sending.
    /// Stored as text in history files.
    #[serde(
        rename = "cycle",
        default,
        serialize_with = "serialize_cycle",
        deserialize_with = "deserialize_cycle"
    )]
    pub cycle_ms: f64,
    #[serde(default)]
    pub comment: String,
}

fn default_length() -> u8 {
    MAX_DLC as u8
}

fn serialize_cycle<S: Serializer>(cycle: &f64, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(&crate::types::SignalValue::Float(*cycle).to_string())
}

fn deserialize_cycle<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<f64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Cycle {
        Number(f64),
        Text(String),
    }

    // Unparseable text behaves like "no cycle"
    let cycle = match Cycle::deserialize(deserializer)? {
        Cycle::Number(n) => n,
        Cycle::Text(s) => s.trim().parse().unwrap_or(0.0),
    };
    Ok(if cycle.is_finite() { cycle.max(0.0) } else { 0.0 })
}

impl TransmitEntry {
    pub fn new(can_id: u32, data: &[u8]) -> Self {
        Self {
            enabled: true,
            can_id,
            extended: can_id > crate::types::STANDARD_ID_MASK,
            length: data.len().min(MAX_DLC) as u8,
            data: data.to_vec(),
            cycle_ms: 0.0,
            comment: String::new(),
        }
    }

    /// Builder method: set the transmit period
    pub fn with_cycle_ms(mut self, cycle_ms: f64) -> Self {
        self.cycle_ms = cycle_ms;
        self
    }

    /// Builder method: set the comment
    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = comment.into();
        self
    }

    pub fn is_cyclic(&self) -> bool {
        self.enabled && self.cycle_ms > 0.0
    }

    /// The frame this entry transmits
    pub fn frame(&self) -> Result<Frame> {
        let len = (self.length as usize).min(MAX_DLC);
        let mut data = [0u8; MAX_DLC];
        let copied = self.data.len().min(len);
        data[..copied].copy_from_slice(&self.data[..copied]);
        Frame::new(self.can_id, self.extended, &data[..len])
    }
}

/// Decides when cyclic entries are due
#[derive(Debug, Default)]
pub struct TransmitSchedule {
    entries: Vec<TransmitEntry>,
    last_sent_ms: Vec<Option<f64>>,
}

impl TransmitSchedule {
    pub fn new(entries: Vec<TransmitEntry>) -> Self {
        let last_sent_ms = vec![None; entries.len()];
        Self { entries, last_sent_ms }
    }

    pub fn entries(&self) -> &[TransmitEntry] {
        &self.entries
    }

    pub fn push(&mut self, entry: TransmitEntry) {
        self.entries.push(entry);
        self.last_sent_ms.push(None);
    }

    /// Enable or disable an entry. Returns false for an unknown index.
    pub fn set_enabled(&mut self, index: usize, enabled: bool) -> bool {
        match self.entries.get_mut(index) {
            Some(entry) => {
                entry.enabled = enabled;
                true
            }
            None => false,
        }
    }

    /// Indices of the entries due at `now_ms`
    pub fn due(&self, now_ms: f64) -> Vec<usize> {
        self.entries
            .iter()
            .zip(&self.last_sent_ms)
            .enumerate()
            .filter(|(_, (entry, last))| {
                entry.is_cyclic() && last.map_or(true, |last| now_ms - last >= entry.cycle_ms)
            })
            .map(|(idx, _)| idx)
            .collect()
    }

    pub fn mark_sent(&mut self, index: usize, now_ms: f64) {
        if let Some(slot) = self.last_sent_ms.get_mut(index) {
            *slot = Some(now_ms);
        }
    }

    /// Send every due entry. Only successful writes restart an entry's
    /// period; the frames sent are returned.
    pub fn send_due(&mut self, now_ms: f64, bus: &mut dyn BusWriter) -> Vec<Frame> {
        let mut sent = Vec::new();
        for idx in self.due(now_ms) {
            let frame = match self.entries[idx].frame() {
                Ok(frame) => frame,
                Err(e) => {
                    log::warn!("Transmit entry {} is invalid: {}", idx, e);
                    continue;
                }
            };
            match bus.write_frame(&frame) {
                Ok(()) => {
                    self.mark_sent(idx, now_ms);
                    sent.push(frame);
                }
                Err(e) => log::debug!("Cyclic transmit of {} failed: {}", frame, e),
            }
        }
        sent
    }
}

/// JSON persistence of the transmit list
#[derive(Debug, Clone)]
pub struct TransmitHistory {
    path: PathBuf,
}

impl TransmitHistory {
    pub const DEFAULT_FILE: &'static str = "tx_history.json";

    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn save(&self, entries: &[TransmitEntry]) -> Result<()> {
        let json = serde_json::to_string_pretty(entries)?;
        fs::write(&self.path, json)?;
        log::debug!("Saved {} transmit entries to {:?}", entries.len(), self.path);
        Ok(())
    }

    /// Load the saved list. A missing file is an empty list; every loaded
    /// entry comes back disabled.
    pub fn load(&self) -> Result<Vec<TransmitEntry>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&self.path)?;
        let mut entries: Vec<TransmitEntry> = serde_json::from_str(&content)?;
        for entry in &mut entries {
            entry.enabled = false;
        }
        log::debug!("Loaded {} transmit entries from {:?}", entries.len(), self.path);
        Ok(entries)
    }
}
