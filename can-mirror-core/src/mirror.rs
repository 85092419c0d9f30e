//! Mirror rule engine
//!
//! Re-broadcasts transformed copies of received frames. Each rule maps one
//! source identifier to a target identifier, optionally rewrites payload
//! bytes and may be throttled to a minimum interval.
//!
//! The rule table and the per-identifier RX cache live behind one mutex so
//! a display layer on another thread can read them while the acquisition
//! thread mirrors traffic.

use crate::driver::BusWriter;
use crate::timestamp::SharedClock;
use crate::types::{Frame, MAX_DLC};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

/// How a byte rule rewrites its byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ByteRuleMode {
    /// Add `value` to the received byte, clamped to 0..=255. A received
    /// byte of exactly 0 is left untouched.
    Offset,
    /// Replace the byte with `value & 0xFF`
    Replace,
}

/// Rewrite of a single payload byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByteRule {
    pub index: usize,
    pub mode: ByteRuleMode,
    pub value: i32,
}

impl ByteRule {
    pub fn offset(index: usize, value: i32) -> Self {
        Self {
            index,
            mode: ByteRuleMode::Offset,
            value,
        }
    }

    pub fn replace(index: usize, value: i32) -> Self {
        Self {
            index,
            mode: ByteRuleMode::Replace,
            value,
        }
    }

    /// Apply the rule to the first `len` bytes of `data`.
    /// Out-of-range indices are ignored.
    pub fn apply(&self, data: &mut [u8], len: usize) {
        if self.index >= len.min(data.len()) {
            return;
        }

        let original = data[self.index];
        data[self.index] = match self.mode {
            // Zero means "no signal present" rather than an additive base
            ByteRuleMode::Offset if original == 0 => return,
            ByteRuleMode::Offset => (original as i64 + self.value as i64).clamp(0, 255) as u8,
            ByteRuleMode::Replace => (self.value & 0xFF) as u8,
        };
    }
}

/// Mirroring rule for one source identifier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MirrorRule {
    /// Identifier of the received frame
    pub rx_id: u32,
    /// Identifier of the mirrored frame
    pub tx_id: u32,
    /// Send the mirrored frame with an extended identifier
    #[serde(default)]
    pub extended: bool,
    /// Minimum time between mirrored frames; 0 disables throttling
    #[serde(default)]
    pub interval_ms: u32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Applied in order
    #[serde(default)]
    pub byte_rules: Vec<ByteRule>,
    /// Host monotonic time of the last successful transmission
    #[serde(skip)]
    pub last_sent_mono_ms: Option<f64>,
}

fn default_enabled() -> bool {
    true
}

impl MirrorRule {
    pub fn new(rx_id: u32, tx_id: u32) -> Self {
        Self {
            rx_id,
            tx_id,
            extended: false,
            interval_ms: 0,
            enabled: true,
            byte_rules: Vec::new(),
            last_sent_mono_ms: None,
        }
    }

    /// Builder method: send with an extended identifier
    pub fn with_extended(mut self, extended: bool) -> Self {
        self.extended = extended;
        self
    }

    /// Builder method: throttle to one frame per `interval_ms`
    pub fn with_interval_ms(mut self, interval_ms: u32) -> Self {
        self.interval_ms = interval_ms;
        self
    }

    /// Builder method: append a byte rule
    pub fn with_byte_rule(mut self, rule: ByteRule) -> Self {
        self.byte_rules.push(rule);
        self
    }

    fn is_throttled(&self, now_ms: f64) -> bool {
        if self.interval_ms == 0 {
            return false;
        }
        match self.last_sent_mono_ms {
            Some(last) => now_ms - last < self.interval_ms as f64,
            None => false,
        }
    }

    /// Build the mirrored frame for `frame`. Pure; ignores enablement and
    /// throttling.
    pub fn transform(&self, frame: &Frame) -> Frame {
        let mut data = frame.padded_data();
        for rule in &self.byte_rules {
            rule.apply(&mut data, frame.len());
        }
        Frame::from_padded(self.tx_id, self.extended, frame.len(), data)
    }
}

/// Callback invoked for every successfully mirrored frame
pub type TxObserver = Box<dyn Fn(&Frame) + Send + Sync>;

#[derive(Default)]
struct MirrorTable {
    rules: HashMap<u32, MirrorRule>,
    rx_cache: HashMap<u32, [u8; MAX_DLC]>,
    tx_count: u64,
}

/// The mirror engine
pub struct MirrorEngine {
    table: Mutex<MirrorTable>,
    clock: SharedClock,
    on_tx: Mutex<Option<TxObserver>>,
}

impl MirrorEngine {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            table: Mutex::new(MirrorTable::default()),
            clock,
            on_tx: Mutex::new(None),
        }
    }

    fn table(&self) -> MutexGuard<'_, MirrorTable> {
        self.table
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Add a rule, replacing any rule with the same `rx_id`
    pub fn add_rule(&self, rule: MirrorRule) {
        log::debug!(
            "Mirror rule 0x{:X} -> 0x{:X} ({} byte rules, {} ms)",
            rule.rx_id,
            rule.tx_id,
            rule.byte_rules.len(),
            rule.interval_ms
        );
        self.table().rules.insert(rule.rx_id, rule);
    }

    pub fn remove_rule(&self, rx_id: u32) -> Option<MirrorRule> {
        self.table().rules.remove(&rx_id)
    }

    /// Enable or disable a rule. Returns false if no rule exists for `rx_id`.
    pub fn set_enabled(&self, rx_id: u32, enabled: bool) -> bool {
        match self.table().rules.get_mut(&rx_id) {
            Some(rule) => {
                rule.enabled = enabled;
                true
            }
            None => false,
        }
    }

    /// Snapshot of the rule table, sorted by source identifier
    pub fn rules(&self) -> Vec<MirrorRule> {
        let mut rules: Vec<MirrorRule> = self.table().rules.values().cloned().collect();
        rules.sort_by_key(|r| r.rx_id);
        rules
    }

    /// Most recent payload received for `rx_id`, zero-padded to 8 bytes.
    /// Never reflects mirror transformations.
    pub fn last_rx_snapshot(&self, rx_id: u32) -> [u8; MAX_DLC] {
        self.table()
            .rx_cache
            .get(&rx_id)
            .copied()
            .unwrap_or([0; MAX_DLC])
    }

    /// Number of frames mirrored so far
    pub fn tx_count(&self) -> u64 {
        self.table().tx_count
    }

    /// Register the observer notified about each mirrored frame
    pub fn set_tx_observer(&self, observer: Option<TxObserver>) {
        *self
            .on_tx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = observer;
    }

    /// Process a received frame and mirror it if a rule applies.
    ///
    /// Returns the transmitted frame when the write succeeded. A failed
    /// write leaves the throttle state untouched so the next receipt
    /// retries.
    pub fn handle_rx(&self, frame: &Frame, bus: &mut dyn BusWriter) -> Option<Frame> {
        let now_ms = self.clock.now_ms();

        let tx = {
            let mut table = self.table();
            table.rx_cache.insert(frame.id, frame.padded_data());

            let rule = table.rules.get(&frame.id)?;
            if !rule.enabled || rule.is_throttled(now_ms) {
                return None;
            }
            rule.transform(frame)
        };

        // The bus write happens outside the lock so readers never wait on I/O
        if let Err(e) = bus.write_frame(&tx) {
            log::warn!("Mirror 0x{:X} -> 0x{:X} failed: {}", frame.id, tx.id, e);
            return None;
        }

        {
            let mut table = self.table();
            if let Some(rule) = table.rules.get_mut(&frame.id) {
                rule.last_sent_mono_ms = Some(now_ms);
            }
            table.tx_count += 1;
        }

        if let Some(observer) = self
            .on_tx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
        {
            observer(&tx);
        }

        log::trace!("Mirrored {} as {}", frame, tx);
        Some(tx)
    }
}
