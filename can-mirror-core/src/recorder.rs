//! Frame fan-out
//!
//! [`Recorder`] is the acquisition handler wiring every sink together. For
//! each received frame, in order:
//!
//! 1. map the driver timestamp through the connection's [`TimestampSync`]
//! 2. append an `Rx` trace entry
//! 3. feed every signal logger
//! 4. run the mirror engine, tracing a mirrored frame as `Tx`
//! 5. notify the frame observer
//!
//! Connectivity changes become trace comments. A failing trace is dropped
//! and a failed signal logger is reported once, while the other sinks keep
//! running.

use crate::acquisition::{AcquisitionEvent, AcquisitionHandler};
use crate::driver::BusWriter;
use crate::mirror::MirrorEngine;
use crate::signal_logger::SignalLogger;
use crate::timestamp::{SharedClock, TimestampSync};
use crate::trace::TraceWriter;
use crate::transmit::TransmitSchedule;
use crate::types::{Direction, Frame, Result};
use chrono::Local;
use std::sync::Arc;

/// A frame as seen by the observer
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RecordedFrame {
    pub frame: Frame,
    pub direction: Direction,
    /// Session timestamp in microseconds
    pub timestamp_us: u64,
}

/// Callback for every recorded frame
pub type FrameObserver = Box<dyn FnMut(&RecordedFrame) + Send>;

/// Counters kept by the recorder
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecorderStats {
    pub rx_frames: u64,
    pub mirrored_frames: u64,
    pub cyclic_frames: u64,
    pub connects: u64,
    pub disconnects: u64,
    pub diagnostics: u64,
    pub trace_entries: u64,
    pub trace_faults: u64,
    /// Signal loggers stopped by a write failure
    pub logger_faults: u64,
}

/// Fan-out handler for the acquisition machine
pub struct Recorder {
    clock: SharedClock,
    session: Option<TimestampSync>,
    trace: Option<TraceWriter>,
    loggers: Vec<SignalLogger>,
    /// Loggers whose fault was already reported
    logger_fault_seen: Vec<bool>,
    mirror: Option<Arc<MirrorEngine>>,
    transmit: TransmitSchedule,
    observer: Option<FrameObserver>,
    last_diagnostic: Option<String>,
    stats: RecorderStats,
}

impl Recorder {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            clock,
            session: None,
            trace: None,
            loggers: Vec::new(),
            logger_fault_seen: Vec::new(),
            mirror: None,
            transmit: TransmitSchedule::default(),
            observer: None,
            last_diagnostic: None,
            stats: RecorderStats::default(),
        }
    }

    /// Builder method: record a trace
    pub fn with_trace(mut self, trace: TraceWriter) -> Self {
        self.trace = Some(trace);
        self
    }

    /// Builder method: add a started signal logger
    pub fn with_logger(mut self, logger: SignalLogger) -> Self {
        self.loggers.push(logger);
        self.logger_fault_seen.push(false);
        self
    }

    /// Builder method: mirror received frames
    pub fn with_mirror(mut self, mirror: Arc<MirrorEngine>) -> Self {
        self.mirror = Some(mirror);
        self
    }

    /// Builder method: send cyclic transmissions while connected
    pub fn with_transmit(mut self, schedule: TransmitSchedule) -> Self {
        self.transmit = schedule;
        self
    }

    /// Builder method: observe every recorded frame
    pub fn with_observer(mut self, observer: FrameObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn stats(&self) -> &RecorderStats {
        &self.stats
    }

    pub fn trace(&self) -> Option<&TraceWriter> {
        self.trace.as_ref()
    }

    pub fn loggers(&self) -> &[SignalLogger] {
        &self.loggers
    }

    pub fn transmit(&self) -> &TransmitSchedule {
        &self.transmit
    }

    pub fn last_diagnostic(&self) -> Option<&str> {
        self.last_diagnostic.as_deref()
    }

    pub fn is_session_open(&self) -> bool {
        self.session.is_some()
    }

    fn session(&mut self) -> &mut TimestampSync {
        let clock = &self.clock;
        self.session
            .get_or_insert_with(|| TimestampSync::new(Arc::clone(clock)))
    }

    fn diagnostic(&mut self, message: String) {
        log::warn!("{}", message);
        self.stats.diagnostics += 1;
        self.last_diagnostic = Some(message);
    }

    fn trace_entry(&mut self, frame: &Frame, timestamp_us: u64, direction: Direction) {
        let Some(trace) = self.trace.as_mut() else {
            return;
        };
        match trace.write_entry(frame, timestamp_us, direction) {
            Ok(_) => self.stats.trace_entries += 1,
            Err(e) => {
                self.stats.trace_faults += 1;
                self.trace = None;
                self.diagnostic(format!("Trace stopped: {}", e));
            }
        }
    }

    fn trace_comment(&mut self, text: &str) {
        let Some(trace) = self.trace.as_mut() else {
            return;
        };
        if let Err(e) = trace.write_comment(text) {
            self.stats.trace_faults += 1;
            self.trace = None;
            self.diagnostic(format!("Trace stopped: {}", e));
        }
    }

    fn check_loggers(&mut self) {
        for idx in 0..self.loggers.len() {
            if self.logger_fault_seen[idx] || !self.loggers[idx].is_faulted() {
                continue;
            }
            self.logger_fault_seen[idx] = true;
            self.stats.logger_faults += 1;
            self.diagnostic(format!("Signal logger #{} stopped after a write failure", idx + 1));
        }
    }

    fn notify(&mut self, frame: Frame, direction: Direction, timestamp_us: u64) {
        if let Some(observer) = self.observer.as_mut() {
            observer(&RecordedFrame {
                frame,
                direction,
                timestamp_us,
            });
        }
    }

    fn on_frame(&mut self, frame: Frame, driver_ts_us: u64, bus: &mut dyn BusWriter) {
        self.stats.rx_frames += 1;
        let timestamp_us = self.session().to_log_timestamp(Some(driver_ts_us));

        self.trace_entry(&frame, timestamp_us, Direction::Rx);

        for logger in &self.loggers {
            logger.handle_frame(&frame, timestamp_us);
        }
        self.check_loggers();

        if let Some(mirror) = self.mirror.clone() {
            if let Some(mirrored) = mirror.handle_rx(&frame, bus) {
                self.stats.mirrored_frames += 1;
                let tx_ts = self.session().to_log_timestamp(None);
                self.trace_entry(&mirrored, tx_ts, Direction::Tx);
                self.notify(mirrored, Direction::Tx, tx_ts);
            }
        }

        self.notify(frame, Direction::Rx, timestamp_us);
    }

    /// Stop every logger and close the trace. Returns the first error.
    pub fn finish(&mut self) -> Result<RecorderStats> {
        self.check_loggers();
        let mut first_error = None;

        for logger in &mut self.loggers {
            if let Err(e) = logger.stop() {
                log::error!("Closing signal logger failed: {}", e);
                first_error.get_or_insert(e);
            }
        }

        if let Some(mut trace) = self.trace.take() {
            if let Err(e) = trace.close() {
                log::error!("Closing trace failed: {}", e);
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(self.stats.clone()),
        }
    }
}

/// Wall-clock stamp used in connectivity comments
fn comment_time() -> String {
    format!("{}.0", Local::now().format("%H:%M:%S%.3f"))
}

impl AcquisitionHandler for Recorder {
    fn on_event(&mut self, event: AcquisitionEvent, bus: &mut dyn BusWriter) {
        match event {
            AcquisitionEvent::Connected => {
                self.stats.connects += 1;
                // The hardware counter may have restarted
                self.session = Some(TimestampSync::new(Arc::clone(&self.clock)));
                self.trace_comment(&format!("PCAN HARDWARE GOT CONNECTED BACK AT {}", comment_time()));
            }
            AcquisitionEvent::Disconnected => {
                self.stats.disconnects += 1;
                self.session = None;
                self.trace_comment(&format!("PCAN HARDWARE GOT DISCONNECTED AT {}", comment_time()));
            }
            AcquisitionEvent::Frame { frame, timestamp_us } => self.on_frame(frame, timestamp_us, bus),
            AcquisitionEvent::Diagnostic(message) => self.diagnostic(message),
        }
    }

    fn poll(&mut self, bus: &mut dyn BusWriter) {
        if self.transmit.entries().is_empty() {
            return;
        }
        let now_ms = self.clock.now_ms();
        for frame in self.transmit.send_due(now_ms, bus) {
            self.stats.cyclic_frames += 1;
            let ts = self.session().to_log_timestamp(None);
            self.trace_entry(&frame, ts, Direction::Tx);
            self.notify(frame, Direction::Tx, ts);
        }
    }
}
