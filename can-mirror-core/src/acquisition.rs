//! Acquisition state machine
//!
//! Owns the hardware driver and cycles through
//! `Disconnected -> Connecting -> Connected -> Disconnected` until asked to
//! stop. Initialization failures are retried silently after a backoff, so a
//! missing adapter never produces connectivity events. A disconnect event is
//! only reported after a connect event has been reported in the same run.
//!
//! Event handlers run synchronously on the acquisition thread and receive a
//! [`BusWriter`] bound to the same driver, which keeps mirrored and cyclic
//! transmissions serialized with the machine's own reads.

use crate::config::AcquisitionConfig;
use crate::driver::{BusWriter, CanDriver, ChannelWriter, DriverError};
use crate::types::Frame;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Longest uninterrupted sleep while waiting for a stop request
const STOP_POLL_SLICE: Duration = Duration::from_millis(10);

/// Connection state of the machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the machine
#[derive(Debug, Clone, PartialEq)]
pub enum AcquisitionEvent {
    /// The channel was initialized successfully
    Connected,
    /// A previously reported connection was lost or closed
    Disconnected,
    /// A frame was received; timestamp is the driver's, in microseconds
    Frame { frame: Frame, timestamp_us: u64 },
    /// A non-fatal hardware problem worth surfacing
    Diagnostic(String),
}

/// Consumer of acquisition events
pub trait AcquisitionHandler: Send {
    fn on_event(&mut self, event: AcquisitionEvent, bus: &mut dyn BusWriter);

    /// Called once per connected cycle before the read attempt
    fn poll(&mut self, _bus: &mut dyn BusWriter) {}
}

impl<F> AcquisitionHandler for F
where
    F: FnMut(AcquisitionEvent, &mut dyn BusWriter) + Send,
{
    fn on_event(&mut self, event: AcquisitionEvent, bus: &mut dyn BusWriter) {
        self(event, bus)
    }
}

/// The acquisition state machine
pub struct AcquisitionMachine<D: CanDriver> {
    driver: D,
    config: AcquisitionConfig,
    state: ConnectionState,
    ever_connected: bool,
}

impl<D: CanDriver> AcquisitionMachine<D> {
    pub fn new(driver: D, config: AcquisitionConfig) -> Self {
        Self {
            driver,
            config,
            state: ConnectionState::Disconnected,
            ever_connected: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn config(&self) -> &AcquisitionConfig {
        &self.config
    }

    /// Give the driver back, e.g. after the thread has been stopped
    pub fn into_driver(self) -> D {
        self.driver
    }

    fn emit(&mut self, handler: &mut dyn AcquisitionHandler, event: AcquisitionEvent) {
        let mut bus = ChannelWriter::new(&mut self.driver, self.config.channel.as_str());
        handler.on_event(event, &mut bus);
    }

    /// Run one cycle of the machine.
    ///
    /// Returns how long the caller should yield before the next cycle, or
    /// `None` when the next cycle may start immediately.
    pub fn step(&mut self, handler: &mut dyn AcquisitionHandler) -> Option<Duration> {
        match self.state {
            ConnectionState::Disconnected | ConnectionState::Connecting => self.try_connect(handler),
            ConnectionState::Connected => self.poll_connected(handler),
        }
    }

    fn try_connect(&mut self, handler: &mut dyn AcquisitionHandler) -> Option<Duration> {
        self.state = ConnectionState::Connecting;

        match self
            .driver
            .initialize(&self.config.channel, self.config.bitrate)
        {
            Ok(()) => {
                log::info!(
                    "Connected to {} at {} bit/s",
                    self.config.channel,
                    self.config.bitrate
                );
                self.state = ConnectionState::Connected;
                self.ever_connected = true;
                self.emit(handler, AcquisitionEvent::Connected);
                None
            }
            Err(e) => {
                // Hardware absence is expected while waiting for the adapter
                log::debug!("Initialize {} failed: {}", self.config.channel, e);
                Some(self.config.reconnect_backoff())
            }
        }
    }

    fn poll_connected(&mut self, handler: &mut dyn AcquisitionHandler) -> Option<Duration> {
        if let Err(e) = self.driver.get_status(&self.config.channel) {
            log::warn!("Lost {}: {}", self.config.channel, e);
            self.driver.uninitialize(&self.config.channel);
            self.state = ConnectionState::Disconnected;
            if self.ever_connected {
                self.emit(handler, AcquisitionEvent::Disconnected);
            }
            return Some(self.config.reconnect_backoff());
        }

        {
            let mut bus = ChannelWriter::new(&mut self.driver, self.config.channel.as_str());
            handler.poll(&mut bus);
        }

        match self.driver.read(&self.config.channel) {
            Ok((frame, timestamp)) => {
                self.emit(
                    handler,
                    AcquisitionEvent::Frame {
                        frame,
                        timestamp_us: timestamp.as_micros(),
                    },
                );
                None
            }
            Err(DriverError::QueueEmpty) => Some(self.config.idle_yield()),
            Err(e) => {
                // The status check of the next cycle decides about reconnecting
                log::debug!("Read on {} failed: {}", self.config.channel, e);
                self.emit(handler, AcquisitionEvent::Diagnostic(format!("read failed: {}", e)));
                Some(self.config.error_yield())
            }
        }
    }

    /// Release the hardware. Safe to call more than once.
    pub fn shutdown(&mut self, handler: &mut dyn AcquisitionHandler) {
        if self.state == ConnectionState::Connected {
            self.driver.uninitialize(&self.config.channel);
            self.state = ConnectionState::Disconnected;
            if self.ever_connected {
                self.emit(handler, AcquisitionEvent::Disconnected);
            }
            log::info!("Released {}", self.config.channel);
        }
        self.state = ConnectionState::Disconnected;
    }

    /// Drive the machine until `stop` is raised, then shut down
    pub fn run(&mut self, stop: &AtomicBool, handler: &mut dyn AcquisitionHandler) {
        while !stop.load(Ordering::SeqCst) {
            if let Some(pause) = self.step(handler) {
                sleep_unless_stopped(pause, stop);
            }
        }
        self.shutdown(handler);
    }
}

fn sleep_unless_stopped(duration: Duration, stop: &AtomicBool) {
    let deadline = Instant::now() + duration;
    loop {
        if stop.load(Ordering::SeqCst) {
            return;
        }
        let now = Instant::now();
        if now >= deadline {
            return;
        }
        thread::sleep((deadline - now).min(STOP_POLL_SLICE));
    }
}

/// A machine running on its own thread
pub struct AcquisitionHandle<D, H>
where
    D: CanDriver + 'static,
    H: AcquisitionHandler + 'static,
{
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<(AcquisitionMachine<D>, H)>>,
}

impl<D, H> AcquisitionHandle<D, H>
where
    D: CanDriver + 'static,
    H: AcquisitionHandler + 'static,
{
    /// Start the machine on a dedicated thread
    pub fn spawn(mut machine: AcquisitionMachine<D>, mut handler: H) -> std::io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);

        let thread = thread::Builder::new()
            .name("can-acquisition".to_string())
            .spawn(move || {
                machine.run(&thread_stop, &mut handler);
                (machine, handler)
            })?;

        Ok(Self {
            stop,
            thread: Some(thread),
        })
    }

    pub fn is_running(&self) -> bool {
        self.thread
            .as_ref()
            .map(|t| !t.is_finished())
            .unwrap_or(false)
    }

    /// Stop the thread and hand back the machine and handler.
    ///
    /// Returns `None` if the machine was already stopped or its thread
    /// panicked.
    pub fn stop(&mut self) -> Option<(AcquisitionMachine<D>, H)> {
        self.stop.store(true, Ordering::SeqCst);
        let thread = self.thread.take()?;
        match thread.join() {
            Ok(parts) => Some(parts),
            Err(_) => {
                log::error!("Acquisition thread panicked");
                None
            }
        }
    }
}

impl<D, H> Drop for AcquisitionHandle<D, H>
where
    D: CanDriver + 'static,
    H: AcquisitionHandler + 'static,
{
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::SimulatedDriver;

    fn collecting() -> (
        Arc<std::sync::Mutex<Vec<AcquisitionEvent>>>,
        impl FnMut(AcquisitionEvent, &mut dyn BusWriter) + Send,
    ) {
        let events = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        (events, move |event, _bus: &mut dyn BusWriter| {
            sink.lock().unwrap().push(event)
        })
    }

    #[test]
    fn test_failed_init_is_silent() {
        let (driver, sim) = SimulatedDriver::new();
        sim.push_init_result(Err(DriverError::Fault("no adapter".into())));
        sim.push_init_result(Err(DriverError::Fault("no adapter".into())));

        let mut machine = AcquisitionMachine::new(driver, AcquisitionConfig::new("sim0"));
        let (events, mut handler) = collecting();

        assert_eq!(machine.step(&mut handler), Some(Duration::from_millis(800)));
        assert_eq!(machine.state(), ConnectionState::Connecting);
        assert_eq!(machine.step(&mut handler), Some(Duration::from_millis(800)));
        assert!(events.lock().unwrap().is_empty());

        assert_eq!(machine.step(&mut handler), None);
        assert!(machine.is_connected());
        assert_eq!(*events.lock().unwrap(), vec![AcquisitionEvent::Connected]);
    }

    #[test]
    fn test_frames_and_empty_queue() {
        let (driver, sim) = SimulatedDriver::new();
        let frame = Frame::new(0x123, false, &[1, 2, 3]).unwrap();
        sim.push_frame(frame, 1_000);

        let mut machine = AcquisitionMachine::new(driver, AcquisitionConfig::new("sim0"));
        let (events, mut handler) = collecting();

        machine.step(&mut handler); // connect
        assert_eq!(machine.step(&mut handler), None);
        assert_eq!(machine.step(&mut handler), Some(Duration::from_millis(1)));

        let events = events.lock().unwrap();
        assert_eq!(
            events[1],
            AcquisitionEvent::Frame {
                frame,
                timestamp_us: 1_000
            }
        );
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn test_read_error_emits_diagnostic() {
        let (driver, sim) = SimulatedDriver::new();
        sim.push_read_error(DriverError::Fault("bus heavy".into()));

        let mut machine = AcquisitionMachine::new(driver, AcquisitionConfig::new("sim0"));
        let (events, mut handler) = collecting();

        machine.step(&mut handler);
        assert_eq!(machine.step(&mut handler), Some(Duration::from_millis(2)));
        assert!(machine.is_connected());
        assert!(matches!(
            events.lock().unwrap()[1],
            AcquisitionEvent::Diagnostic(_)
        ));
    }

    #[test]
    fn test_status_fault_reconnects() {
        let (driver, sim) = SimulatedDriver::new();
        let mut machine = AcquisitionMachine::new(driver, AcquisitionConfig::new("sim0"));
        let (events, mut handler) = collecting();

        machine.step(&mut handler);
        sim.push_status(Err(DriverError::Fault("bus off".into())));
        assert_eq!(machine.step(&mut handler), Some(Duration::from_millis(800)));
        assert_eq!(machine.state(), ConnectionState::Disconnected);
        assert_eq!(sim.uninit_calls(), 1);

        machine.step(&mut handler);
        assert!(machine.is_connected());
        assert_eq!(
            *events.lock().unwrap(),
            vec![
                AcquisitionEvent::Connected,
                AcquisitionEvent::Disconnected,
                AcquisitionEvent::Connected
            ]
        );
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let (driver, sim) = SimulatedDriver::new();
        let mut machine = AcquisitionMachine::new(driver, AcquisitionConfig::new("sim0"));
        let (events, mut handler) = collecting();

        machine.shutdown(&mut handler);
        assert!(events.lock().unwrap().is_empty());

        machine.step(&mut handler);
        machine.shutdown(&mut handler);
        machine.shutdown(&mut handler);
        assert_eq!(sim.uninit_calls(), 1);
        assert_eq!(
            *events.lock().unwrap(),
            vec![AcquisitionEvent::Connected, AcquisitionEvent::Disconnected]
        );
    }

    #[test]
    fn test_thread_handle_stops_during_backoff() {
        let (driver, sim) = SimulatedDriver::new();
        for _ in 0..100 {
            sim.push_init_result(Err(DriverError::Fault("absent".into())));
        }
        let machine = AcquisitionMachine::new(driver, AcquisitionConfig::new("sim0"));
        let (events, handler) = collecting();

        let mut handle = AcquisitionHandle::spawn(machine, handler).unwrap();
        thread::sleep(Duration::from_millis(30));

        let started = Instant::now();
        let stopped = handle.stop();
        assert!(stopped.is_some());
        assert!(started.elapsed() < Duration::from_millis(500));
        assert!(handle.stop().is_none());
        assert!(events.lock().unwrap().is_empty());
    }
}
