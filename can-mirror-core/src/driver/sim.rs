//! Scripted driver for tests and dry runs
//!
//! Results are queued through a [`SimulatorHandle`]; once a queue runs dry
//! the driver falls back to its healthy default (successful init/status and
//! write, empty receive queue).

use super::{CanDriver, DriverError};
use crate::types::{Frame, HardwareTimestamp};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Default)]
struct SimState {
    init_results: VecDeque<Result<(), DriverError>>,
    status_results: VecDeque<Result<(), DriverError>>,
    read_results: VecDeque<Result<(Frame, HardwareTimestamp), DriverError>>,
    write_results: VecDeque<Result<(), DriverError>>,
    written: Vec<Frame>,
    initialized: bool,
    init_calls: usize,
    uninit_calls: usize,
}

/// Driver whose behaviour is scripted through a [`SimulatorHandle`]
#[derive(Debug, Clone)]
pub struct SimulatedDriver {
    state: Arc<Mutex<SimState>>,
}

/// Test-side view of a [`SimulatedDriver`]
#[derive(Debug, Clone)]
pub struct SimulatorHandle {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedDriver {
    /// Create a driver and the handle that scripts it
    pub fn new() -> (Self, SimulatorHandle) {
        let state = Arc::new(Mutex::new(SimState::default()));
        (
            Self {
                state: Arc::clone(&state),
            },
            SimulatorHandle { state },
        )
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        lock(&self.state)
    }
}

fn lock(state: &Mutex<SimState>) -> MutexGuard<'_, SimState> {
    // A panicking test thread must not hide the state from the others
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl CanDriver for SimulatedDriver {
    fn initialize(&mut self, channel: &str, bitrate: u32) -> Result<(), DriverError> {
        let mut state = self.state();
        state.init_calls += 1;
        let result = state.init_results.pop_front().unwrap_or(Ok(()));
        log::trace!("sim: initialize {} @ {} -> {:?}", channel, bitrate, result);
        if result.is_ok() {
            state.initialized = true;
        }
        result
    }

    fn read(&mut self, _channel: &str) -> Result<(Frame, HardwareTimestamp), DriverError> {
        let mut state = self.state();
        if !state.initialized {
            return Err(DriverError::NotInitialized);
        }
        state
            .read_results
            .pop_front()
            .unwrap_or(Err(DriverError::QueueEmpty))
    }

    fn write(&mut self, _channel: &str, frame: &Frame) -> Result<(), DriverError> {
        let mut state = self.state();
        if !state.initialized {
            return Err(DriverError::NotInitialized);
        }
        let result = state.write_results.pop_front().unwrap_or(Ok(()));
        if result.is_ok() {
            state.written.push(*frame);
        }
        result
    }

    fn get_status(&mut self, _channel: &str) -> Result<(), DriverError> {
        let mut state = self.state();
        if !state.initialized {
            return Err(DriverError::NotInitialized);
        }
        state.status_results.pop_front().unwrap_or(Ok(()))
    }

    fn uninitialize(&mut self, _channel: &str) {
        let mut state = self.state();
        state.uninit_calls += 1;
        state.initialized = false;
    }
}

impl SimulatorHandle {
    /// Queue the result of the next `initialize` call
    pub fn push_init_result(&self, result: Result<(), DriverError>) {
        lock(&self.state).init_results.push_back(result);
    }

    /// Queue the result of the next `get_status` call
    pub fn push_status(&self, result: Result<(), DriverError>) {
        lock(&self.state).status_results.push_back(result);
    }

    /// Queue a received frame
    pub fn push_frame(&self, frame: Frame, timestamp_us: u64) {
        lock(&self.state)
            .read_results
            .push_back(Ok((frame, HardwareTimestamp::from_micros(timestamp_us))));
    }

    /// Queue a failing read
    pub fn push_read_error(&self, error: DriverError) {
        lock(&self.state).read_results.push_back(Err(error));
    }

    /// Queue the result of the next `write` call
    pub fn push_write_result(&self, result: Result<(), DriverError>) {
        lock(&self.state).write_results.push_back(result);
    }

    /// Frames successfully written so far
    pub fn written(&self) -> Vec<Frame> {
        lock(&self.state).written.clone()
    }

    /// Number of frames still waiting to be read
    pub fn pending_reads(&self) -> usize {
        lock(&self.state).read_results.len()
    }

    pub fn is_initialized(&self) -> bool {
        lock(&self.state).initialized
    }

    pub fn init_calls(&self) -> usize {
        lock(&self.state).init_calls
    }

    pub fn uninit_calls(&self) -> usize {
        lock(&self.state).uninit_calls
    }
}
