//! Hardware driver boundary
//!
//! The acquisition state machine talks to the bus exclusively through the
//! [`CanDriver`] trait. Implementations wrap a vendor library or an OS
//! socket; [`sim::SimulatedDriver`] is a scripted stand-in for tests.

use crate::types::{Frame, HardwareTimestamp};

pub mod sim;

pub use sim::{SimulatedDriver, SimulatorHandle};

/// Status codes a driver call can fail with
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DriverError {
    /// The receive queue holds no frame right now
    #[error("receive queue empty")]
    QueueEmpty,

    /// The channel has not been initialized
    #[error("channel not initialized")]
    NotInitialized,

    /// Any other hardware or bus fault
    #[error("hardware fault: {0}")]
    Fault(String),
}

/// Minimal interface of a CAN hardware driver.
///
/// Every call is addressed to a channel name so that one driver instance can
/// serve several channels. `read` must not block: an empty receive queue is
/// reported as [`DriverError::QueueEmpty`].
pub trait CanDriver: Send {
    /// Open the channel at the given bitrate (bit/s)
    fn initialize(&mut self, channel: &str, bitrate: u32) -> Result<(), DriverError>;

    /// Fetch the next received frame together with its hardware timestamp
    fn read(&mut self, channel: &str) -> Result<(Frame, HardwareTimestamp), DriverError>;

    /// Queue a frame for transmission
    fn write(&mut self, channel: &str, frame: &Frame) -> Result<(), DriverError>;

    /// Report whether the channel is healthy
    fn get_status(&mut self, channel: &str) -> Result<(), DriverError>;

    /// Release the channel. Never fails; errors are swallowed by the driver.
    fn uninitialize(&mut self, channel: &str);
}

impl<D: CanDriver + ?Sized> CanDriver for Box<D> {
    fn initialize(&mut self, channel: &str, bitrate: u32) -> Result<(), DriverError> {
        (**self).initialize(channel, bitrate)
    }

    fn read(&mut self, channel: &str) -> Result<(Frame, HardwareTimestamp), DriverError> {
        (**self).read(channel)
    }

    fn write(&mut self, channel: &str, frame: &Frame) -> Result<(), DriverError> {
        (**self).write(channel, frame)
    }

    fn get_status(&mut self, channel: &str) -> Result<(), DriverError> {
        (**self).get_status(channel)
    }

    fn uninitialize(&mut self, channel: &str) {
        (**self).uninitialize(channel)
    }
}

/// Write access to the bus handed to event handlers.
///
/// Handlers run on the acquisition thread, so writes issued through this
/// trait are serialized with the machine's own read and status calls.
pub trait BusWriter {
    fn write_frame(&mut self, frame: &Frame) -> Result<(), DriverError>;
}

/// [`BusWriter`] bound to one channel of a driver
pub struct ChannelWriter<'a, D: CanDriver + ?Sized> {
    driver: &'a mut D,
    channel: &'a str,
}

impl<'a, D: CanDriver + ?Sized> ChannelWriter<'a, D> {
    pub fn new(driver: &'a mut D, channel: &'a str) -> Self {
        Self { driver, channel }
    }
}

impl<D: CanDriver + ?Sized> BusWriter for ChannelWriter<'_, D> {
    fn write_frame(&mut self, frame: &Frame) -> Result<(), DriverError> {
        self.driver.write(self.channel, frame)
    }
}
