//! SocketCAN hardware backend (Linux)
//!
//! The interface bitrate is a property of the network device (`ip link set
//! can0 type can bitrate 250000`), so `initialize` only checks that the
//! requested rate is plausible. Timestamps count from the moment the
//! channel was opened.

use can_mirror_core::{CanDriver, DriverError, Frame, HardwareTimestamp};
use embedded_can::{ExtendedId, Frame as _, Id, StandardId};
use socketcan::{CanFrame, CanSocket, Frame as _, Socket};
use std::io;
use std::time::Instant;

pub struct SocketCanDriver {
    socket: Option<CanSocket>,
    origin: Instant,
}

impl SocketCanDriver {
    pub fn new() -> Self {
        Self {
            socket: None,
            origin: Instant::now(),
        }
    }

    fn socket(&self) -> Result<&CanSocket, DriverError> {
        self.socket.as_ref().ok_or(DriverError::NotInitialized)
    }
}

fn fault(context: &str, e: io::Error) -> DriverError {
    DriverError::Fault(format!("{}: {}", context, e))
}

/// Convert a received socket frame
pub fn from_socket_frame(frame: &CanFrame) -> Result<Frame, DriverError> {
    if matches!(frame, CanFrame::Error(_)) {
        return Err(DriverError::Fault(format!("bus error frame {:02X?}", frame.data())));
    }

    let id = frame.raw_id();
    let extended = frame.is_extended();
    if frame.is_remote_frame() {
        return Ok(Frame::from_padded(id, extended, frame.dlc(), [0; 8]).with_remote(true));
    }

    Frame::new(id, extended, frame.data()).map_err(|e| DriverError::Fault(e.to_string()))
}

/// Convert a frame for transmission
pub fn to_socket_frame(frame: &Frame) -> Result<CanFrame, DriverError> {
    let id = if frame.extended {
        ExtendedId::new(frame.id).map(Id::Extended)
    } else {
        u16::try_from(frame.id)
            .ok()
            .and_then(StandardId::new)
            .map(Id::Standard)
    }
    .ok_or_else(|| DriverError::Fault(format!("invalid identifier 0x{:X}", frame.id)))?;

    let socket_frame = if frame.remote {
        CanFrame::new_remote(id, frame.len())
    } else {
        CanFrame::new(id, frame.payload())
    };
    socket_frame.ok_or_else(|| DriverError::Fault(format!("cannot build frame {}", frame)))
}

impl CanDriver for SocketCanDriver {
    fn initialize(&mut self, channel: &str, bitrate: u32) -> Result<(), DriverError> {
        if bitrate == 0 || bitrate > 1_000_000 {
            return Err(DriverError::Fault(format!("unsupported bitrate {}", bitrate)));
        }

        let socket = CanSocket::open(channel).map_err(|e| fault(channel, e))?;
        socket
            .set_nonblocking(true)
            .map_err(|e| fault("set_nonblocking", e))?;

        log::debug!("Opened SocketCAN interface {}", channel);
        self.socket = Some(socket);
        self.origin = Instant::now();
        Ok(())
    }

    fn read(&mut self, _channel: &str) -> Result<(Frame, HardwareTimestamp), DriverError> {
        let socket = self.socket()?;
        match socket.read_frame() {
            Ok(raw) => {
                let timestamp = HardwareTimestamp::from_micros(self.origin.elapsed().as_micros() as u64);
                Ok((from_socket_frame(&raw)?, timestamp))
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Err(DriverError::QueueEmpty),
            Err(e) => Err(fault("read", e)),
        }
    }

    fn write(&mut self, _channel: &str, frame: &Frame) -> Result<(), DriverError> {
        let socket = self.socket()?;
        let raw = to_socket_frame(frame)?;
        socket.write_frame(&raw).map_err(|e| fault("write", e))
    }

    fn get_status(&mut self, _channel: &str) -> Result<(), DriverError> {
        let socket = self.socket()?;
        match socket.as_raw_socket().take_error() {
            Ok(None) => Ok(()),
            Ok(Some(e)) => Err(fault("socket error", e)),
            Err(e) => Err(fault("status", e)),
        }
    }

    fn uninitialize(&mut self, channel: &str) {
        if self.socket.take().is_some() {
            log::debug!("Closed SocketCAN interface {}", channel);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_conversion() {
        let frame = Frame::new(0x123, false, &[1, 2, 3]).unwrap();
        let raw = to_socket_frame(&frame).unwrap();
        assert_eq!(raw.raw_id(), 0x123);
        assert!(!raw.is_extended());
        assert_eq!(from_socket_frame(&raw).unwrap(), frame);

        let ext = Frame::new(0x18FF_0001, true, &[]).unwrap();
        let raw = to_socket_frame(&ext).unwrap();
        assert!(raw.is_extended());
        assert_eq!(from_socket_frame(&raw).unwrap(), ext);
    }

    #[test]
    fn test_remote_frame_conversion() {
        let frame = Frame::from_padded(0x42, false, 4, [0; 8]).with_remote(true);
        let raw = to_socket_frame(&frame).unwrap();
        assert!(raw.is_remote_frame());
        assert_eq!(raw.dlc(), 4);
        let back = from_socket_frame(&raw).unwrap();
        assert!(back.remote);
        assert_eq!(back.len(), 4);
    }

    #[test]
    fn test_uninitialized_driver() {
        let mut driver = SocketCanDriver::new();
        assert_eq!(driver.read("can0").unwrap_err(), DriverError::NotInitialized);
        assert_eq!(driver.get_status("can0").unwrap_err(), DriverError::NotInitialized);
        driver.uninitialize("can0");
    }
}
