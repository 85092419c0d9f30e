//! CAN Mirror Core Library
//!
//! Live CAN bus mirroring and recording: frames are read from a hardware
//! driver, re-broadcast through user-defined mirror rules, and recorded as
//! a frame-level trace plus decoded-signal CSV snapshots.
//!
//! # Architecture
//!
//! - [`AcquisitionMachine`] owns the driver, reconnects after faults and
//!   emits connectivity and frame events on a dedicated thread.
//! - [`Recorder`] fans every received frame out, in order, to the
//!   [`TraceWriter`], the [`SignalLogger`]s and the [`MirrorEngine`].
//! - [`TimestampSync`] maps hardware timestamps and host time onto one
//!   monotonic time base per connection.
//!
//! The library does NOT:
//! - Parse DBC files itself (the `can-dbc` crate does)
//! - Render any user interface
//! - Talk to specific hardware (drivers implement [`CanDriver`])
//!
//! # Example Usage
//!
//! ```no_run
//! use can_mirror_core::{
//!     AcquisitionConfig, AcquisitionHandle, AcquisitionMachine, ByteRule, MirrorEngine,
//!     MirrorRule, Recorder, SimulatedDriver, SystemClock, TraceConfig, TraceWriter,
//! };
//! use std::sync::Arc;
//!
//! let clock = SystemClock::shared();
//! let mirror = Arc::new(MirrorEngine::new(clock.clone()));
//! mirror.add_rule(MirrorRule::new(0x100, 0x200).with_byte_rule(ByteRule::offset(0, 10)));
//!
//! let recorder = Recorder::new(clock)
//!     .with_trace(TraceWriter::create("session.trc", TraceConfig::default()).unwrap())
//!     .with_mirror(mirror);
//!
//! let (driver, _sim) = SimulatedDriver::new();
//! let machine = AcquisitionMachine::new(driver, AcquisitionConfig::new("can0"));
//! let mut handle = AcquisitionHandle::spawn(machine, recorder).unwrap();
//!
//! // ... later
//! if let Some((_machine, mut recorder)) = handle.stop() {
//!     recorder.finish().unwrap();
//! }
//! ```

pub mod acquisition;
pub mod config;
pub mod driver;
pub mod mirror;
pub mod recorder;
pub mod signal_logger;
pub mod signals;
pub mod timestamp;
pub mod trace;
pub mod transmit;
pub mod types;

mod message_decoder;

pub use acquisition::{
    AcquisitionEvent, AcquisitionHandle, AcquisitionHandler, AcquisitionMachine, ConnectionState,
};
pub use config::{AcquisitionConfig, SignalLoggerConfig, TraceConfig};
pub use driver::{BusWriter, CanDriver, ChannelWriter, DriverError, SimulatedDriver, SimulatorHandle};
pub use mirror::{ByteRule, ByteRuleMode, MirrorEngine, MirrorRule, TxObserver};
pub use recorder::{FrameObserver, RecordedFrame, Recorder, RecorderStats};
pub use signal_logger::{
    default_variants, dbc_loader, Activation, DatabaseLoader, SignalLogger, Variant,
    DEFAULT_SELECTOR_ID,
};
pub use signals::{SignalColumn, SignalDatabase, SignalSource};
pub use timestamp::{ManualClock, MonotonicClock, SharedClock, SystemClock, TimestampSync};
pub use trace::TraceWriter;
pub use transmit::{TransmitEntry, TransmitHistory, TransmitSchedule};
pub use types::{
    CoreError, DecodedSignal, Direction, Frame, HardwareTimestamp, Result, SignalValue,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
