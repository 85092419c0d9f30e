//! Decoded-signal CSV logger
//!
//! Frames are decoded against a signal database into a last-value-wins
//! snapshot; a background thread appends the snapshot to a CSV file at a
//! fixed interval. Two activation strategies share the same logger:
//!
//! - [`Activation::Eager`]: the database is known up front, the file is
//!   opened on [`SignalLogger::start`] and a row is written on every tick.
//! - [`Activation::SelectorGated`]: nothing is written until a selector
//!   frame names a known variant. The matching database is then loaded and
//!   rows are only written when new frames arrived since the last row.
//!
//! File layout: row 1 is `Time` plus the signal names, row 2 the units
//! (`s` for `Time`), then one row per tick.

use crate::config::SignalLoggerConfig;
use crate::signals::{SignalColumn, SignalDatabase, SignalSource};
use crate::types::{CoreError, Frame, Result, SignalValue};
use chrono::Local;
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Identifier of the variant selector frame on the observed bench
pub const DEFAULT_SELECTOR_ID: u32 = 0x0726;

const POLL_SLICE: Duration = Duration::from_millis(10);

/// A selectable signal database
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Variant {
    /// Used as the CSV file name prefix
    pub name: String,
    pub database: PathBuf,
}

impl Variant {
    pub fn new(name: impl Into<String>, database: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            database: database.into(),
        }
    }
}

/// The variant map of the observed motor-controller bench, with database
/// files resolved against `dbc_dir`
pub fn default_variants(dbc_dir: &Path) -> BTreeMap<u8, Variant> {
    BTreeMap::from([
        (0x01, Variant::new("GTAKE", dbc_dir.join("GTAKE_MCU.dbc"))),
        (0x03, Variant::new("Pegasus", dbc_dir.join("Pegasus_MCU_BMS.dbc"))),
        (0x05, Variant::new("GTAKE", dbc_dir.join("GTAKE_MCU.dbc"))),
    ])
}

/// How a logger picks its signal database
pub enum Activation {
    Eager(Arc<dyn SignalSource>),
    SelectorGated {
        selector_id: u32,
        /// Keyed by the selector frame's first payload byte
        variants: BTreeMap<u8, Variant>,
    },
}

/// Loads the database of a selected variant
pub type DatabaseLoader = Arc<dyn Fn(&Path) -> Result<Arc<dyn SignalSource>> + Send + Sync>;

/// Loader reading DBC files from disk
pub fn dbc_loader() -> DatabaseLoader {
    Arc::new(|path: &Path| {
        let db = SignalDatabase::from_dbc_file(path)?;
        Ok(Arc::new(db) as Arc<dyn SignalSource>)
    })
}

/// Quote a CSV field when it contains a delimiter, quote or line break
fn csv_field(field: &str) -> String {
    if field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

fn csv_row<I, S>(fields: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut row = fields
        .into_iter()
        .map(|f| csv_field(f.as_ref()))
        .collect::<Vec<_>>()
        .join(",");
    row.push_str("\r\n");
    row
}

/// Output side of a session. Has its own lock; frame handling only takes
/// the snapshot lock.
struct CsvFile {
    writer: Box<dyn Write + Send>,
    rows_written: u64,
}

impl CsvFile {
    fn write_row(&mut self, row: &str) -> Result<()> {
        self.writer.write_all(row.as_bytes())?;
        self.writer.flush()?;
        self.rows_written += 1;
        Ok(())
    }
}

fn lock_file(file: &Mutex<CsvFile>) -> MutexGuard<'_, CsvFile> {
    file.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// An open CSV file and its snapshot
struct Session {
    path: PathBuf,
    variant: Option<String>,
    source: Arc<dyn SignalSource>,
    file: Arc<Mutex<CsvFile>>,
    /// Column index by signal name; column 0 is `Time`
    positions: HashMap<String, usize>,
    values: Vec<SignalValue>,
    base_ts_us: Option<u64>,
    update_counter: u64,
    last_written: u64,
}

impl Session {
    fn open(path: PathBuf, variant: Option<String>, source: Arc<dyn SignalSource>) -> Result<Self> {
        let columns = source.columns();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let mut writer = BufWriter::new(File::create(&path)?);

        let names = std::iter::once("Time").chain(columns.iter().map(|c| c.name.as_str()));
        let units = std::iter::once("s").chain(columns.iter().map(|c| c.unit.as_str()));
        writer.write_all(csv_row(names).as_bytes())?;
        writer.write_all(csv_row(units).as_bytes())?;
        writer.flush()?;

        // A name used by two messages is written to its last column; the
        // earlier column stays at its default value
        let positions = columns
            .iter()
            .enumerate()
            .map(|(idx, SignalColumn { name, .. })| (name.clone(), idx + 1))
            .collect::<HashMap<_, _>>();

        Ok(Self {
            path,
            variant,
            source,
            file: Arc::new(Mutex::new(CsvFile {
                writer: Box::new(writer),
                rows_written: 0,
            })),
            positions,
            values: vec![SignalValue::default(); columns.len() + 1],
            base_ts_us: None,
            update_counter: 0,
            last_written: 0,
        })
    }

    fn observe(&mut self, frame: &Frame, timestamp_us: u64) {
        let base = *self.base_ts_us.get_or_insert(timestamp_us);
        let rel_s = timestamp_us.saturating_sub(base) as f64 / 1_000_000.0;
        self.values[0] = SignalValue::Float((rel_s * 1e6).round() / 1e6);

        match self.source.decode(frame.id, frame.payload()) {
            Ok(signals) => {
                for signal in signals {
                    if let Some(&idx) = self.positions.get(&signal.name) {
                        self.values[idx] = signal.value;
                    }
                }
            }
            Err(e) => log::trace!("Frame 0x{:X} not decoded: {}", frame.id, e),
        }
        self.update_counter += 1;
    }

    /// Render the current snapshot and mark it as written
    fn take_row(&mut self) -> String {
        self.last_written = self.update_counter;
        csv_row(self.values.iter().map(|v| v.to_string()))
    }
}

struct LoggerState {
    activation: Activation,
    loader: DatabaseLoader,
    config: SignalLoggerConfig,
    session: Option<Session>,
    faulted: bool,
}

impl LoggerState {
    fn is_gated(&self) -> bool {
        matches!(self.activation, Activation::SelectorGated { .. })
    }

    fn file_path(&self, prefix: &str) -> PathBuf {
        let ts = Local::now().format("%d%b%Y_%H-%M-%S");
        self.config.output_dir.join(format!("{}_{}.csv", prefix, ts))
    }

    fn open_eager(&mut self) -> Result<()> {
        let Activation::Eager(source) = &self.activation else {
            return Ok(());
        };
        let source = Arc::clone(source);
        let path = self.file_path(&self.config.file_prefix);
        let session = Session::open(path, None, source)?;
        log::info!("Signal logging to {:?}", session.path);
        self.session = Some(session);
        Ok(())
    }

    /// Activate the selector strategy if `frame` names a known variant
    fn try_select(&mut self, frame: &Frame) {
        let Activation::SelectorGated { selector_id, variants } = &self.activation else {
            return;
        };
        if frame.id != *selector_id {
            return;
        }
        let Some(variant) = frame.payload().first().and_then(|b| variants.get(b)) else {
            return;
        };
        let variant = variant.clone();

        let source = match (self.loader)(&variant.database) {
            Ok(source) => source,
            Err(e) => {
                log::error!("Cannot load database for variant {}: {}", variant.name, e);
                return;
            }
        };

        let path = self.file_path(&format!("{}_csv", variant.name));
        match Session::open(path, Some(variant.name.clone()), source) {
            Ok(session) => {
                log::info!("Signal logging ({}) to {:?}", variant.name, session.path);
                self.session = Some(session);
            }
            Err(e) => log::error!("Cannot open CSV for variant {}: {}", variant.name, e),
        }
    }

    /// The snapshot row due on this tick and the file it goes to
    fn due_row(&mut self) -> Option<(String, Arc<Mutex<CsvFile>>)> {
        let gated = self.is_gated();
        let session = self.session.as_mut()?;
        if gated && session.update_counter <= session.last_written {
            return None;
        }
        Some((session.take_row(), Arc::clone(&session.file)))
    }

    fn fault(&mut self, error: &CoreError) {
        let path = self.session.as_ref().map(|s| s.path.clone());
        log::error!("Signal logger stopped after write failure on {:?}: {}", path, error);
        self.faulted = true;
        self.session = None;
    }
}

struct Shared {
    running: AtomicBool,
    state: Mutex<LoggerState>,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, LoggerState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Write one snapshot row if one is due. Returns whether a row was
    /// written. A write failure stops the logger.
    fn write_tick(&self) -> Result<bool> {
        let Some((row, file)) = self.state().due_row() else {
            return Ok(false);
        };
        let result = lock_file(&file).write_row(&row);
        match result {
            Ok(()) => Ok(true),
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                self.state().fault(&e);
                Err(e)
            }
        }
    }
}

/// Periodic decoded-signal logger
pub struct SignalLogger {
    shared: Arc<Shared>,
    interval: Duration,
    thread: Option<JoinHandle<()>>,
}

impl SignalLogger {
    /// Create a logger that loads selector-gated databases from DBC files
    pub fn new(config: SignalLoggerConfig, activation: Activation) -> Self {
        Self::with_loader(config, activation, dbc_loader())
    }

    /// Create a logger with a custom database loader
    pub fn with_loader(config: SignalLoggerConfig, activation: Activation, loader: DatabaseLoader) -> Self {
        let interval = config.interval();
        Self {
            shared: Arc::new(Shared {
                running: AtomicBool::new(false),
                state: Mutex::new(LoggerState {
                    activation,
                    loader,
                    config,
                    session: None,
                    faulted: false,
                }),
            }),
            interval,
            thread: None,
        }
    }

    /// Start logging. The eager strategy opens its file here; the selector
    /// strategy waits for a selector frame.
    pub fn start(&mut self) -> Result<()> {
        if self.thread.is_some() {
            return Ok(());
        }

        {
            let mut state = self.shared.state();
            state.faulted = false;
            if state.session.is_none() {
                state.open_eager()?;
            }
            if state.is_gated() {
                log::info!("Signal logger waiting for variant selector frame");
            }
        }

        self.shared.running.store(true, Ordering::SeqCst);
        let shared = Arc::clone(&self.shared);
        let interval = self.interval;
        let handle = thread::Builder::new()
            .name("signal-logger".to_string())
            .spawn(move || write_loop(shared, interval))
            .map_err(|e| {
                self.shared.running.store(false, Ordering::SeqCst);
                CoreError::Io(e)
            })?;
        self.thread = Some(handle);
        Ok(())
    }

    /// Feed a received frame with its session timestamp
    pub fn handle_frame(&self, frame: &Frame, timestamp_us: u64) {
        if !self.shared.running.load(Ordering::SeqCst) {
            return;
        }
        let mut state = self.shared.state();
        if state.faulted {
            return;
        }
        if state.session.is_none() {
            state.try_select(frame);
        }
        if let Some(session) = state.session.as_mut() {
            session.observe(frame, timestamp_us);
        }
    }

    /// Write a snapshot row now, subject to the same gating as the
    /// periodic writer
    pub fn write_snapshot(&self) -> Result<bool> {
        self.shared.write_tick()
    }

    /// Stop the writer thread, then flush and close the file. Idempotent.
    pub fn stop(&mut self) -> Result<()> {
        self.shared.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                log::error!("Signal logger thread panicked");
            }
        }

        let session = self.shared.state().session.take();
        if let Some(session) = session {
            let mut file = lock_file(&session.file);
            file.writer.flush()?;
            log::info!(
                "Signal logger stopped, {} rows saved to {:?}",
                file.rows_written,
                session.path
            );
        }
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Whether a file is open and receiving snapshots
    pub fn is_active(&self) -> bool {
        self.shared.state().session.is_some()
    }

    pub fn is_faulted(&self) -> bool {
        self.shared.state().faulted
    }

    pub fn current_path(&self) -> Option<PathBuf> {
        self.shared.state().session.as_ref().map(|s| s.path.clone())
    }

    /// Name of the selected variant, for the selector strategy
    pub fn active_variant(&self) -> Option<String> {
        self.shared.state().session.as_ref().and_then(|s| s.variant.clone())
    }

    pub fn rows_written(&self) -> u64 {
        let file = self.shared.state().session.as_ref().map(|s| Arc::clone(&s.file));
        file.map_or(0, |f| lock_file(&f).rows_written)
    }
}

impl Drop for SignalLogger {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            log::warn!("Signal logger close failed: {}", e);
        }
    }
}

/// Ticks fall on a fixed grid starting one interval after start. A gated
/// tick without new frames is skipped.
fn write_loop(shared: Arc<Shared>, interval: Duration) {
    let mut next_tick = Instant::now() + interval;

    while shared.running.load(Ordering::SeqCst) {
        let now = Instant::now();
        if now >= next_tick {
            if shared.write_tick().is_err() {
                break;
            }
            next_tick += interval;
            if next_tick < now {
                next_tick = now + interval;
            }
        }
        thread::sleep(POLL_SLICE.min(interval));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquisition::{AcquisitionEvent, AcquisitionHandler};
    use crate::config::TraceConfig;
    use crate::driver::{BusWriter, DriverError};
    use crate::recorder::Recorder;
    use crate::timestamp::ManualClock;
    use crate::trace::TraceWriter;
    use crate::types::DecodedSignal;
    use std::io;
    use std::sync::atomic::AtomicUsize;
    use tempfile::tempdir;

    /// Decodes 0x100 byte 0 as `Speed` and 0x200 byte 0 scaled by 0.5 as `Volt`
    struct FakeSource;

    impl SignalSource for FakeSource {
        fn columns(&self) -> Vec<SignalColumn> {
            vec![SignalColumn::new("Speed", "km/h"), SignalColumn::new("Volt", "V")]
        }

        fn decode(&self, can_id: u32, payload: &[u8]) -> Result<Vec<DecodedSignal>> {
            let raw = *payload
                .first()
                .ok_or_else(|| CoreError::InvalidData("empty".into()))? as i64;
            let (name, value) = match can_id {
                0x100 => ("Speed", SignalValue::Integer(raw)),
                0x200 => ("Volt", SignalValue::Float(raw as f64 * 0.5)),
                other => return Err(CoreError::MessageNotFound(other)),
            };
            Ok(vec![DecodedSignal {
                name: name.to_string(),
                value,
                unit: None,
                raw_value: raw,
            }])
        }
    }

    /// Two messages defining a signal with the same name
    struct DuplicateSource;

    impl SignalSource for DuplicateSource {
        fn columns(&self) -> Vec<SignalColumn> {
            vec![SignalColumn::new("Speed", "km/h"), SignalColumn::new("Speed", "rpm")]
        }

        fn decode(&self, _can_id: u32, payload: &[u8]) -> Result<Vec<DecodedSignal>> {
            Ok(vec![DecodedSignal {
                name: "Speed".to_string(),
                value: SignalValue::Integer(payload[0] as i64),
                unit: None,
                raw_value: payload[0] as i64,
            }])
        }
    }

    struct FailingWriter;

    impl Write for FailingWriter {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::Other, "disk full"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct NullBus;

    impl BusWriter for NullBus {
        fn write_frame(&mut self, _frame: &Frame) -> std::result::Result<(), DriverError> {
            Ok(())
        }
    }

    fn csv_file(logger: &SignalLogger) -> Arc<Mutex<CsvFile>> {
        Arc::clone(&logger.shared.state().session.as_ref().unwrap().file)
    }

    fn frame(id: u32, data: &[u8]) -> Frame {
        Frame::new(id, false, data).unwrap()
    }

    fn quiet_config(dir: &Path) -> SignalLoggerConfig {
        // Long interval so tests drive rows through write_snapshot
        SignalLoggerConfig::new(dir).with_interval(Duration::from_secs(3600))
    }

    fn read_lines(path: &Path) -> Vec<String> {
        fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect()
    }

    fn counting_loader(calls: Arc<AtomicUsize>) -> DatabaseLoader {
        Arc::new(move |path: &Path| {
            calls.fetch_add(1, Ordering::SeqCst);
            if path.ends_with("missing.dbc") {
                return Err(CoreError::DbcParse("missing".into()));
            }
            Ok(Arc::new(FakeSource) as Arc<dyn SignalSource>)
        })
    }

    #[test]
    fn test_csv_field_quoting() {
        assert_eq!(csv_field("plain"), "plain");
        assert_eq!(csv_field("a,b"), "\"a,b\"");
        assert_eq!(csv_field("say \"hi\""), "\"say \"\"hi\"\"\"");
    }

    #[test]
    fn test_eager_header_and_last_value_wins() {
        let dir = tempdir().unwrap();
        let mut logger = SignalLogger::new(
            quiet_config(dir.path()).with_prefix("Marvel_csv"),
            Activation::Eager(Arc::new(FakeSource)),
        );
        logger.start().unwrap();

        let path = logger.current_path().unwrap();
        let name = path.file_name().unwrap().to_str().unwrap().to_string();
        assert!(name.starts_with("Marvel_csv_") && name.ends_with(".csv"));

        // Rows are written even before any frame arrives
        assert!(logger.write_snapshot().unwrap());

        logger.handle_frame(&frame(0x100, &[10]), 5_000_000);
        logger.handle_frame(&frame(0x100, &[20]), 5_250_000);
        logger.handle_frame(&frame(0x200, &[3]), 5_500_000);
        logger.handle_frame(&frame(0x300, &[9]), 5_750_000);
        assert!(logger.write_snapshot().unwrap());
        logger.stop().unwrap();

        let lines = read_lines(&path);
        assert_eq!(lines, vec!["Time,Speed,Volt", "s,km/h,V", "0,0,0", "0.75,20,1.5"]);
    }

    #[test]
    fn test_frames_ignored_before_start() {
        let dir = tempdir().unwrap();
        let mut logger = SignalLogger::new(quiet_config(dir.path()), Activation::Eager(Arc::new(FakeSource)));
        logger.handle_frame(&frame(0x100, &[10]), 0);
        assert!(!logger.is_active());

        logger.start().unwrap();
        logger.write_snapshot().unwrap();
        let path = logger.current_path().unwrap();
        logger.stop().unwrap();
        assert_eq!(read_lines(&path)[2], "0,0,0");
    }

    #[test]
    fn test_selector_activation() {
        let dir = tempdir().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let activation = Activation::SelectorGated {
            selector_id: DEFAULT_SELECTOR_ID,
            variants: default_variants(dir.path()),
        };
        let mut logger =
            SignalLogger::with_loader(quiet_config(dir.path()), activation, counting_loader(calls.clone()));
        logger.start().unwrap();

        // Unknown selector byte and ordinary frames do not activate
        logger.handle_frame(&frame(0x726, &[0x09]), 0);
        logger.handle_frame(&frame(0x100, &[1]), 10);
        assert!(!logger.is_active());
        assert!(!logger.write_snapshot().unwrap());
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        logger.handle_frame(&frame(0x726, &[0x03, 0xAA]), 1_000_000);
        assert_eq!(logger.active_variant().as_deref(), Some("Pegasus"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let path = logger.current_path().unwrap();
        let name = path.file_name().unwrap().to_str().unwrap().to_string();
        assert!(name.starts_with("Pegasus_csv_"));

        // The selector frame itself counts as an update
        assert!(logger.write_snapshot().unwrap());
        // No new frames: nothing to write
        assert!(!logger.write_snapshot().unwrap());

        // A second selector does not switch variants
        logger.handle_frame(&frame(0x726, &[0x01]), 1_100_000);
        logger.handle_frame(&frame(0x100, &[7]), 1_500_000);
        assert_eq!(logger.active_variant().as_deref(), Some("Pegasus"));
        assert!(logger.write_snapshot().unwrap());
        logger.stop().unwrap();

        let lines = read_lines(&path);
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[2], "0,0,0");
        assert_eq!(lines[3], "0.5,7,0");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_selector_load_failure_retries() {
        let dir = tempdir().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let variants = BTreeMap::from([
            (0x01, Variant::new("Broken", dir.path().join("missing.dbc"))),
            (0x02, Variant::new("Good", dir.path().join("good.dbc"))),
        ]);
        let activation = Activation::SelectorGated { selector_id: 0x726, variants };
        let mut logger =
            SignalLogger::with_loader(quiet_config(dir.path()), activation, counting_loader(calls.clone()));
        logger.start().unwrap();

        logger.handle_frame(&frame(0x726, &[0x01]), 0);
        assert!(!logger.is_active());

        logger.handle_frame(&frame(0x726, &[0x02]), 0);
        assert_eq!(logger.active_variant().as_deref(), Some("Good"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        logger.stop().unwrap();
    }

    #[test]
    fn test_periodic_writer_thread() {
        let dir = tempdir().unwrap();
        let config = SignalLoggerConfig::new(dir.path()).with_interval(Duration::from_millis(20));
        let mut logger = SignalLogger::new(config, Activation::Eager(Arc::new(FakeSource)));
        logger.start().unwrap();
        logger.handle_frame(&frame(0x100, &[42]), 0);

        thread::sleep(Duration::from_millis(200));
        let path = logger.current_path().unwrap();
        logger.stop().unwrap();
        assert!(!logger.is_running());

        let lines = read_lines(&path);
        assert!(lines.len() >= 4, "expected periodic rows, got {:?}", lines);
        // stop() is idempotent
        logger.stop().unwrap();
    }

    #[test]
    fn test_unwritable_directory_fails_start() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("file");
        fs::write(&blocker, b"x").unwrap();

        let mut logger = SignalLogger::new(
            quiet_config(&blocker.join("sub")),
            Activation::Eager(Arc::new(FakeSource)),
        );
        assert!(logger.start().is_err());
        assert!(!logger.is_running());
    }

    #[test]
    fn test_duplicate_signal_name_uses_last_column() {
        let dir = tempdir().unwrap();
        let mut logger = SignalLogger::new(quiet_config(dir.path()), Activation::Eager(Arc::new(DuplicateSource)));
        logger.start().unwrap();
        logger.handle_frame(&frame(0x100, &[5]), 0);
        logger.write_snapshot().unwrap();
        let path = logger.current_path().unwrap();
        logger.stop().unwrap();

        assert_eq!(read_lines(&path), vec!["Time,Speed,Speed", "s,km/h,rpm", "0,0,5"]);
    }

    #[test]
    fn test_frames_handled_while_file_is_busy() {
        let dir = tempdir().unwrap();
        let mut logger = SignalLogger::new(quiet_config(dir.path()), Activation::Eager(Arc::new(FakeSource)));
        logger.start().unwrap();

        let file = csv_file(&logger);
        let busy = file.lock().unwrap();
        logger.handle_frame(&frame(0x100, &[33]), 0);
        logger.handle_frame(&frame(0x200, &[4]), 100_000);
        assert!(logger.is_active());
        drop(busy);

        assert!(logger.write_snapshot().unwrap());
        let path = logger.current_path().unwrap();
        logger.stop().unwrap();
        assert_eq!(read_lines(&path)[2], "0.1,33,2");
    }

    #[test]
    fn test_write_failure_stops_only_the_logger() {
        let dir = tempdir().unwrap();
        let trace_path = dir.path().join("run.trc");
        let mut logger = SignalLogger::new(quiet_config(dir.path()), Activation::Eager(Arc::new(FakeSource)));
        logger.start().unwrap();

        let mut recorder = Recorder::new(ManualClock::new(0))
            .with_trace(TraceWriter::create(&trace_path, TraceConfig::default()).unwrap())
            .with_logger(logger);
        let mut bus = NullBus;
        recorder.on_event(
            AcquisitionEvent::Frame { frame: frame(0x100, &[1]), timestamp_us: 0 },
            &mut bus,
        );

        csv_file(&recorder.loggers()[0]).lock().unwrap().writer = Box::new(FailingWriter);
        assert!(recorder.loggers()[0].write_snapshot().is_err());

        let logger = &recorder.loggers()[0];
        assert!(logger.is_faulted());
        assert!(!logger.is_running());
        assert!(!logger.is_active());

        recorder.on_event(
            AcquisitionEvent::Frame { frame: frame(0x100, &[2]), timestamp_us: 1_000 },
            &mut bus,
        );
        // Frames after the fault are ignored
        assert!(!recorder.loggers()[0].is_active());
        assert!(!recorder.loggers()[0].write_snapshot().unwrap());

        assert_eq!(recorder.stats().logger_faults, 1);
        assert!(recorder.last_diagnostic().unwrap().starts_with("Signal logger #1 stopped"));

        let stats = recorder.finish().unwrap();
        assert_eq!(stats.trace_entries, 2);
        assert_eq!(stats.trace_faults, 0);
        let trace = fs::read_to_string(&trace_path).unwrap();
        assert_eq!(trace.lines().filter(|l| l.contains(" Rx ")).count(), 2);
    }
}
