//! CAN Mirror CLI Application
//!
//! Command-line front end of the can-mirror-core library:
//! - Loads a TOML session (bus, trace, mirror rules, loggers, transmit list)
//! - Opens the hardware backend and runs acquisition on its own thread
//! - Stops on Ctrl-C or after `--duration`, closing every sink cleanly
//! - Prints a session summary

use anyhow::{bail, Context, Result};
use can_mirror_core::{
    Activation, AcquisitionHandle, AcquisitionMachine, CanDriver, MirrorEngine, Recorder,
    RecorderStats, SignalDatabase, SignalLogger, SimulatedDriver, SystemClock, TraceWriter,
    TransmitEntry, TransmitHistory, TransmitSchedule,
};
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

mod config;
#[cfg(target_os = "linux")]
mod socketcan_driver;

use config::{AppConfig, Backend, LoggerSection, TraceSection};

/// CAN Mirror - Mirror and record live CAN traffic
#[derive(Parser, Debug)]
#[command(name = "can-mirror-cli")]
#[command(about = "Mirror live CAN frames and record trace/CSV logs", long_about = None)]
#[command(version)]
struct Args {
    /// Path to session configuration file (session.toml)
    #[arg(short, long, value_name = "FILE")]
    config: PathBuf,

    /// CAN interface to open (overrides bus.channel)
    #[arg(short, long, value_name = "IFACE")]
    interface: Option<String>,

    /// Trace output file (overrides trace.path)
    #[arg(short, long, value_name = "FILE")]
    trace: Option<PathBuf>,

    /// Stop after this many seconds
    #[arg(short, long, value_name = "SECS")]
    duration: Option<u64>,

    /// Verbosity level (can be repeated: -v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long)]
    quiet: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(args.verbose, args.quiet);

    log::info!("CAN Mirror CLI v{}", env!("CARGO_PKG_VERSION"));
    log::info!("Using core library v{}", can_mirror_core::VERSION);

    log::info!("Loading configuration from: {:?}", args.config);
    let mut config = config::load_config(&args.config)?;
    apply_overrides(&mut config, &args);

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = Arc::clone(&stop);
        ctrlc::set_handler(move || stop.store(true, Ordering::SeqCst))
            .context("Failed to install Ctrl-C handler")?;
    }

    match config.bus.backend {
        Backend::Socketcan => run_socketcan(&config, args.duration, &stop),
        Backend::Simulated => {
            let (driver, _sim) = SimulatedDriver::new();
            run_session(driver, &config, args.duration, &stop)
        }
    }
}

fn apply_overrides(config: &mut AppConfig, args: &Args) {
    if let Some(interface) = &args.interface {
        config.bus.channel = interface.clone();
    }
    if let Some(path) = &args.trace {
        match config.trace.as_mut() {
            Some(trace) => trace.path = path.clone(),
            None => {
                config.trace = Some(TraceSection {
                    path: path.clone(),
                    settings: Default::default(),
                })
            }
        }
    }
}

#[cfg(target_os = "linux")]
fn run_socketcan(config: &AppConfig, duration: Option<u64>, stop: &AtomicBool) -> Result<()> {
    run_session(socketcan_driver::SocketCanDriver::new(), config, duration, stop)
}

#[cfg(not(target_os = "linux"))]
fn run_socketcan(_config: &AppConfig, _duration: Option<u64>, _stop: &AtomicBool) -> Result<()> {
    bail!("SocketCAN is only available on Linux; set bus.backend = \"simulated\"")
}

fn build_logger(section: &LoggerSection) -> Result<SignalLogger> {
    let activation = match section {
        LoggerSection::Eager { dbc, .. } => {
            let db = SignalDatabase::from_dbc_file(dbc)
                .with_context(|| format!("Failed to load DBC: {:?}", dbc))?;
            let stats = db.stats();
            log::info!(
                "Loaded {} messages / {} signals from {:?}",
                stats.num_messages,
                stats.num_signals,
                dbc
            );
            Activation::Eager(Arc::new(db))
        }
        LoggerSection::Selector { selector_id, .. } => {
            let variants = section.variant_map();
            if variants.is_empty() {
                bail!("Selector logger has no variants");
            }
            for (selector, variant) in &variants {
                if !variant.database.exists() {
                    log::warn!(
                        "Database for variant 0x{:02X} ({}) not found: {:?}",
                        selector,
                        variant.name,
                        variant.database
                    );
                }
            }
            Activation::SelectorGated {
                selector_id: *selector_id,
                variants,
            }
        }
    };

    Ok(SignalLogger::new(section.logger_config(), activation))
}

fn start_logger(section: &LoggerSection) -> Result<SignalLogger> {
    let mut logger = build_logger(section)?;
    logger
        .start()
        .with_context(|| format!("Failed to start signal logger in {:?}", section.logger_config().output_dir))?;
    Ok(logger)
}

/// Configured entries first, then saved ones that are not already listed
fn merge_transmit_entries(configured: &[TransmitEntry], saved: Vec<TransmitEntry>) -> Vec<TransmitEntry> {
    let same = |a: &TransmitEntry, b: &TransmitEntry| {
        a.can_id == b.can_id
            && a.extended == b.extended
            && a.data == b.data
            && a.cycle_ms == b.cycle_ms
    };

    let mut entries = configured.to_vec();
    for entry in saved {
        if !configured.iter().any(|c| same(c, &entry)) {
            entries.push(entry);
        }
    }
    entries
}

fn run_session<D: CanDriver + 'static>(
    driver: D,
    config: &AppConfig,
    duration: Option<u64>,
    stop: &AtomicBool,
) -> Result<()> {
    let clock = SystemClock::shared();

    let mirror = Arc::new(MirrorEngine::new(Arc::clone(&clock)));
    for rule in &config.mirror.rules {
        mirror.add_rule(rule.clone());
    }
    log::info!("{} mirror rule(s) loaded", config.mirror.rules.len());

    let mut recorder = Recorder::new(Arc::clone(&clock)).with_mirror(Arc::clone(&mirror));

    if let Some(trace) = &config.trace {
        let writer = TraceWriter::create(&trace.path, trace.settings.clone())
            .with_context(|| format!("Failed to create trace file: {:?}", trace.path))?;
        recorder = recorder.with_trace(writer);
    }

    // A logger that cannot start is skipped; the trace and mirror still run
    let mut skipped = Vec::with_capacity(config.loggers.len());
    for (idx, section) in config.loggers.iter().enumerate() {
        match start_logger(section) {
            Ok(logger) => {
                recorder = recorder.with_logger(logger);
                skipped.push(None);
            }
            Err(e) => {
                log::error!("Signal logger #{} disabled: {:#}", idx + 1, e);
                skipped.push(Some(format!("{:#}", e)));
            }
        }
    }

    let history = config.transmit.history.as_ref().map(TransmitHistory::new);
    let saved = match &history {
        Some(history) => history
            .load()
            .with_context(|| format!("Failed to load transmit history: {:?}", history.path()))?,
        None => Vec::new(),
    };
    let entries = merge_transmit_entries(&config.transmit.entries, saved);
    let cyclic = entries.iter().filter(|e| e.is_cyclic()).count();
    log::info!("{} transmit entries ({} cyclic)", entries.len(), cyclic);
    recorder = recorder.with_transmit(TransmitSchedule::new(entries));

    let machine = AcquisitionMachine::new(driver, config.bus.acquisition());
    let mut handle = AcquisitionHandle::spawn(machine, recorder)
        .context("Failed to start acquisition thread")?;
    log::info!("Acquisition running on {} (Ctrl-C to stop)", config.bus.channel);

    let started = Instant::now();
    let limit = duration.map(Duration::from_secs);
    while !stop.load(Ordering::SeqCst) && handle.is_running() {
        if limit.is_some_and(|limit| started.elapsed() >= limit) {
            log::info!("Run duration elapsed");
            break;
        }
        thread::sleep(Duration::from_millis(100));
    }

    let (_machine, mut recorder) = handle
        .stop()
        .context("Acquisition thread terminated abnormally")?;

    if let Some(history) = &history {
        if let Err(e) = history.save(recorder.transmit().entries()) {
            log::warn!("Failed to save transmit history {:?}: {}", history.path(), e);
        }
    }

    let summary = SinkSummary::capture(&recorder, &skipped);
    let stats = recorder.finish().context("Failed to close output files")?;
    print_summary(&stats, &summary, &mirror, started.elapsed());

    Ok(())
}

enum LoggerSummary {
    Skipped(String),
    Ran {
        path: Option<PathBuf>,
        rows: u64,
        faulted: bool,
    },
}

/// Output locations, captured before the sinks are closed
struct SinkSummary {
    trace: Option<(PathBuf, u32)>,
    loggers: Vec<LoggerSummary>,
}

impl SinkSummary {
    /// `skipped` holds one entry per configured logger, with the reason it
    /// was not started
    fn capture(recorder: &Recorder, skipped: &[Option<String>]) -> Self {
        let mut running = recorder.loggers().iter();
        let loggers = skipped
            .iter()
            .filter_map(|reason| match reason {
                Some(reason) => Some(LoggerSummary::Skipped(reason.clone())),
                None => running.next().map(|l| LoggerSummary::Ran {
                    path: l.current_path(),
                    rows: l.rows_written(),
                    faulted: l.is_faulted(),
                }),
            })
            .collect();

        Self {
            trace: recorder
                .trace()
                .map(|t| (t.current_path().to_path_buf(), t.rotations())),
            loggers,
        }
    }
}

fn print_summary(stats: &RecorderStats, sinks: &SinkSummary, mirror: &MirrorEngine, elapsed: Duration) {
    println!("═══════════════════════════════════════════════");
    println!("  CAN Mirror - Session Summary");
    println!("═══════════════════════════════════════════════\n");

    println!("Run time:        {:.1} s", elapsed.as_secs_f64());
    println!("Connects:        {}", stats.connects);
    println!("Disconnects:     {}", stats.disconnects);
    println!("Diagnostics:     {}", stats.diagnostics);
    println!("Logger faults:   {}", stats.logger_faults);
    println!("RX frames:       {}", stats.rx_frames);
    println!("Mirrored frames: {}", stats.mirrored_frames);
    println!("Cyclic frames:   {}", stats.cyclic_frames);

    let rules = mirror.rules();
    if !rules.is_empty() {
        println!("\nMirror rules (last RX payload):");
        for rule in &rules {
            let data = mirror
                .last_rx_snapshot(rule.rx_id)
                .iter()
                .map(|b| format!("{:02X}", b))
                .collect::<Vec<_>>()
                .join(" ");
            println!(
                "  {:>8X} -> {:<8X} {}  [{}]",
                rule.rx_id,
                rule.tx_id,
                if rule.enabled { "on " } else { "off" },
                data
            );
        }
    }

    println!("\nOutputs:");
    match &sinks.trace {
        Some((path, rotations)) => println!(
            "  Trace: {:?} ({} entries, {} rotation(s))",
            path, stats.trace_entries, rotations
        ),
        None if stats.trace_faults > 0 => println!("  Trace: stopped after a write failure"),
        None => println!("  Trace: disabled"),
    }
    for (idx, logger) in sinks.loggers.iter().enumerate() {
        match logger {
            LoggerSummary::Skipped(reason) => println!("  Logger #{}: not started ({})", idx + 1, reason),
            LoggerSummary::Ran { faulted: true, .. } => {
                println!("  Logger #{}: stopped after a write failure", idx + 1)
            }
            LoggerSummary::Ran { path: Some(path), rows, .. } => {
                println!("  Logger #{}: {:?} ({} rows)", idx + 1, path, rows)
            }
            LoggerSummary::Ran { path: None, .. } => println!("  Logger #{}: never activated", idx + 1),
        }
    }
}

/// Initialize logging based on verbosity level
fn init_logging(verbose: u8, quiet: bool) {
    use env_logger::Builder;
    use log::LevelFilter;
    use std::io::Write;

    let level = if quiet {
        LevelFilter::Error
    } else {
        match verbose {
            0 => LevelFilter::Info,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    };

    Builder::new()
        .filter_level(level)
        .format(|buf, record| {
            writeln!(
                buf,
                "[{} {}] {}",
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_overrides() {
        let args = Args::parse_from([
            "can-mirror-cli",
            "--config",
            "session.toml",
            "--interface",
            "vcan1",
            "--trace",
            "out.trc",
            "--duration",
            "5",
            "-vv",
        ]);
        assert_eq!(args.verbose, 2);
        assert_eq!(args.duration, Some(5));

        let mut config = AppConfig::default();
        apply_overrides(&mut config, &args);
        assert_eq!(config.bus.channel, "vcan1");
        let trace = config.trace.unwrap();
        assert_eq!(trace.path, PathBuf::from("out.trc"));
        assert_eq!(trace.settings.max_file_size, 10 * 1024 * 1024);
    }

    #[test]
    fn test_merge_transmit_entries() {
        let configured = vec![TransmitEntry::new(0x100, &[1]).with_cycle_ms(100.0)];
        let mut saved_same = configured[0].clone();
        saved_same.enabled = false;
        let mut saved_other = TransmitEntry::new(0x200, &[2]);
        saved_other.enabled = false;

        let merged = merge_transmit_entries(&configured, vec![saved_same, saved_other]);
        assert_eq!(merged.len(), 2);
        assert!(merged[0].enabled);
        assert_eq!(merged[1].can_id, 0x200);
        assert!(!merged[1].enabled);
    }

    #[test]
    fn test_simulated_session_runs_to_duration() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::default();
        config.bus.backend = Backend::Simulated;
        config.trace = Some(TraceSection {
            path: dir.path().join("sim.trc"),
            settings: Default::default(),
        });

        let stop = AtomicBool::new(false);
        let (driver, _sim) = SimulatedDriver::new();
        run_session(driver, &config, Some(0), &stop).unwrap();

        let trace = std::fs::read_to_string(dir.path().join("sim.trc")).unwrap();
        assert!(trace.starts_with(";$FILEVERSION=1.1"));
    }

    #[test]
    fn test_failed_loggers_do_not_stop_the_session() {
        let dir = tempfile::tempdir().unwrap();
        let dbc = dir.path().join("motor.dbc");
        std::fs::write(
            &dbc,
            "VERSION \"\"\n\nNS_ :\n\nBS_:\n\nBU_: MCU\n\nBO_ 256 Motor: 1 MCU\n SG_ Speed : 0|8@1+ (1,0) [0|255] \"rpm\" MCU\n",
        )
        .unwrap();
        let not_a_dir = dir.path().join("blocker");
        std::fs::write(&not_a_dir, b"x").unwrap();
        let trace_path = dir.path().join("session.trc");

        let mut config = AppConfig::default();
        config.bus.backend = Backend::Simulated;
        config.trace = Some(TraceSection {
            path: trace_path.clone(),
            settings: Default::default(),
        });
        config.loggers = vec![
            // Output directory is a regular file
            LoggerSection::Eager {
                dbc: dbc.clone(),
                output_dir: not_a_dir.join("csv"),
                file_prefix: None,
                interval_ms: 500,
            },
            LoggerSection::Eager {
                dbc: dir.path().join("missing.dbc"),
                output_dir: dir.path().to_path_buf(),
                file_prefix: None,
                interval_ms: 500,
            },
        ];

        let (driver, sim) = SimulatedDriver::new();
        sim.push_frame(can_mirror_core::Frame::new(0x100, false, &[7]).unwrap(), 0);
        let stop = AtomicBool::new(false);
        run_session(driver, &config, Some(1), &stop).unwrap();

        let trace = std::fs::read_to_string(&trace_path).unwrap();
        assert!(trace.contains("PCAN HARDWARE GOT CONNECTED BACK AT"));
        assert!(trace.lines().any(|l| l.contains(" Rx ") && l.contains("0100")));
    }
}
