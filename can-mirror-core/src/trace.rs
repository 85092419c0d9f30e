//! Legacy trace file writer
//!
//! Writes frames in the line-oriented PCAN trace format (`.trc`,
//! FILEVERSION 1.1) so recordings open in the usual trace viewers:
//!
//! ```text
//! ;$FILEVERSION=1.1
//! ;$STARTTIME=19730.4551335648
//! ...
//!      1)        0.0  Rx         0100  2  05 00
//!      2)        0.4  Tx         0200  2  0F 00
//! ; PCAN HARDWARE GOT DISCONNECTED AT 10:55:23.114.0
//! ```
//!
//! Sequence numbers and time offsets restart with every file. Once the
//! current file reaches the configured size, the next entry opens a
//! successor file named `<stem>_<NNN>.<ext>`.

use crate::config::TraceConfig;
use crate::types::{CoreError, Direction, Frame, Result};
use chrono::{DateTime, Local, Utc};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// Format the fixed header block of a trace file
pub fn format_header(start: DateTime<Local>, generator: &str) -> String {
    let epoch_days = start.with_timezone(&Utc).timestamp_micros() as f64 / 1_000_000.0 / 86_400.0;
    let human_time = start.format("%d-%m-%Y %H:%M:%S");
    let millis = start.timestamp_subsec_millis();

    format!(
        ";$FILEVERSION=1.1\n\
         ;$STARTTIME={:.10}\n\
         ;\n\
         ;   Start time: {}.{:03}.0\n\
         ;   Generated by {}\n\
         ;\n\
         ;   Message Number\n\
         ;   |         Time Offset (ms)\n\
         ;   |         |        Type\n\
         ;   |         |        |        ID (hex)\n\
         ;   |         |        |        |     Data Length\n\
         ;   |         |        |        |     |   Data Bytes (hex) ...\n\
         ;   |         |        |        |     |   |\n\
         ;---+--   ----+----  --+--  ----+---  +  -+ -- -- -- -- -- -- --\n",
        epoch_days, human_time, millis, generator
    )
}

/// Format one data line
pub fn format_entry(seq: u32, offset_ms: f64, direction: Direction, frame: &Frame) -> String {
    let data = frame
        .payload()
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ");

    format!(
        "{:6}){:11.1}  {:<3}        {:04X}  {}  {}\n",
        seq,
        offset_ms,
        direction,
        frame.id,
        frame.len(),
        data
    )
}

/// Format an operator comment line
pub fn format_comment(text: &str) -> String {
    let text = text.trim_end_matches(['\r', '\n']);
    if text.starts_with(';') {
        format!("{}\n", text)
    } else {
        format!("; {}\n", text)
    }
}

/// Name of the `index`-th successor of `base`
pub fn rotated_path(base: &Path, index: u32) -> PathBuf {
    let stem = base
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("trace");
    let name = match base.extension().and_then(|e| e.to_str()) {
        Some(ext) => format!("{}_{:03}.{}", stem, index, ext),
        None => format!("{}_{:03}", stem, index),
    };
    base.with_file_name(name)
}

/// Trace writer with size-triggered rotation
pub struct TraceWriter {
    config: TraceConfig,
    base_path: PathBuf,
    current_path: PathBuf,
    file: Option<BufWriter<File>>,
    bytes_written: u64,
    header_written: bool,
    next_seq: u32,
    time_base_us: Option<u64>,
    rotations: u32,
    halted: bool,
}

impl TraceWriter {
    /// Create the trace file and write its header
    pub fn create(path: impl Into<PathBuf>, config: TraceConfig) -> Result<Self> {
        let base_path = path.into();
        if let Some(parent) = base_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let file = File::create(&base_path)?;
        log::info!("Trace logging to {:?}", base_path);

        let mut writer = Self {
            config,
            current_path: base_path.clone(),
            base_path,
            file: Some(BufWriter::new(file)),
            bytes_written: 0,
            header_written: false,
            next_seq: 1,
            time_base_us: None,
            rotations: 0,
            halted: false,
        };
        writer.write_header()?;
        Ok(writer)
    }

    /// Write the header block. Only the first call per file has an effect.
    pub fn write_header(&mut self) -> Result<()> {
        if self.header_written {
            return Ok(());
        }
        let header = format_header(Local::now(), &self.config.generator);
        self.write_raw(&header)?;
        self.header_written = true;
        Ok(())
    }

    /// Append a frame entry and return its sequence number
    pub fn write_entry(&mut self, frame: &Frame, timestamp_us: u64, direction: Direction) -> Result<u32> {
        if self.halted {
            return Err(CoreError::Halted);
        }

        if self.bytes_written >= self.config.max_file_size {
            self.rotate()?;
        }

        let base = *self.time_base_us.get_or_insert(timestamp_us);
        let offset_ms = (timestamp_us as i64 - base as i64) as f64 / 1000.0;
        let seq = self.next_seq;

        let line = format_entry(seq, offset_ms, direction, frame);
        self.write_raw(&line)?;
        self.next_seq += 1;
        Ok(seq)
    }

    /// Append a comment line; comments do not consume a sequence number
    pub fn write_comment(&mut self, text: &str) -> Result<()> {
        if self.halted {
            return Err(CoreError::Halted);
        }
        self.write_raw(&format_comment(text))
    }

    fn write_raw(&mut self, text: &str) -> Result<()> {
        let file = self.file.as_mut().ok_or(CoreError::Halted)?;
        let result = file.write_all(text.as_bytes()).and_then(|_| file.flush());
        if let Err(e) = result {
            log::error!("Trace write to {:?} failed: {}", self.current_path, e);
            self.halted = true;
            return Err(e.into());
        }
        self.bytes_written += text.len() as u64;
        Ok(())
    }

    fn rotate(&mut self) -> Result<()> {
        if let Some(mut old) = self.file.take() {
            if let Err(e) = old.flush() {
                log::warn!("Flushing {:?} before rotation failed: {}", self.current_path, e);
            }
        }

        let next_index = self.rotations + 1;
        let next_path = rotated_path(&self.base_path, next_index);
        let file = match File::create(&next_path) {
            Ok(file) => file,
            Err(e) => {
                // Stop writing rather than silently dropping entries
                self.halted = true;
                log::error!("Cannot create trace file {:?}: {}", next_path, e);
                return Err(CoreError::Rotation(format!("{:?}: {}", next_path, e)));
            }
        };

        log::info!("Trace rotated to {:?}", next_path);
        self.rotations = next_index;
        self.current_path = next_path;
        self.file = Some(BufWriter::new(file));
        self.bytes_written = 0;
        self.header_written = false;
        self.next_seq = 1;
        self.time_base_us = None;
        self.write_header()
    }

    /// Flush and close the current file
    pub fn close(&mut self) -> Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush()?;
            log::info!("Trace closed: {:?}", self.current_path);
        }
        self.halted = true;
        Ok(())
    }

    pub fn current_path(&self) -> &Path {
        &self.current_path
    }

    pub fn rotations(&self) -> u32 {
        self.rotations
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }
}

impl Drop for TraceWriter {
    fn drop(&mut self) {
        if let Some(file) = self.file.as_mut() {
            let _ = file.flush();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn frame(id: u32, data: &[u8]) -> Frame {
        Frame::new(id, id > 0x7FF, data).unwrap()
    }

    #[test]
    fn test_entry_format() {
        let line = format_entry(1, 0.0, Direction::Rx, &frame(0x123, &[0x01, 0xAB, 0x3]));
        let expected = format!("{}){}  {}{}{}  3  01 AB 03\n", "     1", "        0.0", "Rx ", " ".repeat(8), "0123");
        assert_eq!(line, expected);

        let line = format_entry(123456, 98765.43, Direction::Tx, &frame(0x18FF00, &[]));
        assert_eq!(line, "123456)    98765.4  Tx         18FF00  0  \n");
    }

    #[test]
    fn test_comment_format() {
        assert_eq!(format_comment("HELLO"), "; HELLO\n");
        assert_eq!(format_comment("; already\n"), "; already\n");
    }

    #[test]
    fn test_header_format() {
        let start = Local.with_ymd_and_hms(2024, 3, 5, 9, 7, 2).unwrap();
        let header = format_header(start, "PCAN-View v5.0.1.007");
        let lines: Vec<&str> = header.lines().collect();

        assert_eq!(lines[0], ";$FILEVERSION=1.1");
        assert!(lines[1].starts_with(";$STARTTIME="));
        let days: f64 = lines[1][";$STARTTIME=".len()..].parse().unwrap();
        let expected = start.timestamp() as f64 / 86_400.0;
        assert!((days - expected).abs() < 1e-9);
        assert_eq!(lines[3], ";   Start time: 05-03-2024 09:07:02.000.0");
        assert_eq!(lines[4], ";   Generated by PCAN-View v5.0.1.007");
        assert_eq!(lines.len(), 14);
        assert!(lines[13].starts_with(";---+--"));
    }

    #[test]
    fn test_rotated_path() {
        assert_eq!(
            rotated_path(Path::new("/logs/run.trc"), 2),
            PathBuf::from("/logs/run_002.trc")
        );
        assert_eq!(rotated_path(Path::new("run"), 1), PathBuf::from("run_001"));
    }

    #[test]
    fn test_sequence_and_offsets() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("session.trc");
        let mut writer = TraceWriter::create(&path, TraceConfig::default()).unwrap();

        assert_eq!(writer.write_entry(&frame(0x100, &[5]), 2_000_000, Direction::Rx).unwrap(), 1);
        writer.write_comment("PCAN HARDWARE GOT DISCONNECTED AT 10:00:00.000.0").unwrap();
        assert_eq!(writer.write_entry(&frame(0x200, &[15]), 2_012_345, Direction::Tx).unwrap(), 2);
        writer.close().unwrap();

        let content = fs::read_to_string(&path).unwrap();
        let body: Vec<&str> = content.lines().skip(14).collect();
        assert_eq!(body.len(), 3);
        assert!(body[0].starts_with("     1)        0.0  Rx "));
        assert!(body[1].starts_with("; PCAN HARDWARE"));
        assert!(body[2].starts_with("     2)       12.3  Tx "));
        assert!(body[2].ends_with("0200  1  0F"));
    }

    #[test]
    fn test_rotation_resets_sequence_and_time_base() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rot.trc");

        let generator = "test";
        let header_len = format_header(Local::now(), generator).len() as u64;
        let first_line = format_entry(1, 0.0, Direction::Rx, &frame(0x100, &[1, 2]));
        let config = TraceConfig::new()
            .with_generator(generator)
            .with_max_file_size(header_len + first_line.len() as u64);

        let mut writer = TraceWriter::create(&path, config).unwrap();
        writer.write_entry(&frame(0x100, &[1, 2]), 1_000, Direction::Rx).unwrap();
        assert_eq!(writer.rotations(), 0);

        let seq = writer.write_entry(&frame(0x100, &[3, 4]), 501_000, Direction::Rx).unwrap();
        assert_eq!(seq, 1);
        assert_eq!(writer.rotations(), 1);
        assert_eq!(writer.current_path(), dir.path().join("rot_001.trc"));
        writer.close().unwrap();

        let first = fs::read_to_string(&path).unwrap();
        assert_eq!(first.lines().count(), 15);

        let second = fs::read_to_string(dir.path().join("rot_001.trc")).unwrap();
        assert!(second.starts_with(";$FILEVERSION=1.1\n"));
        let entry = second.lines().nth(14).unwrap();
        assert!(entry.starts_with("     1)        0.0  Rx "));
        assert!(entry.ends_with("03 04"));
    }

    #[test]
    fn test_closed_writer_refuses_writes() {
        let dir = tempdir().unwrap();
        let mut writer = TraceWriter::create(dir.path().join("x.trc"), TraceConfig::default()).unwrap();
        writer.close().unwrap();
        assert!(matches!(
            writer.write_entry(&frame(1, &[]), 0, Direction::Rx),
            Err(CoreError::Halted)
        ));
    }

    #[test]
    fn test_rotation_failure_halts() {
        let dir = tempdir().unwrap();
        let sub = dir.path().join("gone");
        fs::create_dir(&sub).unwrap();
        let path = sub.join("t.trc");

        let mut writer =
            TraceWriter::create(&path, TraceConfig::new().with_max_file_size(1)).unwrap();
        fs::remove_dir_all(&sub).unwrap();

        let result = writer.write_entry(&frame(0x1, &[1]), 0, Direction::Rx);
        assert!(matches!(result, Err(CoreError::Rotation(_))));
        assert!(writer.is_halted());
        assert!(matches!(
            writer.write_entry(&frame(0x1, &[1]), 0, Direction::Rx),
            Err(CoreError::Halted)
        ));
    }
}
