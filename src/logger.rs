//! Diagnostic log
//!
//! A plain line-oriented log kept next to the service's `tracing` output. It
//! records every transition and failure in a format support staff can read
//! from a file on disk:
//!
//! ```text
//! [14:02:11]    7 Transitioned from blocked to connecting
//! [14:02:11]    7     added: permit-vpn-relay
//! ```
//!
//! Lines end with CRLF and are written as Latin-1; characters outside it
//! become `?`. Sink failures are reported through `tracing` and otherwise
//! ignored, so logging never fails a firewall operation.

use chrono::Local;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::warn;

use crate::error::FirewallResult;

/// Ordinal after which numbering starts over at 1
const MAX_ORDINAL: u16 = 9999;

/// Indentation of detail lines, after the ordinal
const DETAIL_INDENT: &str = "    ";

/// Destination for encoded log lines
pub trait LogSink: Send + Sync {
    /// Write one complete line, terminator included
    fn write_line(&mut self, line: &[u8]) -> io::Result<()>;
}

/// Log file on disk
pub struct FileSink {
    file: File,
    flush: bool,
}

impl FileSink {
    /// Open `path`, appending to or truncating an existing file. With
    /// `flush` set every line is flushed as soon as it is written.
    pub fn open(path: &Path, append: bool, flush: bool) -> FirewallResult<Self> {
        let mut options = OpenOptions::new();
        options.create(true);
        if append {
            options.append(true);
        } else {
            options.write(true).truncate(true);
        }
        let file = options.open(path)?;

        Ok(Self { file, flush })
    }
}

impl LogSink for FileSink {
    fn write_line(&mut self, line: &[u8]) -> io::Result<()> {
        self.file.write_all(line)?;
        if self.flush {
            self.file.flush()?;
        }
        Ok(())
    }
}

/// Discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl LogSink for NullSink {
    fn write_line(&mut self, _line: &[u8]) -> io::Result<()> {
        Ok(())
    }
}

/// Keeps lines in memory. Clones share the buffer.
#[derive(Debug, Default, Clone)]
pub struct CaptureSink {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl CaptureSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything written so far, exactly as encoded
    pub fn bytes(&self) -> Vec<u8> {
        self.bytes.lock().map(|b| b.clone()).unwrap_or_default()
    }

    /// Lines written so far, decoded and without terminators
    pub fn lines(&self) -> Vec<String> {
        let text: String = self.bytes().iter().map(|&b| char::from(b)).collect();
        text.split_terminator("\r\n").map(str::to_string).collect()
    }
}

impl LogSink for CaptureSink {
    fn write_line(&mut self, line: &[u8]) -> io::Result<()> {
        let mut bytes = self
            .bytes
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "capture buffer poisoned"))?;
        bytes.extend_from_slice(line);
        Ok(())
    }
}

/// Encode as Latin-1, replacing anything outside it with `?`
pub fn to_latin1(text: &str) -> Vec<u8> {
    text.chars()
        .map(|c| u8::try_from(u32::from(c)).unwrap_or(b'?'))
        .collect()
}

pub struct Logger {
    sink: Box<dyn LogSink>,
    ordinal: u16,
}

impl Logger {
    pub fn new(sink: impl LogSink + 'static) -> Self {
        Self {
            sink: Box::new(sink),
            ordinal: 1,
        }
    }

    /// Logger that writes nowhere
    pub fn null() -> Self {
        Self::new(NullSink)
    }

    /// Log one message
    pub fn log(&mut self, message: &str) {
        self.log_details::<&str>(message, &[]);
    }

    /// Log a message followed by indented detail lines sharing its
    /// timestamp and ordinal
    pub fn log_details<S: AsRef<str>>(&mut self, message: &str, details: &[S]) {
        let timestamp = Local::now().format("[%H:%M:%S]").to_string();
        let ordinal = self.next_ordinal();

        self.emit(&compose(&timestamp, ordinal, "", message));
        for detail in details {
            self.emit(&compose(&timestamp, ordinal, DETAIL_INDENT, detail.as_ref()));
        }
    }

    fn next_ordinal(&mut self) -> u16 {
        let current = self.ordinal;
        self.ordinal = if current >= MAX_ORDINAL { 1 } else { current + 1 };
        current
    }

    fn emit(&mut self, line: &str) {
        let mut bytes = to_latin1(line);
        bytes.extend_from_slice(b"\r\n");
        if let Err(e) = self.sink.write_line(&bytes) {
            warn!("Failed to write diagnostic log line: {}", e);
        }
    }
}

fn compose(timestamp: &str, ordinal: u16, indent: &str, message: &str) -> String {
    format!("{} {:>4} {}{}", timestamp, ordinal, indent, message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    /// Drop the `[HH:MM:SS] ` prefix so assertions don't depend on the clock
    fn strip_time(line: &str) -> &str {
        &line[11..]
    }

    #[test]
    fn test_line_format() {
        let capture = CaptureSink::new();
        let mut logger = Logger::new(capture.clone());
        logger.log("Firewall initialized");

        let lines = capture.lines();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with('['));
        assert_eq!(&lines[0][3..4], ":");
        assert_eq!(&lines[0][9..10], "]");
        assert_eq!(strip_time(&lines[0]), "   1 Firewall initialized");
        assert!(capture.bytes().ends_with(b"\r\n"));
    }

    #[test]
    fn test_details_share_ordinal() {
        let capture = CaptureSink::new();
        let mut logger = Logger::new(capture.clone());
        logger.log("first");
        logger.log_details("second", &["added: a", "removed: b"]);

        let lines = capture.lines();
        assert_eq!(lines.len(), 4);
        assert_eq!(strip_time(&lines[1]), "   2 second");
        assert_eq!(strip_time(&lines[2]), "   2     added: a");
        assert_eq!(strip_time(&lines[3]), "   2     removed: b");
        assert_eq!(&lines[1][..10], &lines[3][..10]);
    }

    #[test]
    fn test_ordinal_wraps() {
        let capture = CaptureSink::new();
        let mut logger = Logger::new(capture.clone());
        logger.ordinal = MAX_ORDINAL;
        logger.log("last");
        logger.log("wrapped");

        let lines = capture.lines();
        assert_eq!(strip_time(&lines[0]), "9999 last");
        assert_eq!(strip_time(&lines[1]), "   1 wrapped");
    }

    #[test]
    fn test_latin1_transcoding() {
        assert_eq!(to_latin1("caf\u{e9}"), vec![b'c', b'a', b'f', 0xe9]);
        assert_eq!(to_latin1("\u{2192} wg0"), b"? wg0".to_vec());
    }

    #[test]
    fn test_file_sink_append_and_truncate() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("firewall.log");

        let mut logger = Logger::new(FileSink::open(&path, true, true).unwrap());
        logger.log("one");
        drop(logger);
        let mut logger = Logger::new(FileSink::open(&path, true, false).unwrap());
        logger.log("two");
        drop(logger);

        let content = std::fs::read(&path).unwrap();
        assert_eq!(content.iter().filter(|&&b| b == b'\n').count(), 2);

        let mut logger = Logger::new(FileSink::open(&path, false, true).unwrap());
        logger.log("three");
        drop(logger);

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 1);
        assert!(content.trim_end().ends_with("three"));
    }

    #[test]
    fn test_null_sink() {
        let mut logger = Logger::null();
        logger.log("nowhere");
        assert_eq!(logger.ordinal, 2);
    }
}
