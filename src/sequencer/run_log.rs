//! Append-only run log.
//!
//! The run log is the test record: a header naming the script and both firmware versions, the
//! column header, one row per DUT sample, communication and fault notes, and a closing line.
//! Absorber polls are fault checks only and produce no rows. Every line reaches the sink as
//! soon as it is written so the file can be inspected after a crash.
//!
//! Write failures do not interrupt the sequence. The first one is kept and returned from
//! [`RunLog::finish`] once the rig is back at rest.

use chrono::{DateTime, Local};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use crate::error::{AppResult, DynoError};
use crate::measurement::{FaultCode, MeasurementSample, Role, COLUMN_HEADER};

/// Closing line written when the sequence terminates.
pub const END_OF_SEQUENCE: &str = "End of test sequence";

/// Destination for run log lines.
pub trait LogSink: Send {
    /// Append one line and make it durable before returning.
    fn append(&mut self, line: &str) -> io::Result<()>;

    /// Release the sink.
    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Attempts at a free file name before giving up.
const MAX_NAME_ATTEMPTS: u32 = 100;

/// File name for a run starting at `started`: `{prefix}_{YYYYmmdd_HHMMSS}.txt`.
pub fn log_file_name(prefix: &str, started: DateTime<Local>) -> String {
    format!("{}_{}.txt", prefix, started.format("%Y%m%d_%H%M%S"))
}

/// File name for the `n`th run started in the same second; `n == 0` is the plain name.
fn numbered_file_name(prefix: &str, started: DateTime<Local>, n: u32) -> String {
    if n == 0 {
        return log_file_name(prefix, started);
    }
    format!("{}_{}_{}.txt", prefix, started.format("%Y%m%d_%H%M%S"), n)
}

/// Run log backed by a text file.
pub struct FileLogSink {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl FileLogSink {
    /// Create a new timestamped log file in `directory`, creating the directory if needed.
    ///
    /// An existing log is never reused: if the name is taken, a counter suffix (`_1`, `_2`, ...)
    /// is added.
    pub fn create(directory: &Path, prefix: &str) -> io::Result<Self> {
        fs::create_dir_all(directory)?;
        let started = Local::now();
        for n in 0..MAX_NAME_ATTEMPTS {
            let path = directory.join(numbered_file_name(prefix, started, n));
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => {
                    tracing::info!(path = %path.display(), "Run log created");
                    return Ok(Self {
                        path,
                        writer: BufWriter::new(file),
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e),
            }
        }
        Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!(
                "no free run log name for prefix '{}' in {}",
                prefix,
                directory.display()
            ),
        ))
    }

    /// Path of the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl LogSink for FileLogSink {
    fn append(&mut self, line: &str) -> io::Result<()> {
        writeln!(self.writer, "{}", line)?;
        self.writer.flush()
    }

    fn close(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }
}

/// In-memory sink; clones share the same lines.
#[derive(Debug, Clone, Default)]
pub struct MemoryLogSink {
    lines: Arc<Mutex<Vec<String>>>,
    fail_after: Option<usize>,
}

impl MemoryLogSink {
    /// Empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sink that accepts `n` lines and then fails every write.
    pub fn failing_after(n: usize) -> Self {
        Self {
            fail_after: Some(n),
            ..Self::default()
        }
    }

    /// Lines written so far.
    pub fn lines(&self) -> Vec<String> {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl LogSink for MemoryLogSink {
    fn append(&mut self, line: &str) -> io::Result<()> {
        let mut lines = self.lines.lock().unwrap_or_else(PoisonError::into_inner);
        if self.fail_after.is_some_and(|n| lines.len() >= n) {
            return Err(io::Error::other("log sink full"));
        }
        lines.push(line.to_string());
        Ok(())
    }
}

/// Formats run log lines onto a sink and remembers the first write failure.
pub struct RunLog {
    sink: Box<dyn LogSink>,
    first_error: Option<io::Error>,
    rows: usize,
}

impl RunLog {
    /// Wrap a sink.
    pub fn new(sink: impl LogSink + 'static) -> Self {
        Self {
            sink: Box::new(sink),
            first_error: None,
            rows: 0,
        }
    }

    fn write(&mut self, line: &str) {
        if let Err(e) = self.sink.append(line) {
            tracing::error!("Run log write failed: {}", e);
            self.first_error.get_or_insert(e);
        }
    }

    /// Script identity, one firmware line per controller, then the column header.
    pub fn header(&mut self, script_name: &str, dut_firmware: &str, absorber_firmware: &str) {
        self.write(script_name);
        self.write(&format!("{} Firmware: {}", Role::Dut, dut_firmware));
        self.write(&format!("{} Firmware: {}", Role::Absorber, absorber_firmware));
        self.write(COLUMN_HEADER);
    }

    /// One sample row.
    pub fn sample(&mut self, sample: &MeasurementSample) {
        self.rows += 1;
        self.write(&sample.to_row());
    }

    /// A set-command or poll that got no usable answer.
    pub fn comm_error(&mut self, role: Role, detail: &str) {
        self.write(&format!("Communication error with {} - {}", role, detail));
    }

    /// A controller reported a fault.
    pub fn fault(&mut self, role: Role, code: FaultCode) {
        self.write(&format!("{} faulted with code {}", role, code));
    }

    /// The closing line.
    pub fn end(&mut self) {
        self.write(END_OF_SEQUENCE);
    }

    /// Sample rows written so far.
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Close the sink, returning the first write failure if there was one.
    pub fn finish(mut self) -> AppResult<()> {
        let closed = self.sink.close();
        match (self.first_error.take(), closed) {
            (Some(e), _) | (None, Err(e)) => Err(DynoError::RunLog(e)),
            (None, Ok(())) => Ok(()),
        }
    }
}
