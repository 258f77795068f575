//! Line-bounded rotating log sink.
//!
//! [`RotatingSink`] appends one record per call to the current log file and
//! switches to a freshly named file once the configured number of lines has
//! been written. Files are never reused, overwritten or deleted.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use thiserror::Error;
use tracing::{info, warn};

/// Severity prefix of every record.
const RECORD_PREFIX: &str = "INFO: ";

/// Timestamp layout inside a record.
const RECORD_TIMESTAMP_FORMAT: &str = "%Y/%m/%d %H:%M:%S";

/// Timestamp layout inside a file name.
const FILE_TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Upper bound on same-second suffixes tried before giving up on a file name.
const MAX_NAME_ATTEMPTS: u32 = 10_000;

/// Errors raised by the rotating sink.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("failed to create log dir {}", .path.display())]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to open log file {}", .path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to write log file {}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("log sink is closed")]
    Closed,
}

/// Settings for a [`RotatingSink`].
#[derive(Debug, Clone, PartialEq)]
pub struct SinkConfig {
    /// Directory holding the log files, created if absent
    pub dir: PathBuf,

    /// File name prefix
    pub prefix: String,

    /// Number of records per file before rotating
    pub max_lines: usize,
}

impl SinkConfig {
    pub fn new(dir: impl Into<PathBuf>, prefix: impl Into<String>, max_lines: usize) -> Self {
        Self {
            dir: dir.into(),
            prefix: prefix.into(),
            max_lines,
        }
    }
}

/// Append-only text log that rotates to a new file every `max_lines` records.
///
/// Construction opens the first file. Rotation happens lazily: once the line
/// counter has reached the threshold, the next [`write`](Self::write) closes
/// the current file and opens a new one before writing. After
/// [`close`](Self::close) the sink rejects further writes.
#[derive(Debug)]
pub struct RotatingSink {
    config: SinkConfig,
    file: Option<File>,
    path: PathBuf,
    line_count: usize,
    files_opened: usize,
    closed: bool,
}

impl RotatingSink {
    /// Create the log directory if needed and open the first log file.
    ///
    /// A `max_lines` of zero is treated as one.
    pub fn open(mut config: SinkConfig) -> Result<Self, SinkError> {
        config.max_lines = config.max_lines.max(1);

        fs::create_dir_all(&config.dir).map_err(|source| SinkError::CreateDir {
            path: config.dir.clone(),
            source,
        })?;

        let (path, file) = open_log_file(&config.dir, &config.prefix, Local::now())?;
        info!(
            path = %path.display(),
            max_lines = config.max_lines,
            "Log sink opened"
        );

        Ok(Self {
            config,
            file: Some(file),
            path,
            line_count: 0,
            files_opened: 1,
            closed: false,
        })
    }

    /// Append one record to the current file, rotating first if the current
    /// file is full.
    pub fn write(&mut self, line: &str) -> Result<(), SinkError> {
        if self.closed {
            return Err(SinkError::Closed);
        }

        if self.file.is_none() || self.line_count >= self.config.max_lines {
            self.rotate()?;
        }

        let record = format_record(Local::now(), line);
        let file = self.file.as_mut().ok_or(SinkError::Closed)?;
        file.write_all(record.as_bytes())
            .map_err(|source| SinkError::Write {
                path: self.path.clone(),
                source,
            })?;

        self.line_count += 1;
        Ok(())
    }

    /// Flush and release the current file. Safe to call repeatedly.
    pub fn close(&mut self) -> Result<(), SinkError> {
        self.closed = true;

        match self.file.take() {
            Some(mut file) => file.flush().map_err(|source| SinkError::Write {
                path: self.path.clone(),
                source,
            }),
            None => Ok(()),
        }
    }

    /// Path of the file currently (or most recently) written.
    pub fn current_path(&self) -> &Path {
        &self.path
    }

    /// Records written to the current file.
    pub fn line_count(&self) -> usize {
        self.line_count
    }

    /// Number of files opened over the sink's lifetime.
    pub fn files_opened(&self) -> usize {
        self.files_opened
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn rotate(&mut self) -> Result<(), SinkError> {
        if let Some(mut file) = self.file.take() {
            if let Err(e) = file.flush() {
                warn!(path = %self.path.display(), error = %e, "Failed to flush log file before rotation");
            }
        }

        let (path, file) = open_log_file(&self.config.dir, &self.config.prefix, Local::now())?;
        info!(
            previous = %self.path.display(),
            path = %path.display(),
            lines = self.line_count,
            "Rotated log file"
        );

        self.file = Some(file);
        self.path = path;
        self.line_count = 0;
        self.files_opened += 1;
        Ok(())
    }
}

impl Drop for RotatingSink {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// Build a log file name from its prefix, timestamp and same-second sequence.
///
/// Sequence zero yields `<prefix>_<YYYYMMDD_HHMMSS>.log`; later sequences
/// append `_<seq>` before the extension.
pub fn log_file_name(prefix: &str, timestamp: DateTime<Local>, seq: u32) -> String {
    let stamp = timestamp.format(FILE_TIMESTAMP_FORMAT);
    if seq == 0 {
        format!("{}_{}.log", prefix, stamp)
    } else {
        format!("{}_{}_{}.log", prefix, stamp, seq)
    }
}

fn format_record(timestamp: DateTime<Local>, line: &str) -> String {
    format!(
        "{}{} {}\n",
        RECORD_PREFIX,
        timestamp.format(RECORD_TIMESTAMP_FORMAT),
        line
    )
}

/// Open a new log file for `timestamp`, never touching an existing one.
fn open_log_file(
    dir: &Path,
    prefix: &str,
    timestamp: DateTime<Local>,
) -> Result<(PathBuf, File), SinkError> {
    let mut seq = 0;
    loop {
        let path = dir.join(log_file_name(prefix, timestamp, seq));
        match OpenOptions::new().append(true).create_new(true).open(&path) {
            Ok(file) => return Ok((path, file)),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists && seq < MAX_NAME_ATTEMPTS => {
                seq += 1;
            }
            Err(source) => return Err(SinkError::Open { path, source }),
        }
    }
}
