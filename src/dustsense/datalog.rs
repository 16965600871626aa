// Dustsense - Dust particle concentration logger
//
// Copyright 2022 Nick Pillitteri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.
//

//! Append-only CSV log of aggregate records.
//!
//! ```text
//! timestamp,particlesDetectedDuration,sampleDuration,concentration
//! 11000,15,30,129
//! 11030,5,30,100
//! ```
//!
//! * `timestamp` - UNIX timestamp of the START of the window.
//! * `particlesDetectedDuration` - Seconds during the window that particles were detected.
//! * `sampleDuration` - Seconds the window actually lasted.
//! * `concentration` - Estimated particle concentration for the window.

use crate::aggregate::{AggregateRecord, ParseRecordError};
use std::error::Error;
use std::fmt::{self, Formatter};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

pub const HEADER: &str = "timestamp,particlesDetectedDuration,sampleDuration,concentration";

/// Potential kinds of errors that can be encountered writing or reading the log
#[derive(PartialEq, Eq, Debug, Hash, Clone, Copy)]
pub enum LogErrorKind {
    Io,
    Header,
    Parse,
}

impl LogErrorKind {
    pub fn as_label(&self) -> &'static str {
        match self {
            LogErrorKind::Io => "log_io",
            LogErrorKind::Header => "log_header",
            LogErrorKind::Parse => "log_parse",
        }
    }
}

/// Error writing records to or reading records from the log
#[derive(Debug)]
pub enum LogError {
    Io(&'static str, io::Error),
    Header(String),
    Parse(usize, ParseRecordError),
}

impl LogError {
    pub fn kind(&self) -> LogErrorKind {
        match self {
            LogError::Io(_, _) => LogErrorKind::Io,
            LogError::Header(_) => LogErrorKind::Header,
            LogError::Parse(_, _) => LogErrorKind::Parse,
        }
    }
}

impl fmt::Display for LogError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            LogError::Io(msg, ref e) => write!(f, "{}: {}", msg, e),
            LogError::Header(got) => write!(f, "unexpected log header: '{}'", got),
            LogError::Parse(line, ref e) => write!(f, "invalid row on line {}: {}", line, e),
        }
    }
}

impl Error for LogError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            LogError::Io(_, ref e) => Some(e),
            LogError::Parse(_, ref e) => Some(e),
            _ => None,
        }
    }
}

/// Appends one CSV row per record to the log file.
#[derive(Debug)]
pub struct LogWriter {
    path: PathBuf,
    file: File,
}

impl LogWriter {
    /// Open the log for appending, creating it (and any missing parent directories)
    /// with the header row if it doesn't exist or is empty. If an existing log doesn't
    /// end with a newline one is added so the next row starts on its own line.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, LogError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| LogError::Io("unable to create log directory", e))?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)
            .map_err(|e| LogError::Io("unable to open log", e))?;

        let len = file
            .metadata()
            .map_err(|e| LogError::Io("unable to read log metadata", e))?
            .len();

        if len == 0 {
            tracing::info!(message = "creating log", path = %path.display());
            file.write_all(format!("{}\n", HEADER).as_bytes())
                .and_then(|_| file.flush())
                .map_err(|e| LogError::Io("unable to write log header", e))?;
        } else if !ends_with_newline(&mut file).map_err(|e| LogError::Io("unable to read end of log", e))? {
            tracing::warn!(message = "terminating unfinished last line of log", path = %path.display());
            file.write_all(b"\n")
                .and_then(|_| file.flush())
                .map_err(|e| LogError::Io("unable to terminate last line of log", e))?;
        }

        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a single record.
    ///
    /// The whole row including the newline is written with one call on a file
    /// opened in append mode, so a concurrent reader sees either the complete row
    /// or none of it.
    pub fn append(&mut self, record: &AggregateRecord) -> Result<(), LogError> {
        let line = format!("{}\n", record);
        self.file
            .write_all(line.as_bytes())
            .and_then(|_| self.file.flush())
            .map_err(|e| LogError::Io("unable to append to log", e))
    }
}

fn ends_with_newline(file: &mut File) -> io::Result<bool> {
    let mut last = [0u8; 1];
    file.seek(SeekFrom::End(-1))?;
    file.read_exact(&mut last)?;
    Ok(last[0] == b'\n')
}

#[cfg(test)]
impl LogWriter {
    /// Writer whose file handle can't be written to, so every append fails.
    pub(crate) fn read_only<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).unwrap();
        Self { path, file }
    }
}

/// Read every record from the log.
///
/// A final line without a newline is assumed to be an append still in progress
/// and is skipped. A missing file is an error, an empty one has no records.
pub fn read_log<P: AsRef<Path>>(path: P) -> Result<Vec<AggregateRecord>, LogError> {
    let contents = fs::read_to_string(path.as_ref()).map_err(|e| LogError::Io("unable to read log", e))?;
    let complete = match contents.rfind('\n') {
        Some(i) => &contents[..=i],
        None => "",
    };

    let mut lines = complete.lines();
    match lines.next().map(|l| l.trim_end_matches('\r')) {
        None => return Ok(Vec::new()),
        Some(HEADER) => {}
        Some(other) => return Err(LogError::Header(other.to_owned())),
    }

    lines
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        // line numbers are 1-based and the header is line 1
        .map(|(i, line)| line.parse::<AggregateRecord>().map_err(|e| LogError::Parse(i + 2, e)))
        .collect()
}
