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

use crate::config::ConfigError;
use crate::datalog::{LogError, LogWriter};
use crate::estimate::{Calibration, EstimateError};
use crate::metrics::DustMetrics;
use crate::sensor::{Level, Sample};
use crossbeam_channel::Receiver;
use std::error::Error;
use std::fmt::{self, Formatter};
use std::str::FromStr;

/// Settings for how samples are grouped into windows and turned into a concentration.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct AggregatorConfig {
    window_secs: f64,
    detected_level: Level,
    calibration: Calibration,
}

impl AggregatorConfig {
    pub fn new(window_secs: f64, detected_level: Level, calibration: Calibration) -> Result<Self, ConfigError> {
        if !window_secs.is_finite() || window_secs <= 0.0 {
            return Err(ConfigError::WindowLength(window_secs));
        }

        Ok(Self {
            window_secs,
            detected_level,
            calibration,
        })
    }

    pub fn window_secs(&self) -> f64 {
        self.window_secs
    }

    pub fn detected_level(&self) -> Level {
        self.detected_level
    }

    pub fn calibration(&self) -> Calibration {
        self.calibration
    }
}

/// Summary of a single window: when it started, how long particles were detected
/// during it, how long it actually lasted, and the estimated concentration.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct AggregateRecord {
    pub window_start: f64,
    pub detected_duration: f64,
    pub window_duration: f64,
    pub concentration: i64,
}

impl AggregateRecord {
    pub fn new(window_start: f64, detected_duration: f64, window_duration: f64, concentration: i64) -> Self {
        Self {
            window_start,
            detected_duration,
            window_duration,
            concentration,
        }
    }

    /// Fraction of the window that particles were detected.
    pub fn ratio(&self) -> f64 {
        self.detected_duration / self.window_duration
    }
}

impl fmt::Display for AggregateRecord {
    /// Format the record as a single CSV row without a trailing newline.
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:.3},{:.3},{:.3},{}",
            self.window_start, self.detected_duration, self.window_duration, self.concentration
        )
    }
}

/// Error parsing a single CSV row into an `AggregateRecord`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseRecordError {
    FieldCount(usize),
    Field(&'static str, String),
}

impl fmt::Display for ParseRecordError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ParseRecordError::FieldCount(n) => write!(f, "expected 4 fields, got {}", n),
            ParseRecordError::Field(name, value) => write!(f, "invalid value for {}: '{}'", name, value),
        }
    }
}

impl Error for ParseRecordError {}

impl FromStr for AggregateRecord {
    type Err = ParseRecordError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = s.trim_end_matches('\r').split(',').map(str::trim).collect();
        if fields.len() != 4 {
            return Err(ParseRecordError::FieldCount(fields.len()));
        }

        let float = |name: &'static str, v: &str| {
            v.parse::<f64>()
                .map_err(|_| ParseRecordError::Field(name, v.to_owned()))
        };

        // Older logs wrote the concentration with a fractional part
        let concentration = fields[3]
            .parse::<i64>()
            .or_else(|_| float("concentration", fields[3]).map(|c| c.round() as i64))?;

        Ok(Self {
            window_start: float("timestamp", fields[0])?,
            detected_duration: float("particlesDetectedDuration", fields[1])?,
            window_duration: float("sampleDuration", fields[2])?,
            concentration,
        })
    }
}

#[derive(Copy, Clone, Debug)]
struct Window {
    start: f64,
    detected: f64,
    pulse_start: Option<f64>,
}

impl Window {
    fn new(start: f64, pulse_start: Option<f64>) -> Self {
        Self {
            start,
            detected: 0.0,
            pulse_start,
        }
    }
}

/// Accumulate the time the sensor reports particles across fixed length windows.
///
/// Samples are pushed one at a time in the order they were read. A pulse starts
/// at the first sample at the detected level and ends at the first sample after
/// it at the other level. Once a sample arrives at least `window_secs` after the
/// start of the window, the window is closed and a record is emitted. The next
/// window starts at the timestamp of the sample that closed the previous one.
///
/// A pulse that is still in progress when a window closes is split at that
/// sample: the closing window is credited up to it and the pulse carries on in
/// the new window. The detected duration never exceeds the window duration.
#[derive(Debug)]
pub struct Aggregator {
    config: AggregatorConfig,
    window: Option<Window>,
}

impl Aggregator {
    pub fn new(config: AggregatorConfig) -> Self {
        Self { config, window: None }
    }

    /// Add a sample, returning a record if it closed the current window.
    ///
    /// An error is returned if the window produced a ratio outside of `[0, 1]`,
    /// which can only happen when timestamps go backwards. The window is discarded
    /// in that case and a new one starts at this sample.
    pub fn push(&mut self, sample: Sample) -> Result<Option<AggregateRecord>, EstimateError> {
        let ts = sample.timestamp;
        let window = self.window.get_or_insert_with(|| Window::new(ts, None));

        if sample.level == self.config.detected_level {
            if window.pulse_start.is_none() {
                tracing::trace!(message = "pulse started", timestamp = ts);
                window.pulse_start = Some(ts);
            }
        } else if let Some(start) = window.pulse_start.take() {
            tracing::trace!(message = "pulse ended", timestamp = ts, duration = ts - start);
            window.detected += ts - start;
        }

        let elapsed = ts - window.start;
        if elapsed < self.config.window_secs {
            return Ok(None);
        }

        let start = window.start;
        let mut detected = window.detected;
        let carried = window.pulse_start.map(|pulse| {
            detected += ts - pulse;
            ts
        });

        self.window = Some(Window::new(ts, carried));

        let ratio = detected / elapsed;
        tracing::debug!(
            message = "window closed",
            window_start = start,
            detected_secs = detected,
            window_secs = elapsed,
            ratio = ratio,
            pulse_carried = carried.is_some(),
        );

        let concentration = self.config.calibration.concentration(ratio)?;
        Ok(Some(AggregateRecord::new(
            start,
            detected,
            elapsed,
            concentration.round() as i64,
        )))
    }
}

/// Consume samples from the channel until it disconnects, appending a row to the
/// log for each window.
///
/// Windows with an invalid ratio are logged and skipped. Failing to append to the
/// log ends the loop with an error so that records are never silently dropped.
pub fn run(
    mut aggregator: Aggregator,
    receiver: Receiver<Sample>,
    writer: &mut LogWriter,
    metrics: &DustMetrics,
) -> Result<(), LogError> {
    for sample in receiver.iter() {
        match aggregator.push(sample) {
            Ok(Some(record)) => {
                if let Err(e) = writer.append(&record) {
                    metrics.error(e.kind().as_label());
                    tracing::error!(
                        message = "unable to append record to log",
                        path = %writer.path().display(),
                        error = %e,
                    );
                    return Err(e);
                }

                metrics.window(&record);
                tracing::info!(
                    message = "recorded window",
                    timestamp = record.window_start,
                    detected_secs = record.detected_duration,
                    window_secs = record.window_duration,
                    concentration = record.concentration,
                );
            }
            Ok(None) => {}
            Err(e) => {
                metrics.error(e.as_label());
                tracing::warn!(message = "discarding window with invalid ratio", error = %e);
            }
        }
    }

    tracing::info!("sample channel closed, ending aggregation");
    Ok(())
}
