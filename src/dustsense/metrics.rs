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

use crate::aggregate::AggregateRecord;
use prometheus::{Encoder, Gauge, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};
use std::error::Error;
use std::fmt;
use tokio::task;
use tracing::Instrument;

/// Collection of Prometheus metrics updated by the sampler, aggregator, and publisher.
///
/// Cloning is cheap and all clones update the same underlying metrics.
#[derive(Clone)]
pub struct DustMetrics {
    concentration: Gauge,
    ratio: Gauge,
    last_window: Gauge,
    windows: IntCounter,
    samples: IntCounter,
    backpressure: IntCounter,
    publishes: IntCounter,
    errors: IntCounterVec,
}

impl DustMetrics {
    pub fn new(reg: &Registry) -> Result<Self, prometheus::Error> {
        let concentration = Gauge::new(
            "dustsense_concentration",
            "Estimated particle concentration of the last window",
        )?;
        let ratio = Gauge::new(
            "dustsense_detected_ratio",
            "Fraction of the last window particles were detected (0-1)",
        )?;
        let last_window = Gauge::new(
            "dustsense_last_window_timestamp",
            "Timestamp of the start of the last recorded window",
        )?;
        let windows = IntCounter::new("dustsense_windows_total", "Number of windows recorded")?;
        let samples = IntCounter::new("dustsense_samples_total", "Number of reads of the sensor pin")?;
        let backpressure = IntCounter::new(
            "dustsense_sample_channel_full_total",
            "Number of times the sampler waited on a full sample channel",
        )?;
        let publishes = IntCounter::new("dustsense_publishes_total", "Number of successful publishes")?;
        let errors = IntCounterVec::new(Opts::new("dustsense_errors_total", "Number of errors by type"), &["kind"])?;

        reg.register(Box::new(concentration.clone()))?;
        reg.register(Box::new(ratio.clone()))?;
        reg.register(Box::new(last_window.clone()))?;
        reg.register(Box::new(windows.clone()))?;
        reg.register(Box::new(samples.clone()))?;
        reg.register(Box::new(backpressure.clone()))?;
        reg.register(Box::new(publishes.clone()))?;
        reg.register(Box::new(errors.clone()))?;

        Ok(Self {
            concentration,
            ratio,
            last_window,
            windows,
            samples,
            backpressure,
            publishes,
            errors,
        })
    }

    pub fn window(&self, record: &AggregateRecord) {
        self.windows.inc();
        self.concentration.set(record.concentration as f64);
        self.ratio.set(record.ratio());
        self.last_window.set(record.window_start);
    }

    pub fn sample_read(&self) {
        self.samples.inc();
    }

    pub fn backpressure(&self) {
        self.backpressure.inc();
    }

    pub fn published(&self) {
        self.publishes.inc();
    }

    pub fn error(&self, kind: &str) {
        self.errors.with_label_values(&[kind]).inc();
    }

    pub fn windows(&self) -> u64 {
        self.windows.get()
    }

    pub fn samples_read(&self) -> u64 {
        self.samples.get()
    }

    pub fn backpressure_events(&self) -> u64 {
        self.backpressure.get()
    }

    pub fn publishes(&self) -> u64 {
        self.publishes.get()
    }

    pub fn errors(&self, kind: &str) -> u64 {
        self.errors.with_label_values(&[kind]).get()
    }
}

/// Error exposing Prometheus metrics in the text exposition format.
#[derive(Debug)]
pub enum ExpositionError {
    Runtime(&'static str, Box<dyn Error + Send + Sync + 'static>),
    Encoding(&'static str, Box<dyn Error + Send + Sync + 'static>),
}

impl fmt::Display for ExpositionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExpositionError::Runtime(msg, ref e) => write!(f, "{}: {}", msg, e),
            ExpositionError::Encoding(msg, ref e) => write!(f, "{}: {}", msg, e),
        }
    }
}

impl Error for ExpositionError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ExpositionError::Runtime(_, ref e) => Some(e.as_ref()),
            ExpositionError::Encoding(_, ref e) => Some(e.as_ref()),
        }
    }
}

/// Wrapper that exposes metrics from a Prometheus registry in the text exposition format.
#[derive(Debug)]
pub struct MetricsExposition {
    registry: Registry,
}

impl MetricsExposition {
    pub fn new(registry: Registry) -> Self {
        Self { registry }
    }

    /// Gather all metrics from the registry and encode them in the Prometheus text exposition
    /// format, returning an error if they couldn't be encoded for some reason.
    ///
    /// The process collector reads from `/proc` while gathering so this runs on the blocking
    /// thread pool instead of the request handler.
    pub async fn encoded_text(&self) -> Result<Vec<u8>, ExpositionError> {
        let registry = self.registry.clone();

        task::spawn_blocking(move || {
            let metric_families = registry.gather();
            let mut buffer = Vec::new();

            tracing::debug!(
                message = "encoding metric families to text exposition format",
                num_metrics = metric_families.len(),
            );

            TextEncoder::new()
                .encode(&metric_families, &mut buffer)
                .map_err(|e| ExpositionError::Encoding("unable to encode Prometheus metrics", Box::new(e)))
                .map(|_| buffer)
        })
        .instrument(tracing::span!(tracing::Level::DEBUG, "dustsense_gather"))
        .await
        .map_err(|e| ExpositionError::Runtime("metrics encoding task failed", Box::new(e)))?
    }
}
