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

use clap::{crate_version, Parser};
use crossbeam_channel::bounded;
use dustsense::aggregate::{self, Aggregator, AggregatorConfig};
use dustsense::config::ConfigError;
use dustsense::datalog::LogWriter;
use dustsense::estimate::Calibration;
use dustsense::http::{http_route, RequestContext};
use dustsense::metrics::{DustMetrics, MetricsExposition};
use dustsense::publish::{self, PlotAndPush, PlotRenderer};
use dustsense::sensor::{self, open_pin, Sampler, SamplerConfig, SystemClock};
use hyper::service::{make_service_fn, service_fn};
use hyper::Server;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use std::{io, process};
use tokio::signal::unix::{self, SignalKind};
use tokio::task;
use tracing::{Instrument, Level};

const DEFAULT_WINDOW_SECS: f64 = 30.0;
const DEFAULT_POLL_INTERVAL_MS: u64 = 1;
const DEFAULT_CHANNEL_CAPACITY: usize = 4096;
const DEFAULT_LOG_PATH: &str = "data.csv";
const DEFAULT_PLOT_PATH: &str = "index.html";
const DEFAULT_PLOT_TITLE: &str = "Concentration of airborne particulate";
const DEFAULT_COMMIT_MESSAGE: &str = "update data";
const DEFAULT_LOG_LEVEL: Level = Level::INFO;
const DEFAULT_BIND_ADDR: ([u8; 4], u16) = ([0, 0, 0, 0], 9782);

/// Record dust particle concentration from an optical sensor on a GPIO pin
///
/// Poll the output of a dust sensor (like the Shinyei PPD42) connected to a data
/// pin of a local machine, usually a Raspberry PI. The fraction of each window
/// that the sensor detected particles is converted into a concentration and
/// appended to a CSV log. The log can be plotted and pushed to a git remote
/// periodically.
///
/// The sensor must be connected to one of the General Purpose IO pins (GPIO). The
/// numbering of these pins (and how the pin number is provided to dustsense) is
/// based on the Broadcom SOC channel.
#[derive(Debug, Parser)]
#[clap(name = "dustsense", version = crate_version!())]
struct DustSenseApplication {
    /// BCM GPIO pin number the sensor output line is connected to
    #[clap(long)]
    bcm_pin: u8,

    /// Level of the sensor output while particles are detected, 'low' or 'high'
    #[clap(long, default_value_t = sensor::Level::Low)]
    detected_level: sensor::Level,

    /// Length of each window, in seconds. One row is written to the log per window.
    #[clap(long, default_value_t = DEFAULT_WINDOW_SECS)]
    window_secs: f64,

    /// Read the sensor pin at this interval, in milliseconds. Durations measured are
    /// accurate to about this interval.
    #[clap(long, default_value_t = DEFAULT_POLL_INTERVAL_MS)]
    poll_interval_ms: u64,

    /// Number of samples that can be waiting for the aggregator before the sampler
    /// blocks
    #[clap(long, default_value_t = DEFAULT_CHANNEL_CAPACITY)]
    channel_capacity: usize,

    /// Calibration used to convert the ratio of time particles were detected into a
    /// concentration, 'shinyei' or 'traced'
    #[clap(long, default_value_t = Calibration::Shinyei)]
    calibration: Calibration,

    /// Path of the CSV log, created with a header if it doesn't exist
    #[clap(long, default_value = DEFAULT_LOG_PATH)]
    log_path: PathBuf,

    /// Path of the HTML page the plot of the log is written to
    #[clap(long, default_value = DEFAULT_PLOT_PATH)]
    plot_path: PathBuf,

    /// Title of the plot of the log
    #[clap(long, default_value = DEFAULT_PLOT_TITLE)]
    plot_title: String,

    /// Render the plot and push the log and plot to the git remote at this interval,
    /// in seconds. Nothing is published if not set.
    #[clap(long)]
    publish_interval_secs: Option<u64>,

    /// Only render the plot when publishing, don't commit or push
    #[clap(long)]
    no_push: bool,

    /// Logging verbosity. Allowed values are 'trace', 'debug', 'info', 'warn', and 'error'
    /// (case insensitive)
    #[clap(long, default_value_t = DEFAULT_LOG_LEVEL)]
    log_level: Level,

    /// Address to bind to for exposing Prometheus metrics.
    #[clap(long, default_value_t = DEFAULT_BIND_ADDR.into())]
    bind: SocketAddr,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let opts = DustSenseApplication::parse();
    tracing::subscriber::set_global_default(
        tracing_subscriber::FmtSubscriber::builder()
            .with_max_level(opts.log_level)
            .finish(),
    )
    .expect("failed to set tracing subscriber");

    let startup = Instant::now();
    let sampler_config = SamplerConfig::new(Duration::from_millis(opts.poll_interval_ms)).unwrap_or_else(|e| {
        tracing::error!(message = "invalid sampler configuration", error = %e);
        process::exit(1)
    });

    let aggregator_config = AggregatorConfig::new(opts.window_secs, opts.detected_level, opts.calibration)
        .unwrap_or_else(|e| {
            tracing::error!(message = "invalid aggregator configuration", error = %e);
            process::exit(1)
        });

    if opts.channel_capacity == 0 {
        tracing::error!(message = "invalid sampler configuration", error = %ConfigError::ChannelCapacity);
        process::exit(1)
    }

    let publish_period = opts.publish_interval_secs.map(|secs| {
        if secs == 0 {
            tracing::error!(message = "invalid publisher configuration", error = %ConfigError::PublishInterval);
            process::exit(1)
        }

        Duration::from_secs(secs)
    });

    let pin = open_pin(opts.bcm_pin).unwrap_or_else(|e| {
        tracing::error!(message = "failed to initialize sensor pin", bcm_pin = opts.bcm_pin, error = %e);
        process::exit(1)
    });

    let mut writer = LogWriter::open(&opts.log_path).unwrap_or_else(|e| {
        tracing::error!(message = "failed to open log", path = %opts.log_path.display(), error = %e);
        process::exit(1)
    });

    let reg = prometheus::default_registry().clone();
    let metrics = DustMetrics::new(&reg).unwrap_or_else(|e| {
        tracing::error!(message = "failed to register metrics", error = %e);
        process::exit(1)
    });

    let (sender, receiver) = bounded(opts.channel_capacity);
    let sampler = Sampler::new(pin, SystemClock::new(), sampler_config, metrics.clone());
    let sampler_handle = thread::Builder::new()
        .name("sampler".to_owned())
        .spawn(move || sampler.run(sender))?;

    let aggregator = Aggregator::new(aggregator_config);
    let aggregator_metrics = metrics.clone();
    let aggregator_handle = thread::Builder::new()
        .name("aggregator".to_owned())
        .spawn(move || aggregate::run(aggregator, receiver, &mut writer, &aggregator_metrics))?;

    // Both threads run until the sensor can't be read or the log can't be written.
    let pipeline = task::spawn_blocking(move || {
        if sampler_handle.join().is_err() {
            tracing::error!("sampler thread panicked");
        }

        if aggregator_handle.join().is_err() {
            tracing::error!("aggregator thread panicked");
        }
    });

    if let Some(period) = publish_period {
        let plot = PlotRenderer::new(&opts.plot_path, &opts.plot_title, opts.calibration.units());
        let publisher = Arc::new(PlotAndPush::new(plot, DEFAULT_COMMIT_MESSAGE, !opts.no_push));

        task::spawn(
            publish::run_periodic(publisher, opts.log_path.clone(), period, metrics.clone())
                .instrument(tracing::span!(Level::DEBUG, "publisher")),
        );
    }

    let exposition = MetricsExposition::new(reg);
    let context = Arc::new(RequestContext::new(exposition));
    let service = make_service_fn(move |_| {
        let context = context.clone();

        async move {
            Ok::<_, hyper::Error>(service_fn(move |req| {
                http_route(req, context.clone()).instrument(tracing::span!(Level::DEBUG, "dustsense_request"))
            }))
        }
    });

    let server = Server::try_bind(&opts.bind).unwrap_or_else(|e| {
        tracing::error!(message = "server failed to start", address = %opts.bind, error = %e);
        process::exit(1)
    });

    tracing::info!(
        message = "started sampling",
        address = %opts.bind,
        bcm_pin = opts.bcm_pin,
        window_secs = opts.window_secs,
        calibration = %opts.calibration,
        log_path = %opts.log_path.display(),
    );

    tokio::select! {
        res = server.serve(service) => res?,
        _ = sigterm() => {}
        _ = sigint() => {}
        _ = pipeline => {
            tracing::error!(message = "sampling stopped", runtime_secs = %startup.elapsed().as_secs());
            process::exit(1)
        }
    }

    tracing::info!(message = "shutdown", runtime_secs = %startup.elapsed().as_secs());
    Ok(())
}

/// Return after the first SIGTERM signal received by this process
async fn sigterm() -> io::Result<()> {
    unix::signal(SignalKind::terminate())?.recv().await;
    Ok(())
}

/// Return after the first SIGINT signal received by this process
async fn sigint() -> io::Result<()> {
    tokio::signal::ctrl_c().await
}
