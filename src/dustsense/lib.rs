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

//! Record the concentration of dust particles in the air over time.
//!
//! ## Features
//!
//! Dustsense reads the output of an optical dust sensor like the Shinyei PPD42
//! connected to a GPIO pin of a Raspberry PI. The sensor pulls its output low
//! while it detects particles. The fraction of each window (30 seconds by default)
//! that the output was low is converted into a particle concentration using a
//! polynomial fit of the manufacturer's calibration curve, and appended to a
//! CSV log like the one below.
//!
//! ```text
//! timestamp,particlesDetectedDuration,sampleDuration,concentration
//! 11000,15,30,129
//! 11030,5,30,100
//! ```
//!
//! Optionally, a scatter plot of the log is rendered as an HTML page and the log
//! and plot are committed and pushed to a git remote (eg GitHub) periodically.
//!
//! The following metrics are exported on port `9782` at `/metrics`:
//!
//! * `dustsense_concentration` - Estimated concentration of the last window.
//! * `dustsense_detected_ratio` - Fraction of the last window particles were detected.
//! * `dustsense_last_window_timestamp` - UNIX timestamp of the start of the last window.
//! * `dustsense_windows_total` - Total number of windows recorded.
//! * `dustsense_samples_total` - Total number of reads of the sensor pin.
//! * `dustsense_sample_channel_full_total` - Total times the sampler waited on the aggregator.
//! * `dustsense_publishes_total` - Total number of successful publishes.
//! * `dustsense_errors_total` - Total errors by type.
//!
//! ## Calibration
//!
//! Two calibrations are available, selected with `--calibration`. Both take the
//! ratio of the window particles were detected (0 to 1).
//!
//! * `shinyei` (default) - `1.1p³ - 3.8p² + 520p + 0.62` with `p` the ratio as a
//!   percentage. Particles (> 1µm) per 0.01 ft³.
//! * `traced` - `100 * (1004388r³ - 28273r² + 51483r - 5.46)`. Particles (> 1µm)
//!   per ft³.
//!
//! ## Build
//!
//! `dustsense` is a Rust program and must be built from source using a [Rust toolchain](https://rustup.rs/)
//! . Since it's meant to be run on a Raspberry PI, you will also likely need to cross-compile it.
//!
//! ```text
//! rustup target add armv7-unknown-linux-musleabihf
//! cargo build --release --target armv7-unknown-linux-musleabihf
//! ```
//!
//! ## Run
//!
//! In order to read the device `/dev/gpiomem`, `dustsense` must run as `root` or a
//! member of the `gpio` group. To push the log, run it from inside a git working copy
//! with a remote configured.
//!
//! ```text
//! dustsense --bcm-pin 2 --log-path data.csv --publish-interval-secs 3600
//! ```
//!

pub mod aggregate;
pub mod config;
pub mod datalog;
pub mod estimate;
pub mod http;
pub mod metrics;
pub mod publish;
pub mod sensor;
