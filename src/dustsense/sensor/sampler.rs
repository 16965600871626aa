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
use crate::metrics::DustMetrics;
use crate::sensor::core::{Clock, DigitalInput, Level, SensorError};
use crossbeam_channel::{Sender, TrySendError};
use std::fmt::{Debug, Formatter};
use std::thread;
use std::time::Duration;

/// Level of the sensor output pin at a point in time, in seconds since the epoch.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Sample {
    pub timestamp: f64,
    pub level: Level,
}

impl Sample {
    pub fn new(timestamp: f64, level: Level) -> Self {
        Self { timestamp, level }
    }
}

/// Settings for how the sensor pin is polled.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct SamplerConfig {
    poll_interval: Duration,
}

impl SamplerConfig {
    /// The pin is read, then the sampler sleeps for `poll_interval`. Each level
    /// transition is observed up to one interval (plus scheduler latency) after
    /// it happens on the wire.
    pub fn new(poll_interval: Duration) -> Result<Self, ConfigError> {
        if poll_interval.is_zero() {
            return Err(ConfigError::PollInterval);
        }

        Ok(Self { poll_interval })
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }
}

/// Polls the dust sensor pin at a fixed interval and sends a timestamped sample
/// for every read to a channel.
pub struct Sampler<C: Clock> {
    input: Box<dyn DigitalInput + Send + 'static>,
    clock: C,
    config: SamplerConfig,
    metrics: DustMetrics,
}

impl<C: Clock> Sampler<C> {
    pub fn new<T>(input: T, clock: C, config: SamplerConfig, metrics: DustMetrics) -> Self
    where
        T: DigitalInput + Send + 'static,
    {
        Self {
            input: Box::new(input),
            clock,
            config,
            metrics,
        }
    }

    /// Read the pin until it fails or the receiving side of the channel goes away.
    ///
    /// When the channel is full the sampler blocks until the consumer catches up
    /// instead of dropping samples. A failed read is returned to the caller and
    /// ends sampling, there are no retries.
    pub fn run(mut self, sender: Sender<Sample>) -> Result<(), SensorError> {
        let mut throttled = false;

        loop {
            let level = match self.input.read() {
                Ok(level) => level,
                Err(e) => {
                    self.metrics.error(e.kind().as_label());
                    tracing::error!(message = "unable to read sensor pin", pin = self.input.pin(), error = %e);
                    return Err(e);
                }
            };

            let sample = Sample::new(self.clock.now(), level);
            self.metrics.sample_read();
            tracing::trace!(message = "read sensor pin", timestamp = sample.timestamp, level = %sample.level);

            match sender.try_send(sample) {
                Ok(_) => {
                    throttled = false;
                }
                Err(TrySendError::Full(sample)) => {
                    self.metrics.backpressure();
                    if !throttled {
                        tracing::warn!(
                            message = "sample channel full, waiting for consumer",
                            capacity = ?sender.capacity()
                        );
                        throttled = true;
                    }

                    if sender.send(sample).is_err() {
                        tracing::info!("sample consumer stopped, ending sampling");
                        return Ok(());
                    }
                }
                Err(TrySendError::Disconnected(_)) => {
                    tracing::info!("sample consumer stopped, ending sampling");
                    return Ok(());
                }
            }

            thread::sleep(self.config.poll_interval);
        }
    }
}

impl<C: Clock> Debug for Sampler<C> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sampler")
            .field("pin", &self.input.pin())
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::{Sample, Sampler, SamplerConfig};
    use crate::config::ConfigError;
    use crate::metrics::DustMetrics;
    use crate::sensor::core::{Level, SensorErrorKind};
    use crate::sensor::test::{ScriptedClock, ScriptedInput};
    use crossbeam_channel::{bounded, unbounded};
    use prometheus::Registry;
    use std::thread;
    use std::time::Duration;

    fn config() -> SamplerConfig {
        SamplerConfig::new(Duration::from_micros(1)).unwrap()
    }

    #[test]
    fn test_config_zero_interval() {
        assert_eq!(Err(ConfigError::PollInterval), SamplerConfig::new(Duration::ZERO));
    }

    #[test]
    fn test_sampler_sends_every_read() {
        let metrics = DustMetrics::new(&Registry::new()).unwrap();
        let input = ScriptedInput::new(vec![Level::High, Level::Low, Level::Low, Level::High]);
        let clock = ScriptedClock::new(vec![1.0, 2.0, 3.0, 4.0]);
        let (tx, rx) = unbounded();

        let res = Sampler::new(input, clock, config(), metrics.clone()).run(tx);
        let samples: Vec<Sample> = rx.iter().collect();

        // The scripted pin fails once it runs out of levels
        assert_eq!(SensorErrorKind::Read, res.unwrap_err().kind());
        assert_eq!(
            vec![
                Sample::new(1.0, Level::High),
                Sample::new(2.0, Level::Low),
                Sample::new(3.0, Level::Low),
                Sample::new(4.0, Level::High),
            ],
            samples
        );
        assert_eq!(4, metrics.samples_read());
        assert_eq!(1, metrics.errors("read"));
    }

    #[test]
    fn test_sampler_stops_when_consumer_gone() {
        let metrics = DustMetrics::new(&Registry::new()).unwrap();
        let input = ScriptedInput::new(vec![Level::High; 10]);
        let clock = ScriptedClock::new((0..10).map(f64::from).collect());
        let (tx, rx) = bounded(1);
        drop(rx);

        let res = Sampler::new(input, clock, config(), metrics).run(tx);
        assert!(res.is_ok());
    }

    #[test]
    fn test_sampler_blocks_when_channel_full() {
        let metrics = DustMetrics::new(&Registry::new()).unwrap();
        let input = ScriptedInput::new(vec![Level::Low; 8]);
        let clock = ScriptedClock::new((0..8).map(f64::from).collect());
        let (tx, rx) = bounded(2);

        let sampler = Sampler::new(input, clock, config(), metrics.clone());
        let handle = thread::spawn(move || sampler.run(tx));

        // Let the sampler fill the channel before we start draining it
        thread::sleep(Duration::from_millis(50));
        let samples: Vec<Sample> = rx.iter().collect();
        let res = handle.join().unwrap();

        assert!(res.is_err());
        assert_eq!(8, samples.len());
        assert_eq!((0..8).map(f64::from).collect::<Vec<_>>(), samples.iter().map(|s| s.timestamp).collect::<Vec<_>>());
        assert!(metrics.backpressure_events() > 0);
    }
}
