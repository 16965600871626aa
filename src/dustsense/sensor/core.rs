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

use std::error::Error;
use std::fmt::{self, Formatter};
use std::str::FromStr;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use rppal::gpio::{self, Gpio, InputPin};

/// Digital level of the sensor output pin
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Level {
    Low,
    High,
}

impl From<gpio::Level> for Level {
    fn from(v: gpio::Level) -> Self {
        match v {
            gpio::Level::Low => Level::Low,
            gpio::Level::High => Level::High,
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Level::Low => "low".fmt(f),
            Level::High => "high".fmt(f),
        }
    }
}

impl FromStr for Level {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" | "0" => Ok(Level::Low),
            "high" | "1" => Ok(Level::High),
            _ => Err(format!("invalid level '{}', expected 'low' or 'high'", s)),
        }
    }
}

/// Potential kinds of errors that can be encountered reading from the dust sensor
#[derive(PartialEq, Eq, Debug, Hash, Clone, Copy)]
pub enum SensorErrorKind {
    Initialization,
    Read,
}

impl SensorErrorKind {
    pub fn as_label(&self) -> &'static str {
        match self {
            SensorErrorKind::Initialization => "initialization",
            SensorErrorKind::Read => "read",
        }
    }
}

/// Error initializing or reading the dust sensor via a GPIO pin
#[derive(Debug)]
pub enum SensorError {
    KindMsg(SensorErrorKind, &'static str),
    KindMsgCause(SensorErrorKind, &'static str, Box<dyn Error + Send + Sync>),
}

impl SensorError {
    pub fn kind(&self) -> SensorErrorKind {
        match self {
            SensorError::KindMsg(kind, _) => *kind,
            SensorError::KindMsgCause(kind, _, _) => *kind,
        }
    }
}

impl fmt::Display for SensorError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            SensorError::KindMsg(_, msg) => msg.fmt(f),
            SensorError::KindMsgCause(_, msg, ref e) => write!(f, "{}: {}", msg, e),
        }
    }
}

impl Error for SensorError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            SensorError::KindMsgCause(_, _, ref e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

/// Create a new `InputPin` based on the BCM GPIO pin number of the output wire
/// of the dust sensor.
///
/// Note that the BCM GPIO pin number is NOT the same as the physical pin number.
/// See [pinout] for more information.
///
/// [pinout]: https://www.raspberrypi.com/documentation/computers/os.html#gpio-and-the-40-pin-header
pub fn open_pin(bcm_gpio_pin: u8) -> Result<InputPin, SensorError> {
    let controller = Gpio::new().map_err(|e| {
        SensorError::KindMsgCause(
            SensorErrorKind::Initialization,
            "unable to create GPIO controller",
            Box::new(e),
        )
    })?;

    let pin = controller.get(bcm_gpio_pin).map_err(|e| {
        SensorError::KindMsgCause(
            SensorErrorKind::Initialization,
            "unable to acquire pin from controller",
            Box::new(e),
        )
    })?;

    Ok(pin.into_input())
}

/// Abstraction around an `rppal::gpio::InputPin` to allow for easier testing.
pub trait DigitalInput {
    fn read(&mut self) -> Result<Level, SensorError>;
    fn pin(&self) -> u8;
}

impl DigitalInput for InputPin {
    fn read(&mut self) -> Result<Level, SensorError> {
        Ok(InputPin::read(self).into())
    }

    fn pin(&self) -> u8 {
        InputPin::pin(self)
    }
}

/// Source of sample timestamps, in seconds since the UNIX epoch.
pub trait Clock {
    fn now(&self) -> f64;
}

/// Clock that reads the wall clock once and then advances with a monotonic clock.
///
/// Timestamps produced by this clock never go backwards, even if the system time
/// is adjusted while sampling. This matters because pulse and window durations
/// are computed by subtracting timestamps.
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    epoch_secs: f64,
    anchor: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        let anchor = Instant::now();
        let epoch_secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);

        Self { epoch_secs, anchor }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> f64 {
        self.epoch_secs + self.anchor.elapsed().as_secs_f64()
    }
}

#[cfg(test)]
mod test {
    use super::{Clock, Level, SystemClock};

    #[test]
    fn test_level_from_str() {
        assert_eq!(Ok(Level::Low), "low".parse());
        assert_eq!(Ok(Level::Low), "LOW".parse());
        assert_eq!(Ok(Level::High), "1".parse());
        assert!("sideways".parse::<Level>().is_err());
    }

    #[test]
    fn test_level_display_round_trip() {
        for level in [Level::Low, Level::High] {
            assert_eq!(Ok(level), level.to_string().parse());
        }
    }

    #[test]
    fn test_system_clock_non_decreasing() {
        let clock = SystemClock::new();
        let first = clock.now();
        let second = clock.now();

        assert!(first > 1_600_000_000.0);
        assert!(second >= first);
    }
}
