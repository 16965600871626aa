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

//! Convert the fraction of time particles were detected into a concentration.

use std::error::Error;
use std::fmt::{self, Formatter};
use std::str::FromStr;

/// Error computing a concentration from a low pulse occupancy ratio
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EstimateError {
    OutOfRange(f64),
}

impl EstimateError {
    pub fn as_label(&self) -> &'static str {
        match self {
            EstimateError::OutOfRange(_) => "ratio_range",
        }
    }
}

impl fmt::Display for EstimateError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            EstimateError::OutOfRange(ratio) => write!(f, "ratio {} outside of [0, 1]", ratio),
        }
    }
}

impl Error for EstimateError {}

/// Polynomial fit used to turn a ratio into a particle concentration.
///
/// Both fits are cubic polynomials traced from the manufacturer's plot of low
/// pulse occupancy against concentration. They use different input scales and
/// units so the scaling is done here: callers always pass a ratio in `[0, 1]`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Calibration {
    /// `1.1p³ - 3.8p² + 520p + 0.62` where `p` is the ratio as a percentage (0 to 100).
    /// Particles (> 1µm) per 0.01 cubic feet.
    Shinyei,
    /// `100 * (1004388r³ - 28273r² + 51483r - 5.46)` where `r` is the ratio (0 to 1).
    /// Particles (> 1µm) per cubic foot.
    Traced,
}

impl Calibration {
    /// Estimate the concentration for the given ratio of time particles were detected,
    /// returning an error if the ratio is not in `[0, 1]`.
    pub fn concentration(&self, ratio: f64) -> Result<f64, EstimateError> {
        // also rejects NaN
        if !(0.0..=1.0).contains(&ratio) {
            return Err(EstimateError::OutOfRange(ratio));
        }

        Ok(match self {
            Calibration::Shinyei => {
                let p = ratio * 100.0;
                1.1 * p.powi(3) - 3.8 * p.powi(2) + 520.0 * p + 0.62
            }
            Calibration::Traced => {
                100.0 * (1_004_388.0 * ratio.powi(3) - 28_273.0 * ratio.powi(2) + 51_483.0 * ratio - 5.46)
            }
        })
    }

    pub fn units(&self) -> &'static str {
        match self {
            Calibration::Shinyei => "particles per 0.01 ft³",
            Calibration::Traced => "particles per ft³",
        }
    }
}

impl Default for Calibration {
    fn default() -> Self {
        Calibration::Shinyei
    }
}

impl fmt::Display for Calibration {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Calibration::Shinyei => "shinyei".fmt(f),
            Calibration::Traced => "traced".fmt(f),
        }
    }
}

impl FromStr for Calibration {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "shinyei" => Ok(Calibration::Shinyei),
            "traced" => Ok(Calibration::Traced),
            _ => Err(format!("unknown calibration '{}', expected 'shinyei' or 'traced'", s)),
        }
    }
}

/// Estimate concentration for a ratio using the default calibration.
pub fn concentration(ratio: f64) -> Result<f64, EstimateError> {
    Calibration::default().concentration(ratio)
}

#[cfg(test)]
mod test {
    use super::{concentration, Calibration, EstimateError};

    const CALIBRATIONS: [Calibration; 2] = [Calibration::Shinyei, Calibration::Traced];

    #[test]
    fn test_negative_ratio() {
        assert_eq!(Err(EstimateError::OutOfRange(-0.1)), concentration(-0.1));
    }

    #[test]
    fn test_ratio_above_one() {
        for c in CALIBRATIONS {
            assert!(c.concentration(1.01).is_err());
        }
    }

    #[test]
    fn test_nan_ratio() {
        for c in CALIBRATIONS {
            assert!(c.concentration(f64::NAN).is_err());
        }
    }

    #[test]
    fn test_zero_ratio() {
        assert!((Calibration::Shinyei.concentration(0.0).unwrap() - 0.62).abs() < 1e-9);
        assert!((Calibration::Traced.concentration(0.0).unwrap() - -546.0).abs() < 1e-9);
    }

    #[test]
    fn test_full_ratio() {
        // 1.1 * 100^3 - 3.8 * 100^2 + 520 * 100 + 0.62
        assert!((Calibration::Shinyei.concentration(1.0).unwrap() - 1_114_000.62).abs() < 1e-6);
        // 100 * (1004388 - 28273 + 51483 - 5.46)
        assert!((Calibration::Traced.concentration(1.0).unwrap() - 102_759_254.0).abs() < 1e-3);
    }

    #[test]
    fn test_known_value() {
        // 5% low pulse occupancy
        let c = Calibration::Shinyei.concentration(0.05).unwrap();
        assert!((c - 2643.12).abs() < 1e-6);
    }

    #[test]
    fn test_monotonic_non_decreasing() {
        for c in CALIBRATIONS {
            let mut previous = c.concentration(0.0).unwrap();
            for i in 1..=1000 {
                let current = c.concentration(i as f64 / 1000.0).unwrap();
                assert!(current >= previous, "{} decreased at {}", c, i);
                previous = current;
            }
        }
    }

    #[test]
    fn test_deterministic() {
        for c in CALIBRATIONS {
            assert_eq!(c.concentration(0.37), c.concentration(0.37));
        }
    }

    #[test]
    fn test_calibration_from_str() {
        assert_eq!(Ok(Calibration::Shinyei), "Shinyei".parse());
        assert_eq!(Ok(Calibration::Traced), "traced".parse());
        assert!("linear".parse::<Calibration>().is_err());
    }
}
