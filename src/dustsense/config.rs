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

/// Invalid value for one of the settings of the sampler, aggregator, or publisher
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    WindowLength(f64),
    PollInterval,
    ChannelCapacity,
    PublishInterval,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::WindowLength(secs) => {
                write!(f, "window length must be a positive number of seconds, got {}", secs)
            }
            ConfigError::PollInterval => "polling interval must be greater than zero".fmt(f),
            ConfigError::ChannelCapacity => "channel capacity must be greater than zero".fmt(f),
            ConfigError::PublishInterval => "publish interval must be greater than zero".fmt(f),
        }
    }
}

impl Error for ConfigError {}
