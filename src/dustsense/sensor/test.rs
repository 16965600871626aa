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

#![cfg(test)]

use crate::sensor::core::{Clock, DigitalInput, Level, SensorError, SensorErrorKind};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};

/// DigitalInput implementation that returns a fixed sequence of levels and then
/// fails every read after that, like a sensor that has been unplugged.
pub(crate) struct ScriptedInput {
    levels: Vec<Level>,
    idx: AtomicUsize,
}

impl ScriptedInput {
    pub(crate) fn new(levels: Vec<Level>) -> Self {
        ScriptedInput {
            levels,
            idx: Default::default(),
        }
    }
}

impl DigitalInput for ScriptedInput {
    fn read(&mut self) -> Result<Level, SensorError> {
        let idx = self.idx.fetch_add(1, Ordering::SeqCst);
        self.levels
            .get(idx)
            .copied()
            .ok_or(SensorError::KindMsg(SensorErrorKind::Read, "no more scripted levels"))
    }

    fn pin(&self) -> u8 {
        0
    }
}

/// Clock implementation that returns a fixed sequence of timestamps, repeating the
/// last one once the sequence runs out.
pub(crate) struct ScriptedClock {
    timestamps: Vec<f64>,
    idx: AtomicUsize,
}

impl ScriptedClock {
    pub(crate) fn new(timestamps: Vec<f64>) -> Self {
        ScriptedClock {
            timestamps,
            idx: Default::default(),
        }
    }
}

impl Clock for ScriptedClock {
    fn now(&self) -> f64 {
        let idx = self.idx.fetch_add(1, Ordering::SeqCst);
        self.timestamps
            .get(idx)
            .or_else(|| self.timestamps.last())
            .copied()
            .unwrap_or(0.0)
    }
}

/// Unique path under the system temp directory for a test to create files in.
pub(crate) fn scratch_path(name: &str) -> PathBuf {
    static COUNTER: AtomicUsize = AtomicUsize::new(0);

    let n = COUNTER.fetch_add(1, Ordering::SeqCst);
    std::env::temp_dir()
        .join(format!("dustsense-test-{}-{}", std::process::id(), n))
        .join(name)
}
