// Copyright (C) 2026 Michael Wilson <mike@mdwn.dev>
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free Software
// Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use tracing::{info, span, Level};

use super::args::TunerArgs;
use super::{FrontendError, CALLBACK_PERIOD_SECS};

/// Refresh rate of the simulated raster.
const REFRESH_RATE: f64 = 60.0;
/// Lines per simulated frame.
const LINES: f64 = 625.0;
/// Fraction of each line carrying picture rather than blanking.
const ACTIVE_FRACTION: f64 = 0.75;
/// Peak-to-peak amplitude of the additive noise floor.
const NOISE: f32 = 0.1;
/// A "drops" simulator aborts every Nth batch with a dropped-sample report.
const DROP_EVERY_CALLBACKS: u64 = 16;

struct State {
    samplerate: u32,
    frequency: u32,
    gain: f32,
}

/// A front end that synthesizes the emissions of a raster display: bright
/// active-line segments separated by blanking dips, with a noise floor on
/// top. Doubles as the test fixture for the whole pipeline; a name
/// containing "drops" makes it abort a batch periodically the way real
/// hardware does on overflow.
pub struct Simulator {
    name: String,
    state: Mutex<State>,
    is_running: AtomicBool,
    drop_every: u64,
}

impl Simulator {
    /// Gets the given simulator front end.
    pub fn get(name: &str) -> Simulator {
        Simulator {
            name: name.to_string(),
            state: Mutex::new(State {
                samplerate: 25_000_000,
                frequency: 105_000_000,
                gain: 0.5,
            }),
            is_running: AtomicBool::new(false),
            drop_every: if name.contains("drops") {
                DROP_EVERY_CALLBACKS
            } else {
                0
            },
        }
    }

    /// Returns true while a read loop is active.
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::Relaxed)
    }
}

impl super::Frontend for Simulator {
    fn init(&self, options: &str) -> Result<(), FrontendError> {
        let args = TunerArgs::parse(options)?;
        if let Some(rate) = args.rate {
            if !(1.0..=u32::MAX as f64).contains(&rate) {
                return Err(FrontendError::ParametersWrong(format!(
                    "rate out of range: {}",
                    rate
                )));
            }
            self.set_sample_rate(rate as u32);
        }
        Ok(())
    }

    fn set_sample_rate(&self, rate: u32) -> u32 {
        if self.is_running() {
            return self.sample_rate();
        }

        let mut state = self.state.lock();
        if rate > 0 {
            state.samplerate = rate;
        }
        state.samplerate
    }

    fn sample_rate(&self) -> u32 {
        self.state.lock().samplerate
    }

    fn set_center_freq(&self, freq: u32) -> Result<(), FrontendError> {
        self.state.lock().frequency = freq;
        Ok(())
    }

    fn set_gain(&self, gain: f32) -> Result<(), FrontendError> {
        if !(0.0..=1.0).contains(&gain) {
            return Err(FrontendError::ParametersWrong(format!(
                "gain out of range: {}",
                gain
            )));
        }
        self.state.lock().gain = gain;
        Ok(())
    }

    fn read_async(&self, callback: &mut dyn FnMut(&[f32], u64)) -> Result<(), FrontendError> {
        let read_span = span!(Level::INFO, "simulator read");
        let _enter = read_span.enter();

        self.is_running.store(true, Ordering::Relaxed);
        info!(
            frontend = self.name,
            frequency = self.state.lock().frequency,
            "Streaming started."
        );

        let mut rng = rand::thread_rng();
        let mut buffer: Vec<f32> = Vec::new();
        let mut position: u64 = 0;
        let mut callbacks: u64 = 0;

        while self.is_running() {
            let (rate, gain) = {
                let state = self.state.lock();
                (state.samplerate, state.gain)
            };
            let samples = (CALLBACK_PERIOD_SECS * rate as f64) as usize;
            let samples_per_line = rate as f64 / (REFRESH_RATE * LINES);

            buffer.clear();
            buffer.reserve(samples * 2);
            for n in 0..samples {
                let line_phase = ((position + n as u64) as f64 / samples_per_line).fract();
                let level: f32 = if line_phase < ACTIVE_FRACTION { 0.8 } else { 0.05 };
                let level = level * gain;
                buffer.push(level + NOISE * (rng.gen::<f32>() - 0.5));
                buffer.push(NOISE * (rng.gen::<f32>() - 0.5));
            }
            position += samples as u64;
            callbacks += 1;

            if self.drop_every != 0 && callbacks % self.drop_every == 0 {
                // Real hardware reports the total sample loss, current
                // batch included, and delivers nothing.
                position += samples as u64;
                callback(&[], samples as u64);
            } else {
                callback(&buffer, 0);
            }

            thread::sleep(Duration::from_secs_f64(CALLBACK_PERIOD_SECS));
        }

        info!(frontend = self.name, "Streaming stopped.");
        Ok(())
    }

    fn stop(&self) {
        self.is_running.store(false, Ordering::Relaxed);
    }
}

impl fmt::Display for Simulator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (Simulated raster)", self.name)
    }
}
