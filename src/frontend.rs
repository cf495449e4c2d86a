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
use std::sync::Arc;

pub mod args;
mod simulator;

/// How often `read_async` aims to invoke its callback, in seconds of wall
/// time.
pub const CALLBACK_PERIOD_SECS: f64 = 0.06;

/// Errors crossing the front-end boundary. The human-readable detail rides
/// along in the variant instead of living in per-device side storage.
#[derive(Debug, thiserror::Error)]
pub enum FrontendError {
    #[error("front-end parameters are wrong: {0}")]
    ParametersWrong(String),
    #[error("cannot open the capture device: {0}")]
    CannotOpenDevice(String),
    #[error("front-end fault: {0}")]
    Fault(String),
    #[error("front end is missing a required capability: {0}")]
    Incompatible(String),
}

/// A radio front end delivering baseband I/Q samples. Each implementation is
/// an opaque handle carrying its own state.
pub trait Frontend: fmt::Display + Send + Sync {
    /// Applies a whitespace-tokenized option string (see
    /// [args::TunerArgs]).
    fn init(&self, options: &str) -> Result<(), FrontendError>;

    /// Requests a sample rate and returns the rate actually in effect. The
    /// request is ignored while streaming is active.
    fn set_sample_rate(&self, rate: u32) -> u32;

    /// The sample rate currently in effect.
    fn sample_rate(&self) -> u32;

    /// Tunes to the given center frequency in Hz.
    fn set_center_freq(&self, freq: u32) -> Result<(), FrontendError>;

    /// Sets the gain as a normalized value in [0, 1]; the implementation
    /// maps it onto the device range.
    fn set_gain(&self, gain: f32) -> Result<(), FrontendError>;

    /// Streams until [Frontend::stop] is called, invoking `callback`
    /// roughly every [CALLBACK_PERIOD_SECS] with a batch of interleaved I/Q
    /// floats and a dropped-sample count. A non-zero count with an empty
    /// batch means the batch was aborted because too much was lost.
    fn read_async(&self, callback: &mut dyn FnMut(&[f32], u64)) -> Result<(), FrontendError>;

    /// Makes `read_async` return after its current batch.
    fn stop(&self);
}

/// Gets a front end with the given name.
pub fn get_frontend(name: &str) -> Result<Arc<dyn Frontend>, FrontendError> {
    if name.starts_with("simulator") {
        return Ok(Arc::new(simulator::Simulator::get(name)));
    }

    Err(FrontendError::Incompatible(format!(
        "no front end named {}",
        name
    )))
}

/// Lists the front ends built into this binary.
pub fn list_frontends() -> Vec<Arc<dyn Frontend>> {
    vec![Arc::new(simulator::Simulator::get("simulator"))]
}

#[cfg(test)]
pub mod test {
    // Reexport the simulator directly for testing.
    pub use super::simulator::Simulator;
}
