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

/// Scalar values the pipeline reports to its host.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValueId {
    /// Smoothed auto-gain minimum (a) and maximum (b).
    AutoGainLevels,
    /// Estimated signal-to-noise ratio (a).
    SignalToNoise,
    /// Number of auto-correlation windows accumulated so far (b).
    AutocorrFrames,
    /// The auto-correlation accumulators were reset.
    AutocorrReset,
    /// An auto-correlation CSV dump finished.
    AutocorrDumped,
}

/// Plots the frame-rate detector publishes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlotId {
    /// Auto-correlation magnitudes over the frame-length candidate window.
    Frame,
    /// Auto-correlation magnitudes over the line-length candidate window.
    Line,
}

/// Narrow notification interface the core pushes host-visible events
/// through. Implementations must be cheap and non-blocking; they are called
/// from real-time threads.
pub trait EventSink: Send + Sync {
    fn value_changed(&self, id: ValueId, a: f64, b: f64);
    fn plot_ready(&self, id: PlotId, data: &[f64], offset: usize, samplerate: u32);
}

/// Discards every notification.
pub struct NullSink;

impl EventSink for NullSink {
    fn value_changed(&self, _: ValueId, _: f64, _: f64) {}
    fn plot_ready(&self, _: PlotId, _: &[f64], _: usize, _: u32) {}
}

/// Forwards notifications to the tracing subscriber, for headless runs
/// without a UI listening.
pub struct TracingSink;

impl EventSink for TracingSink {
    fn value_changed(&self, id: ValueId, a: f64, b: f64) {
        tracing::debug!(id = format!("{:?}", id), a = a, b = b, "Value changed.");
    }

    fn plot_ready(&self, id: PlotId, data: &[f64], offset: usize, samplerate: u32) {
        tracing::debug!(
            id = format!("{:?}", id),
            points = data.len(),
            offset = offset,
            samplerate = samplerate,
            "Plot ready."
        );
    }
}

/// One reconstructed image leaving the pipeline.
#[derive(Clone)]
pub struct VideoFrame {
    pub width: usize,
    pub height: usize,
    /// Row-major normalized pixel values.
    pub pixels: Vec<f32>,
}
