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
use std::sync::Arc;

use crate::events::{EventSink, ValueId};
use crate::sync::{FrameGeometry, SyncDecision, SyncDetector};

/// Auto-gain levels are reported once this many frames have passed since the
/// previous report.
const AUTOGAIN_REPORT_EVERY_FRAMES: u32 = 5;

/// Pixels outside this range are markers injected upstream (cursor overlays
/// and the like) and are excluded from gain estimation when the special
/// pixels mode is on.
const SPECIAL_PIXEL_LIMIT: f32 = 250.0;

/// Exponentially blends `input` into the `screen` accumulator. A
/// `motion_blur` of zero replaces the accumulator outright.
pub fn time_lowpass(motion_blur: f32, input: &[f32], screen: &mut [f32]) {
    let anti = 1.0 - motion_blur;
    for (acc, val) in screen.iter_mut().zip(input.iter()) {
        *acc = *acc * motion_blur + *val * anti;
    }
}

/// Collapses a frame into its column and row sums. The sync detector reads
/// blanking bands off these projections.
pub fn project(width: usize, frame: &[f32], width_profile: &mut [f32], height_profile: &mut [f32]) {
    for slot in width_profile.iter_mut() {
        *slot = 0.0;
    }
    for slot in height_profile.iter_mut() {
        *slot = 0.0;
    }
    for (i, &val) in frame.iter().enumerate() {
        width_profile[i % width] += val;
        height_profile[i / width] += val;
    }
}

/// Contrast normalization with exponentially smoothed endpoints and an SNR
/// estimate as a byproduct.
pub struct AutoGain {
    last_min: f32,
    last_max: f32,
    snr: f64,
}

impl AutoGain {
    pub fn new() -> AutoGain {
        AutoGain {
            last_min: 0.0,
            last_max: 0.0,
            snr: 1.0,
        }
    }

    /// Smoothed endpoints as (min, max).
    pub fn levels(&self) -> (f32, f32) {
        (self.last_min, self.last_max)
    }

    /// Mean over standard deviation of the last processed frame.
    pub fn snr(&self) -> f64 {
        self.snr
    }

    /// Normalizes `input` into `output` mapping the smoothed value range
    /// onto [0, 1]. `norm` is the smoothing factor for the endpoints; with
    /// `special_pixels`, marker values outside the ±250 band pass through
    /// untouched and do not contribute to the range.
    pub fn run(&mut self, input: &[f32], output: &mut [f32], norm: f32, special_pixels: bool) {
        let size = input.len();
        debug_assert!(size > 1);

        let mut min = input[0];
        let mut max = min;
        let mut sum = 0.0f64;
        for &val in input.iter() {
            if special_pixels && !(-SPECIAL_PIXEL_LIMIT..=SPECIAL_PIXEL_LIMIT).contains(&val) {
                continue;
            }
            if val > max {
                max = val;
            } else if val < min {
                min = val;
            }
            sum += val as f64;
        }

        let one_minus_norm = 1.0 - norm;
        self.last_max = one_minus_norm * self.last_max + norm * max;
        self.last_min = one_minus_norm * self.last_min + norm * min;
        let span = if self.last_max == self.last_min {
            1.0
        } else {
            self.last_max - self.last_min
        };

        let mean = sum / size as f64;
        let mut sum2 = 0.0f64;
        let mut sum3 = 0.0f64;
        for (out, &val) in output.iter_mut().zip(input.iter()) {
            *out = if special_pixels && !(-SPECIAL_PIXEL_LIMIT..=SPECIAL_PIXEL_LIMIT).contains(&val)
            {
                val
            } else {
                (val - self.last_min) / span
            };

            let diff = val as f64 - mean;
            sum2 += diff * diff;
            sum3 += diff;
        }

        let stdev = ((sum2 - sum3 * sum3 / size as f64) / (size - 1) as f64).sqrt();
        self.snr = mean / stdev;
    }
}

impl Default for AutoGain {
    fn default() -> Self {
        AutoGain::new()
    }
}

/// Which internal buffer a processing step left the image in.
#[derive(Clone, Copy)]
enum Stage {
    Screen,
    Send,
    Corrected,
}

/// The per-frame processing chain behind the resampler: motion-blur
/// accumulation, sync detection over row/column projections, and auto-gain,
/// in an order chosen by the caller.
pub struct PostProcessor {
    autogain: AutoGain,
    screen: Vec<f32>,
    send: Vec<f32>,
    corrected: Vec<f32>,
    width_profile: Vec<f32>,
    height_profile: Vec<f32>,
    bufsize: usize,
    sizetopoll: usize,
    width: usize,
    height: usize,
    runs: u32,
    lowpass_before_sync: bool,
    special_pixels: bool,
    sync: Box<dyn SyncDetector>,
    sink: Arc<dyn EventSink>,
}

/// Per-frame knobs of the processing chain.
#[derive(Clone, Copy)]
pub struct ProcessParams {
    /// EMA factor for the time-domain low-pass; 0 disables accumulation.
    pub motion_blur: f32,
    /// Smoothing factor for the auto-gain endpoints.
    pub gain_norm: f32,
    /// Run the low-pass before sync detection instead of after.
    pub lowpass_before_sync: bool,
    /// Run auto-gain on the processed frame instead of on the raw input.
    pub autogain_after: bool,
    /// Whether sub-pixel sync interpolation is allowed for this frame.
    pub supersampling_allowed: bool,
}

impl PostProcessor {
    pub fn new(
        sync: Box<dyn SyncDetector>,
        sink: Arc<dyn EventSink>,
        special_pixels: bool,
    ) -> PostProcessor {
        PostProcessor {
            autogain: AutoGain::new(),
            screen: Vec::new(),
            send: Vec::new(),
            corrected: Vec::new(),
            width_profile: Vec::new(),
            height_profile: Vec::new(),
            bufsize: 0,
            sizetopoll: 0,
            width: 0,
            height: 0,
            runs: 0,
            lowpass_before_sync: false,
            special_pixels,
            sync,
            sink,
        }
    }

    /// Smoothed auto-gain endpoints, for hosts polling instead of listening.
    pub fn gain_levels(&self) -> (f32, f32) {
        self.autogain.levels()
    }

    /// Runs the chain over one `width × height` frame and returns the
    /// display buffer together with the sync decision, whose offsets the
    /// caller feeds back into the dropped-sample compensator.
    pub fn process(
        &mut self,
        frame: &[f32],
        width: usize,
        height: usize,
        params: ProcessParams,
    ) -> (&[f32], SyncDecision) {
        debug_assert!(frame.len() >= width * height);

        self.reshape(width, height);

        if self.lowpass_before_sync != params.lowpass_before_sync {
            self.lowpass_before_sync = params.lowpass_before_sync;
            for buffer in [&mut self.screen, &mut self.send, &mut self.corrected] {
                for val in buffer[..self.sizetopoll].iter_mut() {
                    *val = 0.0;
                }
            }
        }

        let sizetopoll = self.sizetopoll;
        let geometry = FrameGeometry { width, height };

        let PostProcessor {
            autogain,
            screen,
            send,
            corrected,
            width_profile,
            height_profile,
            sync,
            special_pixels,
            ..
        } = self;
        let screen = &mut screen[..sizetopoll];
        let send = &mut send[..sizetopoll];
        let corrected = &mut corrected[..sizetopoll];
        let frame = &frame[..sizetopoll];

        let input_in_send = if !params.autogain_after {
            autogain.run(frame, send, params.gain_norm, *special_pixels);
            true
        } else {
            false
        };

        let decision;
        let result = if params.lowpass_before_sync {
            let input: &[f32] = if input_in_send { send } else { frame };
            time_lowpass(params.motion_blur, input, screen);
            project(width, screen, width_profile, height_profile);

            decision = sync.detect(
                screen,
                corrected,
                geometry,
                width_profile,
                height_profile,
                params.supersampling_allowed,
                false,
            );
            let sync_out: &[f32] = if decision.use_corrected { corrected } else { screen };

            if params.autogain_after {
                autogain.run(sync_out, send, params.gain_norm, *special_pixels);
                Stage::Send
            } else if decision.use_corrected {
                Stage::Corrected
            } else {
                Stage::Screen
            }
        } else {
            let input: &[f32] = if input_in_send { send } else { frame };
            project(width, input, width_profile, height_profile);

            decision = sync.detect(
                input,
                corrected,
                geometry,
                width_profile,
                height_profile,
                params.motion_blur == 0.0 && params.supersampling_allowed,
                true,
            );
            let sync_out: &[f32] = if decision.use_corrected { corrected } else { input };
            time_lowpass(params.motion_blur, sync_out, screen);

            if params.autogain_after {
                autogain.run(screen, send, params.gain_norm, *special_pixels);
                Stage::Send
            } else {
                Stage::Screen
            }
        };

        self.runs += 1;
        if self.runs >= AUTOGAIN_REPORT_EVERY_FRAMES {
            self.runs = 0;
            let (min, max) = self.autogain.levels();
            self.sink
                .value_changed(ValueId::AutoGainLevels, min as f64, max as f64);
            self.sink
                .value_changed(ValueId::SignalToNoise, self.autogain.snr(), 0.0);
        }

        let out = match result {
            Stage::Screen => &self.screen[..sizetopoll],
            Stage::Send => &self.send[..sizetopoll],
            Stage::Corrected => &self.corrected[..sizetopoll],
        };
        (out, decision)
    }

    /// Reallocates the image and projection buffers when the frame geometry
    /// changes. The accumulator starts over from zero.
    fn reshape(&mut self, width: usize, height: usize) {
        if width == self.width && height == self.height {
            return;
        }

        let old_width = self.width;
        let old_height = self.height;
        self.width = width;
        self.height = height;
        self.sizetopoll = width * height;
        debug_assert!(self.sizetopoll > 0);

        if self.sizetopoll > self.bufsize {
            self.bufsize = self.sizetopoll;
            self.screen.resize(self.bufsize, 0.0);
            self.send.resize(self.bufsize, 0.0);
            self.corrected.resize(self.bufsize, 0.0);
            for val in self.screen.iter_mut() {
                *val = 0.0;
            }
        }

        if width != old_width {
            self.width_profile.resize(width, 0.0);
        }
        if height != old_height {
            self.height_profile.resize(height, 0.0);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::events::test::RecordingSink;
    use crate::events::NullSink;
    use crate::sync::NoSync;

    #[test]
    fn test_time_lowpass_blends() {
        let mut screen = vec![1.0f32; 4];
        time_lowpass(0.75, &[0.0, 0.0, 2.0, 2.0], &mut screen);
        assert_eq!(vec![0.75, 0.75, 1.25, 1.25], screen);

        // Zero blur replaces the accumulator.
        time_lowpass(0.0, &[5.0, 6.0, 7.0, 8.0], &mut screen);
        assert_eq!(vec![5.0, 6.0, 7.0, 8.0], screen);
    }

    #[test]
    fn test_projections() {
        let frame = [
            1.0, 2.0, 3.0, //
            4.0, 5.0, 6.0,
        ];
        let mut width_profile = vec![9.0; 3];
        let mut height_profile = vec![9.0; 2];
        project(3, &frame, &mut width_profile, &mut height_profile);
        assert_eq!(vec![5.0, 7.0, 9.0], width_profile);
        assert_eq!(vec![6.0, 15.0], height_profile);
    }

    #[test]
    fn test_autogain_maps_range_to_unit_interval() {
        let mut gain = AutoGain::new();
        let input = [2.0f32, 4.0, 6.0, 8.0];
        let mut output = vec![0.0f32; 4];

        // With norm == 1 the endpoints jump straight to the frame extremes.
        gain.run(&input, &mut output, 1.0, false);
        assert_eq!((2.0, 8.0), gain.levels());
        assert_eq!(vec![0.0, 1.0 / 3.0, 2.0 / 3.0, 1.0], output);
        assert!(gain.snr().is_finite());
    }

    #[test]
    fn test_autogain_smooths_endpoints() {
        let mut gain = AutoGain::new();
        let mut output = vec![0.0f32; 4];

        gain.run(&[0.0, 0.0, 10.0, 10.0], &mut output, 0.5, false);
        assert_eq!((0.0, 5.0), gain.levels());
        gain.run(&[0.0, 0.0, 10.0, 10.0], &mut output, 0.5, false);
        assert_eq!((0.0, 7.5), gain.levels());
    }

    #[test]
    fn test_autogain_passes_special_pixels_through() {
        let mut gain = AutoGain::new();
        let input = [0.0f32, 500.0, 10.0, -500.0];
        let mut output = vec![0.0f32; 4];

        gain.run(&input, &mut output, 1.0, true);
        assert_eq!((0.0, 10.0), gain.levels());
        assert_eq!(500.0, output[1]);
        assert_eq!(-500.0, output[3]);
        assert_eq!(0.0, output[0]);
        assert_eq!(1.0, output[2]);
    }

    fn params() -> ProcessParams {
        ProcessParams {
            motion_blur: 0.0,
            gain_norm: 1.0,
            lowpass_before_sync: false,
            autogain_after: true,
            supersampling_allowed: true,
        }
    }

    #[test]
    fn test_process_normalizes_frame() {
        let mut pp = PostProcessor::new(Box::new(NoSync), Arc::new(NullSink), false);
        let frame: Vec<f32> = (0..12).map(|v| v as f32).collect();

        let (out, decision) = pp.process(&frame, 4, 3, params());
        assert_eq!(12, out.len());
        assert!(!decision.use_corrected);
        assert!((out[0] - 0.0).abs() < 1e-6);
        assert!((out[11] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_process_survives_reshape() {
        let mut pp = PostProcessor::new(Box::new(NoSync), Arc::new(NullSink), false);
        let frame: Vec<f32> = (0..12).map(|v| v as f32).collect();
        let (out, _) = pp.process(&frame, 4, 3, params());
        assert_eq!(12, out.len());

        let bigger: Vec<f32> = (0..24).map(|v| v as f32).collect();
        let (out, _) = pp.process(&bigger, 6, 4, params());
        assert_eq!(24, out.len());

        let (out, _) = pp.process(&frame, 4, 3, params());
        assert_eq!(12, out.len());
    }

    #[test]
    fn test_motion_blur_accumulates_across_frames() {
        let mut pp = PostProcessor::new(Box::new(NoSync), Arc::new(NullSink), false);
        let mut p = params();
        p.motion_blur = 0.5;

        // Two checkerboard frames blend in the accumulator: after A, A, B
        // the accumulator is [1, 0.75, 1, 0.75], which auto-gain stretches
        // back to full contrast with the phase of B.
        let a = [0.0f32, 2.0, 0.0, 2.0];
        let b = [2.0f32, 0.0, 2.0, 0.0];
        pp.process(&a, 2, 2, p);
        pp.process(&a, 2, 2, p);
        let (out, _) = pp.process(&b, 2, 2, p);
        for (got, want) in out.iter().zip([1.0f32, 0.0, 1.0, 0.0]) {
            assert!((got - want).abs() < 1e-6, "got {:?}", out);
        }
    }

    #[test]
    fn test_periodic_reporting() {
        let sink = Arc::new(RecordingSink::new());
        let mut pp = PostProcessor::new(Box::new(NoSync), sink.clone(), false);
        let frame: Vec<f32> = (0..4).map(|v| v as f32).collect();

        for _ in 0..5 {
            pp.process(&frame, 2, 2, params());
        }
        assert_eq!(1, sink.values_with(ValueId::AutoGainLevels).len());

        for _ in 0..5 {
            pp.process(&frame, 2, 2, params());
        }
        assert_eq!(2, sink.values_with(ValueId::AutoGainLevels).len());
    }
}
