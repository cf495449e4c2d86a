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
// Estimates the frame and line rates of the captured raster by
// auto-correlating windows of the raw sample stream on a background thread.
// A periodic signal repeats at the frame period, so the averaged
// auto-correlation magnitude develops peaks at the frame and line lags; the
// host picks candidates off the published plots.
//
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, span, Level};

use crate::buffer::{SampleRing, ScratchBuffer, SIZE_COEFF_HIGH_LATENCY};
use crate::dsp::fft;
use crate::events::{EventSink, PlotId, ValueId};

/// Slowest raster refresh the detector searches for.
pub const MIN_FRAMERATE: u32 = 55;
/// Fastest raster refresh the detector searches for.
pub const MAX_FRAMERATE: u32 = 87;
/// Shortest raster height considered when searching for line peaks.
pub const MIN_HEIGHT: u32 = 590;
/// Tallest raster height considered when searching for line peaks.
pub const MAX_HEIGHT: u32 = 1500;
/// Auto-correlation window, in frames at the slowest supported refresh.
const FRAMES_TO_CAPTURE: f64 = 3.1;

/// How long one blocking read may wait before rechecking the alive flag.
const POLL_TIMEOUT: Duration = Duration::from_secs(1);

/// Accumulates auto-correlation spectra of the raw sample stream on a
/// dedicated thread and surfaces frame/line peak candidates through the
/// event sink.
pub struct FrameRateDetector {
    ring: Arc<SampleRing>,
    samplerate: Arc<AtomicU32>,
    alive: Arc<AtomicBool>,
    enabled: Arc<AtomicBool>,
    purge_buffers: Arc<AtomicBool>,
    dump_requested: Arc<AtomicBool>,
    dump_path: Arc<Mutex<PathBuf>>,
    sink: Arc<dyn EventSink>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl FrameRateDetector {
    pub fn new(sink: Arc<dyn EventSink>) -> FrameRateDetector {
        FrameRateDetector {
            ring: Arc::new(SampleRing::new(SIZE_COEFF_HIGH_LATENCY)),
            samplerate: Arc::new(AtomicU32::new(0)),
            alive: Arc::new(AtomicBool::new(false)),
            enabled: Arc::new(AtomicBool::new(true)),
            purge_buffers: Arc::new(AtomicBool::new(false)),
            dump_requested: Arc::new(AtomicBool::new(false)),
            dump_path: Arc::new(Mutex::new(PathBuf::from("autocorr.csv"))),
            sink,
            handle: Mutex::new(None),
        }
    }

    /// Offers a batch of raw samples to the detector. `discontinuity` marks
    /// batches following dropped samples or a retune; those purge the ingest
    /// ring instead of polluting the estimate.
    pub fn feed(&self, data: &[f32], samplerate: u32, discontinuity: bool) {
        if !self.enabled.load(Ordering::Relaxed) {
            return;
        }
        if discontinuity {
            self.ring.purge();
            return;
        }

        self.samplerate.store(samplerate, Ordering::Relaxed);
        if self.ring.push(data).is_err() {
            // The worker fell behind a whole window; the stream is
            // continuous only within one window, so start over.
            self.ring.purge();
        }
    }

    /// Requests that the accumulated estimate start over, e.g. after a
    /// retune.
    pub fn flush_estimate(&self) {
        self.purge_buffers.store(true, Ordering::Relaxed);
        self.ring.purge();
    }

    /// Enables or disables accumulation. While disabled, fed batches are
    /// discarded.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    /// Asks the worker to write the raw auto-correlation of its next window
    /// to `path` as CSV, millisecond lag against dB magnitude.
    pub fn request_dump(&self, path: PathBuf) {
        *self.dump_path.lock() = path;
        self.dump_requested.store(true, Ordering::Relaxed);
    }

    /// Starts the background thread. Idempotent while running.
    pub fn start(&self) {
        let mut handle = self.handle.lock();
        if handle.is_some() {
            return;
        }
        self.flush_estimate();
        self.alive.store(true, Ordering::Relaxed);

        let ring = self.ring.clone();
        let samplerate = self.samplerate.clone();
        let alive = self.alive.clone();
        let purge_buffers = self.purge_buffers.clone();
        let dump_requested = self.dump_requested.clone();
        let dump_path = self.dump_path.clone();
        let sink = self.sink.clone();

        *handle = Some(thread::spawn(move || {
            let span = span!(Level::INFO, "framerate detector");
            let _enter = span.enter();
            info!("Frame rate detection started.");

            let mut autocorr: ScratchBuffer<f32> = ScratchBuffer::new();
            let mut frame_avg: ScratchBuffer<f64> = ScratchBuffer::new();
            let mut line_avg: ScratchBuffer<f64> = ScratchBuffer::new();
            let mut window: Vec<f32> = Vec::new();

            while alive.load(Ordering::Relaxed) {
                let rate = samplerate.load(Ordering::Relaxed);
                let desired = (FRAMES_TO_CAPTURE * rate as f64 / MIN_FRAMERATE as f64) as usize;
                if desired == 0 {
                    thread::sleep(Duration::from_millis(10));
                    continue;
                }
                if desired > window.len() {
                    window.resize(desired, 0.0);
                }

                if purge_buffers.swap(false, Ordering::Relaxed) {
                    autocorr.mark_for_zero();
                    frame_avg.mark_for_zero();
                    line_avg.mark_for_zero();
                    sink.value_changed(ValueId::AutocorrReset, 0.0, 0.0);
                }

                if ring
                    .pop_blocking(&mut window[..desired], POLL_TIMEOUT)
                    .is_ok()
                {
                    run_onto_data(
                        &*sink,
                        rate,
                        &window[..desired],
                        &mut autocorr,
                        &mut frame_avg,
                        &mut line_avg,
                    );

                    if dump_requested.swap(false, Ordering::Relaxed) {
                        let path = dump_path.lock().clone();
                        match dump_autocorrelation(&autocorr, rate, &path) {
                            Ok(()) => sink.value_changed(ValueId::AutocorrDumped, 0.0, 0.0),
                            Err(e) => debug!(err = e.to_string(), "Autocorrelation dump failed."),
                        }
                    }
                }
            }

            info!("Frame rate detection stopped.");
        }));
    }

    /// Clears the alive flag and joins the worker. The worker exits after
    /// its current iteration.
    pub fn stop(&self) {
        self.alive.store(false, Ordering::Relaxed);
        self.ring.purge();
        if let Some(handle) = self.handle.lock().take() {
            if handle.join().is_err() {
                debug!("Frame rate detector thread panicked.");
            }
        }
    }
}

impl Drop for FrameRateDetector {
    fn drop(&mut self) {
        self.stop();
        self.ring.invalidate();
    }
}

/// Auto-correlates one window and folds it into the running averages, then
/// publishes both plots and the window count.
fn run_onto_data(
    sink: &dyn EventSink,
    samplerate: u32,
    data: &[f32],
    autocorr: &mut ScratchBuffer<f32>,
    frame_avg: &mut ScratchBuffer<f64>,
    line_avg: &mut ScratchBuffer<f64>,
) {
    let max_length = (samplerate / MIN_FRAMERATE) as usize;
    let min_length = (samplerate / MAX_FRAMERATE) as usize;
    let height_max_length = (samplerate / (MIN_HEIGHT * MIN_FRAMERATE)) as usize;
    let height_min_length = (samplerate / (MAX_HEIGHT * MAX_FRAMERATE)) as usize;

    autocorr.prepare(data.len() * 2);
    fft::autocorrelation(autocorr.as_mut_slice(), data);

    accumulate(frame_avg, autocorr, min_length, max_length - min_length);
    sink.plot_ready(PlotId::Frame, frame_avg.as_slice(), min_length, samplerate);

    if height_max_length > height_min_length {
        accumulate(
            line_avg,
            autocorr,
            height_min_length,
            height_max_length - height_min_length,
        );
        sink.plot_ready(
            PlotId::Line,
            line_avg.as_slice(),
            height_min_length,
            samplerate,
        );
    }

    sink.value_changed(ValueId::AutocorrFrames, 0.0, autocorr.calls() as f64);
}

/// Writes the raw auto-correlation as two-column CSV for offline analysis:
/// one row per complex bin over the first `floor_pow2(len) / 2` elements,
/// millisecond lag against dB magnitude.
fn dump_autocorrelation(
    autocorr: &ScratchBuffer<f32>,
    samplerate: u32,
    path: &Path,
) -> io::Result<()> {
    let mut out = BufWriter::new(File::create(path)?);
    writeln!(out, "ms, dB")?;

    let data = autocorr.as_slice();
    let max_elements = fft::floor_pow2(data.len()) / 2;
    let mut i = 0;
    while i < max_elements {
        let re = data[i] as f64;
        let im = data[i + 1] as f64;
        let db = 10.0 * (re * re + im * im).sqrt().log10();
        let t = 1000.0 * (i / 2) as f64 / samplerate as f64;
        writeln!(out, "{:.6}, {:.6}", t, db)?;
        i += 2;
    }

    out.flush()
}

/// Folds the magnitudes of `length` complex bins starting at `start` into
/// `out` as an incremental mean. The window count comes from the
/// auto-correlation scratch buffer, so a reset there restarts the average
/// here.
fn accumulate(out: &mut ScratchBuffer<f64>, input: &ScratchBuffer<f32>, start: usize, length: usize) {
    let calls = input.calls().max(1);

    out.prepare(length);
    let src = &input.as_slice()[start * 2..(start + length) * 2];
    let dst = out.as_mut_slice();

    for (avg, bin) in dst.iter_mut().zip(src.chunks_exact(2)) {
        let i = bin[0] as f64;
        let q = bin[1] as f64;
        let now = (i * i + q * q).sqrt();
        *avg = (*avg * (calls - 1) as f64 + now) / calls as f64;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::events::test::RecordingSink;
    use crate::testutil::eventually;

    /// A raster-like signal: a fixed line pattern repeated every `period`
    /// samples, so the auto-correlation develops a sharp peak at the frame
    /// lag.
    fn raster_signal(len: usize, period: usize) -> Vec<f32> {
        let line: Vec<f32> = (0..period)
            .map(|i| ((i as f32 * 12.9898).sin() * 43758.547).fract())
            .collect();
        (0..len).map(|i| line[i % period]).collect()
    }

    #[test]
    fn test_peak_lands_on_frame_period() {
        // 64 Hz at 65536 Sa/s puts the frame period at exactly 1024
        // samples, which divides the correlation FFT size evenly, so the
        // peak is unsmeared.
        const RATE: u32 = 65_536;
        const PERIOD: usize = 1024;

        let sink = RecordingSink::new();
        let mut autocorr = ScratchBuffer::new();
        let mut frame_avg = ScratchBuffer::new();
        let mut line_avg = ScratchBuffer::new();

        let window = (FRAMES_TO_CAPTURE * RATE as f64 / MIN_FRAMERATE as f64) as usize;
        let data = raster_signal(window, PERIOD);

        for _ in 0..4 {
            run_onto_data(
                &sink,
                RATE,
                &data,
                &mut autocorr,
                &mut frame_avg,
                &mut line_avg,
            );
        }

        let (plot, offset, rate) = sink.last_plot(PlotId::Frame).expect("no frame plot");
        assert_eq!(RATE, rate);
        assert_eq!((RATE / MAX_FRAMERATE) as usize, offset);

        let argmax = plot
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.partial_cmp(b.1).expect("NaN in plot"))
            .map(|(i, _)| i)
            .expect("empty plot");
        let lag = (offset + argmax) as i64;
        assert!(
            (lag - PERIOD as i64).abs() <= 1,
            "expected peak near {}, got {}",
            PERIOD,
            lag
        );

        let frames = sink.values_with(ValueId::AutocorrFrames);
        assert_eq!(4, frames.len());
        assert_eq!(4.0, frames[3].1);
    }

    #[test]
    fn test_dump_writes_millisecond_db_rows() {
        const RATE: u32 = 65_536;

        let sink = RecordingSink::new();
        let mut autocorr = ScratchBuffer::new();
        let mut frame_avg = ScratchBuffer::new();
        let mut line_avg = ScratchBuffer::new();

        let window = (FRAMES_TO_CAPTURE * RATE as f64 / MIN_FRAMERATE as f64) as usize;
        let data = raster_signal(window, 1024);
        run_onto_data(
            &sink,
            RATE,
            &data,
            &mut autocorr,
            &mut frame_avg,
            &mut line_avg,
        );

        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("autocorr.csv");
        dump_autocorrelation(&autocorr, RATE, &path).expect("dump failed");

        let contents = std::fs::read_to_string(&path).expect("read failed");
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!("ms, dB", lines[0]);

        // One row per complex bin over the power-of-two region of the
        // correlation buffer.
        let rows = fft::floor_pow2(window * 2) / 4;
        assert_eq!(rows + 1, lines.len());

        // The timebase advances by one sample period per bin.
        assert!(lines[1].starts_with("0.000000, "));
        assert!(lines[2].starts_with("0.015259, "));
        for line in &lines[1..] {
            assert_eq!(2, line.split(", ").count(), "malformed row: {}", line);
        }
    }

    #[test]
    fn test_request_dump_announces_completion() {
        const RATE: u32 = 55_000;

        let sink = Arc::new(RecordingSink::new());
        let detector = FrameRateDetector::new(sink.clone());
        detector.start();

        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("autocorr.csv");
        detector.request_dump(path.clone());

        let window = (FRAMES_TO_CAPTURE * RATE as f64 / MIN_FRAMERATE as f64) as usize;
        let data = raster_signal(window * 2, 917);
        eventually(
            || {
                detector.feed(&data, RATE, false);
                !sink.values_with(ValueId::AutocorrDumped).is_empty()
            },
            "no dump announced",
        );
        detector.stop();

        let contents = std::fs::read_to_string(&path).expect("dump file missing");
        assert!(contents.starts_with("ms, dB"));
    }

    #[test]
    fn test_thread_lifecycle_and_purge() {
        const RATE: u32 = 55_000;

        let sink = Arc::new(RecordingSink::new());
        let detector = FrameRateDetector::new(sink.clone());
        detector.start();

        let window = (FRAMES_TO_CAPTURE * RATE as f64 / MIN_FRAMERATE as f64) as usize;
        let data = raster_signal(window * 2, 917);

        // Keep feeding until the worker has published at least one plot.
        eventually(
            || {
                detector.feed(&data, RATE, false);
                sink.last_plot(PlotId::Frame).is_some()
            },
            "no plot published",
        );

        detector.flush_estimate();
        eventually(
            || !sink.values_with(ValueId::AutocorrReset).is_empty(),
            "no reset announced",
        );

        detector.stop();
    }
}
