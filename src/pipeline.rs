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
// The capture orchestrator. The front-end callback (producer) pushes
// samples through the dropped-sample compensator into the main ring; the
// consumer thread pulls frame-sized blocks, optionally routes them through
// the super-bandwidth stitcher, demodulates, resamples onto the pixel grid
// and post-processes into display frames. The frame-rate detector taps the
// raw stream on its own thread.
//
use std::error::Error;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, TrySendError};
use parking_lot::Mutex;
use tracing::{debug, error, info, span, Level};

use crate::buffer::{RingError, SampleRing, ScratchBuffer, SIZE_COEFF_LOW_LATENCY};
use crate::config::Capture;
use crate::dsp::am_demodulate;
use crate::dsp::compensation::DropCompensation;
use crate::dsp::postprocess::{PostProcessor, ProcessParams};
use crate::dsp::resample::PixelResampler;
use crate::events::{EventSink, VideoFrame};
use crate::framerate::FrameRateDetector;
use crate::frontend::Frontend;
use crate::superband::{SuperBandwidth, TunerControl};
use crate::sync::SyncDetector;

/// How many finished frames may queue toward the host before the pipeline
/// starts dropping instead of stalling.
const FRAME_CHANNEL_DEPTH: usize = 4;

/// The front-end coupling the super-bandwidth stitcher retunes through.
/// Frequency shifts are relative to the configured base frequency; the
/// effective sample rate is what the consumer computes block sizes with.
struct Tuning {
    frontend: Arc<dyn Frontend>,
    base_freq: AtomicU32,
    effective_rate: AtomicU32,
}

impl Tuning {
    fn hardware_rate(&self) -> u32 {
        self.frontend.sample_rate()
    }
}

impl TunerControl for Tuning {
    fn shift_center_freq(&self, offset_hz: i64) {
        let base = self.base_freq.load(Ordering::Relaxed) as i64;
        let target = (base + offset_hz).clamp(0, u32::MAX as i64) as u32;
        if let Err(e) = self.frontend.set_center_freq(target) {
            error!(err = e.to_string(), "Failed to retune the front end.");
        }
    }

    fn set_effective_samplerate(&self, rate: u32) {
        self.effective_rate.store(rate, Ordering::Relaxed);
    }
}

/// A running capture session. Dropping the handle tears the session down in
/// order: front end, worker threads, buffers.
pub struct Pipeline {
    frontend: Arc<dyn Frontend>,
    detector: Arc<FrameRateDetector>,
    ring: Arc<SampleRing>,
    alive: Arc<AtomicBool>,
    producer: Option<JoinHandle<()>>,
    consumer: Option<JoinHandle<()>>,
}

impl Pipeline {
    /// Configures the front end per `config` and starts the capture
    /// threads. Returns the session handle and the channel reconstructed
    /// frames arrive on; when the channel backs up, frames are dropped.
    pub fn start(
        config: &Capture,
        frontend: Arc<dyn Frontend>,
        sync: Box<dyn SyncDetector>,
        sink: Arc<dyn EventSink>,
    ) -> Result<(Pipeline, Receiver<VideoFrame>), Box<dyn Error>> {
        frontend.init(config.options())?;
        let hardware_rate = frontend.set_sample_rate(config.sample_rate());
        frontend.set_center_freq(config.frequency())?;
        frontend.set_gain(config.gain())?;
        let read_timeout = config.read_timeout()?;

        info!(
            frontend = frontend.to_string(),
            rate = hardware_rate,
            frequency = config.frequency(),
            "Capture configured."
        );

        let ring = Arc::new(SampleRing::new(SIZE_COEFF_LOW_LATENCY));
        let compensation = Arc::new(Mutex::new(DropCompensation::new()));
        let detector = Arc::new(FrameRateDetector::new(sink.clone()));
        detector.start();

        let tuning = Arc::new(Tuning {
            frontend: frontend.clone(),
            base_freq: AtomicU32::new(config.frequency()),
            effective_rate: AtomicU32::new(hardware_rate),
        });
        let alive = Arc::new(AtomicBool::new(true));
        // Items per frame at the effective rate; the producer aligns
        // discarded chunks to this block.
        let block_items = Arc::new(AtomicUsize::new(0));
        let pending_drop = Arc::new(AtomicBool::new(false));
        let (frames_tx, frames_rx) = bounded::<VideoFrame>(FRAME_CHANNEL_DEPTH);

        let producer = {
            let frontend = frontend.clone();
            let detector = detector.clone();
            let ring = ring.clone();
            let compensation = compensation.clone();
            let alive = alive.clone();
            let block_items = block_items.clone();
            let pending_drop = pending_drop.clone();
            thread::spawn(move || {
                let producer_span = span!(Level::INFO, "producer");
                let _enter = producer_span.enter();
                if thread_priority::set_current_thread_priority(
                    thread_priority::ThreadPriority::Max,
                )
                .is_err()
                {
                    debug!("Could not raise producer thread priority.");
                }

                let rate = frontend.sample_rate();
                let result = frontend.read_async(&mut |items, dropped| {
                    if !alive.load(Ordering::Relaxed) {
                        return;
                    }

                    let block = block_items.load(Ordering::Relaxed).max(2);
                    if dropped > 0 {
                        // The stream advanced by samples nobody saw; trim
                        // the next chunk back onto the frame grid.
                        compensation.lock().shift(block, dropped as i64 * 2);
                        pending_drop.store(true, Ordering::Relaxed);
                        detector.feed(&[], rate, true);
                    }
                    if !items.is_empty() {
                        detector.feed(items, rate, false);
                        compensation.lock().ingest(&ring, items, block);
                    }
                });

                if let Err(e) = result {
                    error!(err = e.to_string(), "Front-end streaming failed.");
                }
            })
        };

        let consumer = {
            let ring = ring.clone();
            let compensation = compensation.clone();
            let alive = alive.clone();
            let block_items = block_items.clone();
            let pending_drop = pending_drop.clone();
            let tuning = tuning.clone();
            let sink = sink.clone();
            let config = config.clone();
            thread::spawn(move || {
                let consumer_span = span!(Level::INFO, "consumer");
                let _enter = consumer_span.enter();
                if thread_priority::set_current_thread_priority(
                    thread_priority::ThreadPriority::Max,
                )
                .is_err()
                {
                    debug!("Could not raise consumer thread priority.");
                }

                let width = config.width();
                let height = config.height();
                let refresh = config.refresh_rate();
                let frame_pixels = width * height;
                let params = ProcessParams {
                    motion_blur: config.motion_blur(),
                    gain_norm: config.gain_norm(),
                    lowpass_before_sync: config.lowpass_before_sync(),
                    autogain_after: config.autogain_after(),
                    supersampling_allowed: true,
                };

                let mut superband = SuperBandwidth::new(tuning.clone());
                let mut resampler = PixelResampler::new();
                let mut post = PostProcessor::new(sync, sink, false);
                let mut pixels: ScratchBuffer<f32> = ScratchBuffer::new();
                let mut block: Vec<f32> = Vec::new();
                let mut demod: Vec<f32> = Vec::new();
                let mut assembled: Vec<f32> = Vec::new();

                while alive.load(Ordering::Relaxed) {
                    let rate = tuning.effective_rate.load(Ordering::Relaxed);
                    let samples_in_frame = (rate as f64 / refresh) as usize;
                    if samples_in_frame == 0 {
                        thread::sleep(Duration::from_millis(10));
                        continue;
                    }
                    let block_len = samples_in_frame * 2;
                    block_items.store(block_len, Ordering::Relaxed);
                    block.resize(block_len, 0.0);

                    match ring.pop_blocking(&mut block, read_timeout) {
                        Ok(()) => {}
                        Err(RingError::Invalidated) => break,
                        // Timeout or purge: transient, retry.
                        Err(_) => continue,
                    }

                    let dropped = pending_drop.swap(false, Ordering::Relaxed);

                    let stitched;
                    let iq: &[f32] = if config.super_bandwidth() {
                        match superband.run(
                            &block,
                            dropped,
                            tuning.hardware_rate(),
                            refresh,
                        ) {
                            Some(wide) => {
                                stitched = wide;
                                &stitched
                            }
                            None => continue,
                        }
                    } else {
                        &block
                    };

                    // A stitched capture arrives at the widened rate, so the
                    // ratio is re-read rather than reusing the block's.
                    let rate = tuning.effective_rate.load(Ordering::Relaxed);
                    am_demodulate(iq, &mut demod);
                    let produced = resampler.process(
                        &demod,
                        &mut pixels,
                        frame_pixels as f64 * refresh,
                        rate as f64,
                        config.nearest_neighbour(),
                    );
                    if produced == 0 {
                        continue;
                    }
                    assembled.extend_from_slice(pixels.as_slice());

                    while assembled.len() >= frame_pixels {
                        let (out, decision) =
                            post.process(&assembled[..frame_pixels], width, height, params);

                        match frames_tx.try_send(VideoFrame {
                            width,
                            height,
                            pixels: out.to_vec(),
                        }) {
                            Ok(()) => {}
                            Err(TrySendError::Full(_)) => {
                                debug!("Frame channel full, dropping frame.")
                            }
                            Err(TrySendError::Disconnected(_)) => {
                                debug!("Frame channel closed.")
                            }
                        }

                        if decision.horizontal_offset != 0 {
                            compensation.lock().shift(block_len, decision.horizontal_offset);
                        }
                        if decision.vertical_offset != 0 {
                            compensation.lock().shift(block_len, decision.vertical_offset);
                        }

                        assembled.drain(..frame_pixels);
                    }
                }

                superband.stop();
            })
        };

        Ok((
            Pipeline {
                frontend,
                detector,
                ring,
                alive,
                producer: Some(producer),
                consumer: Some(consumer),
            },
            frames_rx,
        ))
    }

    /// The frame-rate detector attached to this session, for estimate
    /// flushes and CSV dumps.
    pub fn frame_rate_detector(&self) -> &FrameRateDetector {
        &self.detector
    }

    /// Stops the capture: front end first, then the worker threads, then
    /// the buffers.
    pub fn stop(&mut self) {
        if !self.alive.swap(false, Ordering::Relaxed) {
            return;
        }
        info!("Stopping capture.");

        self.frontend.stop();
        self.ring.purge();
        if let Some(handle) = self.producer.take() {
            if handle.join().is_err() {
                debug!("Producer thread panicked.");
            }
        }
        if let Some(handle) = self.consumer.take() {
            if handle.join().is_err() {
                debug!("Consumer thread panicked.");
            }
        }
        self.detector.stop();
        self.ring.invalidate();
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod test {
    use std::io::Write;
    use std::path::Path;

    use super::*;
    use crate::events::NullSink;
    use crate::frontend::get_frontend;
    use crate::sync::NoSync;

    fn load_config(yaml: &str) -> Capture {
        let mut file = tempfile::Builder::new()
            .suffix(".yaml")
            .tempfile()
            .expect("tempfile");
        write!(file, "{}", yaml).expect("write failed");
        Capture::load(Path::new(file.path())).expect("load failed")
    }

    #[test]
    fn test_reconstructs_frames_from_simulated_raster() {
        let config = load_config(
            r#"
frontend: simulator
sample_rate: 192000
width: 64
height: 48
refresh_rate: 60
"#,
        );
        let frontend = get_frontend(config.frontend()).expect("no front end");
        let (mut pipeline, frames) =
            Pipeline::start(&config, frontend, Box::new(NoSync), Arc::new(NullSink))
                .expect("pipeline failed to start");

        for _ in 0..3 {
            let frame = frames
                .recv_timeout(Duration::from_secs(10))
                .expect("no frame arrived");
            assert_eq!(64, frame.width);
            assert_eq!(48, frame.height);
            assert_eq!(64 * 48, frame.pixels.len());
            assert!(frame.pixels.iter().all(|p| p.is_finite()));
        }

        pipeline.stop();
    }

    #[test]
    fn test_survives_dropped_samples() {
        let config = load_config(
            r#"
frontend: simulator-drops
sample_rate: 192000
width: 32
height: 24
refresh_rate: 60
"#,
        );
        let frontend = get_frontend(config.frontend()).expect("no front end");
        let (mut pipeline, frames) =
            Pipeline::start(&config, frontend, Box::new(NoSync), Arc::new(NullSink))
                .expect("pipeline failed to start");

        // Enough frames to span several dropped-sample events; the stream
        // keeps flowing because the compensator realigns after each.
        for _ in 0..80 {
            frames
                .recv_timeout(Duration::from_secs(10))
                .expect("no frame arrived");
        }

        pipeline.stop();
    }

    #[test]
    fn test_super_bandwidth_mode_stitches_hops() {
        let config = load_config(
            r#"
frontend: simulator
sample_rate: 48000
width: 64
height: 48
refresh_rate: 60
super_bandwidth: true
"#,
        );
        let frontend = get_frontend(config.frontend()).expect("no front end");
        let (mut pipeline, frames) =
            Pipeline::start(&config, frontend, Box::new(NoSync), Arc::new(NullSink))
                .expect("pipeline failed to start");

        // A full hop cycle takes a few seconds of simulated stream; the
        // first frame only exists once all four hops were stitched.
        let frame = frames
            .recv_timeout(Duration::from_secs(10))
            .expect("no stitched frame arrived");
        assert_eq!(64 * 48, frame.pixels.len());

        pipeline.stop();
    }
}
