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
// Synthesizes a wider-than-hardware bandwidth by retuning the front end
// through equally spaced center frequencies, recording a burst of frames at
// each hop, aligning the hops in time, and concatenating their spectra.
// Cross-correlating amplitude *differences* suppresses DC and slow drift,
// so the alignment anchors on the edges both hops see.
//
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, span, Level};

use crate::buffer::ScratchBuffer;
use crate::dsp::fft;

/// Number of center frequencies visited per capture cycle.
pub const SUPER_HOPS_TO_MAKE: usize = 4;
/// Frames recorded at each hop.
const SUPER_FRAMES_TO_RECORD: usize = 10;
/// Settle time after a retune, spent discarding samples while the PLL
/// relocks.
const SUPER_SECS_TO_PAUSE: f64 = 0.5;

/// Commands the stitcher issues to the front end through the orchestrator.
pub trait TunerControl: Send + Sync {
    /// Shifts the center frequency by `offset_hz` relative to the requested
    /// base frequency.
    fn shift_center_freq(&self, offset_hz: i64);
    /// Overrides the sample rate the rest of the pipeline computes with.
    fn set_effective_samplerate(&self, rate: u32);
}

/// Capture-cycle states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Stopped,
    Starting,
    Gathering,
    Pause,
    DataReady,
    OutputReady,
}

struct HopState {
    phase: Phase,
    /// One interleaved I/Q buffer per hop, `samples_to_gather × 2` floats.
    hops: Vec<Vec<f32>>,
    hop_index: usize,
    samples_gathered: usize,
    /// Samples recorded into each completed hop.
    hop_samples: usize,
    samples_to_gather: usize,
    samples_to_pause: usize,
    samples_in_frame: usize,
    samplerate: u32,
    output: Option<Vec<f32>>,
}

struct Shared {
    state: Mutex<HopState>,
    data_ready: Condvar,
    alive: AtomicBool,
}

/// The multi-hop capture state machine. `run` is driven from the consumer
/// thread with every arriving batch; the frequency-domain stitching happens
/// on a worker thread signalled when the last hop completes.
pub struct SuperBandwidth {
    shared: Arc<Shared>,
    tuner: Arc<dyn TunerControl>,
    handle: Option<JoinHandle<()>>,
}

impl SuperBandwidth {
    pub fn new(tuner: Arc<dyn TunerControl>) -> SuperBandwidth {
        SuperBandwidth {
            shared: Arc::new(Shared {
                state: Mutex::new(HopState {
                    phase: Phase::Stopped,
                    hops: Vec::new(),
                    hop_index: 0,
                    samples_gathered: 0,
                    hop_samples: 0,
                    samples_to_gather: 0,
                    samples_to_pause: 0,
                    samples_in_frame: 0,
                    samplerate: 0,
                    output: None,
                }),
                data_ready: Condvar::new(),
                alive: AtomicBool::new(false),
            }),
            tuner,
            handle: None,
        }
    }

    pub fn phase(&self) -> Phase {
        self.shared.state.lock().phase
    }

    /// Feeds one batch of interleaved I/Q items through the state machine.
    /// Returns the stitched wideband capture once per completed cycle.
    /// `dropped` restarts the current hop, since a gap would break the
    /// time alignment.
    pub fn run(
        &mut self,
        iq: &[f32],
        dropped: bool,
        samplerate: u32,
        refresh_rate: f64,
    ) -> Option<Vec<f32>> {
        let mut shift_to: Option<i64> = None;
        let mut taken = None;

        {
            let shared = self.shared.clone();
            let mut st = shared.state.lock();

            if st.phase == Phase::Stopped {
                st.phase = Phase::Starting;
                self.start_worker();
            }

            if st.phase == Phase::Starting {
                st.hop_index = 0;
                st.samples_gathered = 0;
                st.hop_samples = 0;

                if st.samplerate != samplerate {
                    st.samplerate = samplerate;
                    st.samples_in_frame = (samplerate as f64 / refresh_rate) as usize;
                    st.samples_to_gather = SUPER_FRAMES_TO_RECORD * st.samples_in_frame;
                    st.samples_to_pause = (SUPER_SECS_TO_PAUSE * samplerate as f64) as usize;

                    let len = st.samples_to_gather * 2;
                    st.hops = (0..SUPER_HOPS_TO_MAKE).map(|_| vec![0.0; len]).collect();
                    debug!(
                        samples_per_hop = st.samples_to_gather,
                        "Sized hop buffers for new sample rate."
                    );
                }

                st.phase = Phase::Gathering;
            }

            if st.phase == Phase::Pause {
                st.samples_gathered += iq.len() / 2;
                if st.samples_gathered > st.samples_to_pause {
                    st.samples_gathered = 0;
                    st.phase = Phase::Gathering;
                }
            }

            if st.phase == Phase::Gathering {
                if dropped {
                    st.samples_gathered = 0;
                    return None;
                }

                let samples_now = iq.len() / 2;
                if st.samples_gathered + samples_now < st.samples_to_gather {
                    let at = st.samples_gathered * 2;
                    let hop_index = st.hop_index;
                    let hop = &mut st.hops[hop_index];
                    hop[at..at + iq.len()].copy_from_slice(iq);
                    st.samples_gathered += samples_now;
                } else {
                    let samples_remain = st.samples_to_gather - st.samples_gathered;
                    let at = st.samples_gathered * 2;
                    let hop_index = st.hop_index;
                    let hop = &mut st.hops[hop_index];
                    hop[at..at + samples_remain * 2].copy_from_slice(&iq[..samples_remain * 2]);
                    st.samples_gathered += samples_remain;

                    st.hop_index += 1;
                    st.hop_samples = st.samples_gathered;
                    st.samples_gathered = 0;

                    if st.hop_index >= SUPER_HOPS_TO_MAKE {
                        st.phase = Phase::DataReady;
                        shared.data_ready.notify_one();
                    } else {
                        shift_to = Some(
                            (st.hop_index as i64 - (SUPER_HOPS_TO_MAKE / 2) as i64)
                                * st.samplerate as i64,
                        );
                        st.phase = Phase::Pause;
                    }
                }
            }

            if st.phase == Phase::OutputReady {
                st.phase = Phase::Starting;
                taken = st.output.take();
            }
        }

        if let Some(offset) = shift_to {
            self.tuner.shift_center_freq(offset);
        }

        taken
    }

    /// Leaves super-bandwidth mode: restores the base tuning and the
    /// hardware sample rate, and winds the worker down.
    pub fn stop(&mut self) {
        let restore = {
            let mut st = self.shared.state.lock();
            if st.phase == Phase::Stopped {
                None
            } else {
                st.phase = Phase::Stopped;
                Some(st.samplerate)
            }
        };

        if let Some(rate) = restore {
            self.tuner.shift_center_freq(0);
            self.tuner.set_effective_samplerate(rate);
        }

        self.shared.alive.store(false, Ordering::Relaxed);
        self.shared.data_ready.notify_all();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                debug!("Super-bandwidth worker panicked.");
            }
        }
    }

    fn start_worker(&mut self) {
        if self.handle.is_some() {
            return;
        }
        self.shared.alive.store(true, Ordering::Relaxed);

        let shared = self.shared.clone();
        let tuner = self.tuner.clone();
        self.handle = Some(thread::spawn(move || worker(shared, tuner)));
    }
}

impl Drop for SuperBandwidth {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker(shared: Arc<Shared>, tuner: Arc<dyn TunerControl>) {
    let span = span!(Level::INFO, "superband worker");
    let _enter = span.enter();
    info!("Super-bandwidth stitching started.");

    let mut corr: ScratchBuffer<f32> = ScratchBuffer::new();
    let mut corr_temp: ScratchBuffer<f32> = ScratchBuffer::new();

    while shared.alive.load(Ordering::Relaxed) {
        let (mut hops, hop_samples, samples_in_frame, samplerate) = {
            let mut st = shared.state.lock();
            while st.phase != Phase::DataReady {
                if !shared.alive.load(Ordering::Relaxed) {
                    return;
                }
                let _ = shared
                    .data_ready
                    .wait_for(&mut st, Duration::from_millis(100));
            }
            (
                mem::take(&mut st.hops),
                fft::floor_pow2(st.hop_samples),
                st.samples_in_frame,
                st.samplerate,
            )
        };

        // The machine ignores input while in DataReady, so the hop buffers
        // can be worked on outside the lock and handed back afterwards.
        let output = stitch(
            &mut hops,
            hop_samples,
            samples_in_frame,
            &mut corr,
            &mut corr_temp,
            &shared.alive,
        );

        let mut st = shared.state.lock();
        st.hops = hops;
        // A stop() racing the stitch leaves the machine Stopped; the late
        // result is discarded rather than resurrecting the cycle.
        if st.phase == Phase::DataReady {
            if let Some(output) = output {
                debug!(samples = output.len() / 2, "Stitched wideband capture.");
                tuner.set_effective_samplerate(SUPER_HOPS_TO_MAKE as u32 * samplerate);
                st.output = Some(output);
                st.phase = Phase::OutputReady;
            }
        }
    }

    info!("Super-bandwidth stitching stopped.");
}

/// Aligns every hop to hop 0, transforms each, concatenates the spectra and
/// transforms back. Returns None when cancelled mid-way.
fn stitch(
    hops: &mut [Vec<f32>],
    hop_samples: usize,
    samples_in_frame: usize,
    corr: &mut ScratchBuffer<f32>,
    corr_temp: &mut ScratchBuffer<f32>,
    alive: &AtomicBool,
) -> Option<Vec<f32>> {
    let hop_len = hop_samples * 2;
    let total_samples = hops.len() * hop_samples;

    for i in 1..hops.len() {
        let (head, tail) = hops.split_at_mut(i);
        let best = best_fit(&head[0], &tail[0], hop_len, samples_in_frame, corr, corr_temp);
        if !alive.load(Ordering::Relaxed) {
            return None;
        }
        tail[0][..hop_len].rotate_left(best);
        fft::transform(&mut tail[0], hop_samples, false);
    }
    fft::transform(&mut hops[0], hop_samples, false);

    let mut output = vec![0.0f32; total_samples * 2];
    for (i, hop) in hops.iter().enumerate() {
        output[i * hop_len..(i + 1) * hop_len].copy_from_slice(&hop[..hop_len]);
    }
    fft::transform(&mut output, total_samples, true);

    Some(output)
}

/// Replaces each complex value with the difference between its magnitude
/// and the previous one, zeroing the imaginary parts.
fn amplitude_difference(data: &mut [f32]) {
    let mut prev = (data[0] * data[0] + data[1] * data[1]).sqrt();
    for pair in data.chunks_exact_mut(2) {
        let curr = (pair[0] * pair[0] + pair[1] * pair[1]).sqrt();
        pair[0] = curr - prev;
        pair[1] = 0.0;
        prev = curr;
    }
}

/// Best time shift (in interleaved floats) aligning `b` to `a`: trim to a
/// whole number of frames, round down to a power of two, cross-correlate
/// the amplitude-difference signals and take the argmax.
fn best_fit(
    a: &[f32],
    b: &[f32],
    size: usize,
    samples_in_frame: usize,
    corr: &mut ScratchBuffer<f32>,
    corr_temp: &mut ScratchBuffer<f32>,
) -> usize {
    let size = fft::floor_pow2((size / samples_in_frame) * samples_in_frame);
    let samples = size / 2;

    corr.prepare(size);
    corr_temp.prepare(size);
    corr.as_mut_slice().copy_from_slice(&a[..size]);
    corr_temp.as_mut_slice().copy_from_slice(&b[..size]);

    amplitude_difference(corr.as_mut_slice());
    amplitude_difference(corr_temp.as_mut_slice());

    fft::cross_correlation(corr.as_mut_slice(), corr_temp.as_mut_slice(), samples);

    let mut best = 0usize;
    let mut best_val = f32::MIN;
    for (i, pair) in corr.as_slice()[..samples * 2].chunks_exact(2).enumerate() {
        let val = (pair[0] * pair[0] + pair[1] * pair[1]).sqrt();
        if i == 0 {
            best_val = val;
        } else if val > best_val {
            best_val = val;
            best = i;
        }
    }

    2 * best
}
