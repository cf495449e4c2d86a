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
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Initial (and minimum) growth coefficient.
const SIZE_COEFF_DEFAULT: usize = 2;

/// Errors surfaced by ring operations. These are transient except for
/// [RingError::Invalidated], which is terminal for the ring.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum RingError {
    /// The ring does not hold enough items to satisfy the read.
    #[error("ring buffer does not hold enough items")]
    Empty,
    /// The ring cannot accept the write right now. The producer decides
    /// whether to drop or retry.
    #[error("ring buffer cannot accept the write")]
    Full,
    /// The ring has been invalidated by its owner; all further operations
    /// fail with this error.
    #[error("ring buffer has been invalidated")]
    Invalidated,
}

struct RingState {
    /// Backing storage. Drained and released on invalidation.
    data: Vec<f32>,
    /// Capacity the next write should grow the storage to.
    desired_len: usize,
    /// Next write position.
    pos: usize,
    /// Next read position.
    rempos: usize,
    /// Number of items that can still be written.
    remaining: usize,
    /// Current growth coefficient, bumped each time a write finds the ring
    /// full, up to `max_size_coeff`.
    size_coeff: usize,
    max_size_coeff: usize,
    /// Set after a failed write; cleared (with a second failure) once the
    /// ring has drained enough to accept twice the rejected write. Avoids
    /// re-grow thrash on the boundary.
    buffering: bool,
    /// True while a consumer is parked on the condvar.
    waiting: bool,
    invalid: bool,
}

impl RingState {
    fn capacity(&self) -> usize {
        self.data.len()
    }

    fn occupied(&self) -> usize {
        self.capacity() - self.remaining
    }

    fn check_invariant(&self) {
        debug_assert_eq!((self.pos + self.remaining) % self.capacity(), self.rempos);
        debug_assert!(self.remaining <= self.capacity());
    }

    /// Grows the storage to `desired_len`, keeping the logical item order
    /// intact. When the unread region wraps (or starts at or after the write
    /// cursor), its tail segment moves to the new physical end.
    fn grow_if_requested(&mut self) {
        if self.capacity() >= self.desired_len {
            return;
        }

        let items_inside = self.occupied();
        let old_capacity = self.capacity();
        let inflation = self.desired_len - old_capacity;

        self.data.resize(self.desired_len, 0.0);
        if self.rempos >= self.pos && items_inside != 0 {
            self.data
                .copy_within(self.rempos..old_capacity, self.rempos + inflation);
            self.rempos += inflation;
        }
        self.remaining += inflation;

        debug_assert_eq!(self.occupied(), items_inside);
    }

    fn copy_in(&mut self, input: &[f32]) {
        let len = input.len();
        let oldpos = self.pos;
        self.pos = (oldpos + len) % self.capacity();
        self.remaining -= len;

        if self.pos <= oldpos {
            // The write wraps around the physical end.
            let first = self.capacity() - oldpos;
            self.data[oldpos..].copy_from_slice(&input[..first]);
            let wrapped = self.pos;
            self.data[..wrapped].copy_from_slice(&input[first..]);
        } else {
            self.data[oldpos..oldpos + len].copy_from_slice(input);
        }
    }

    fn copy_out(&mut self, output: &mut [f32]) {
        let len = output.len();
        let oldrempos = self.rempos;
        self.rempos = (oldrempos + len) % self.capacity();

        if self.rempos <= oldrempos {
            // The read wraps around the physical end.
            let first = self.capacity() - oldrempos;
            output[..first].copy_from_slice(&self.data[oldrempos..]);
            let wrapped = self.rempos;
            output[first..].copy_from_slice(&self.data[..wrapped]);
        } else {
            output.copy_from_slice(&self.data[oldrempos..oldrempos + len]);
        }

        self.remaining += len;
    }
}

/// A growable FIFO ring of float samples shared between one producer and one
/// consumer. Writes never block: a write that does not fit returns
/// [RingError::Full] and requests growth for the next attempt, so transient
/// slow-consumer episodes are absorbed without unbounded memory use.
pub struct SampleRing {
    state: Mutex<RingState>,
    consumer: Condvar,
}

impl SampleRing {
    /// Creates a ring that may grow up to `max_size_coeff` times the largest
    /// write it sees.
    pub fn new(max_size_coeff: usize) -> SampleRing {
        debug_assert!(max_size_coeff >= SIZE_COEFF_DEFAULT);

        SampleRing {
            state: Mutex::new(RingState {
                data: vec![0.0; SIZE_COEFF_DEFAULT],
                desired_len: SIZE_COEFF_DEFAULT,
                pos: 0,
                rempos: 0,
                remaining: SIZE_COEFF_DEFAULT,
                size_coeff: SIZE_COEFF_DEFAULT,
                max_size_coeff,
                buffering: false,
                waiting: false,
                invalid: false,
            }),
            consumer: Condvar::new(),
        }
    }

    /// Number of items currently held.
    pub fn len(&self) -> usize {
        let state = self.state.lock();
        if state.invalid {
            return 0;
        }
        state.occupied()
    }

    /// True when no items are held.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Appends `input` to the ring, growing the storage if a growth request
    /// is pending. A successful write wakes a parked consumer.
    pub fn push(&self, input: &[f32]) -> Result<(), RingError> {
        if input.is_empty() {
            return Ok(());
        }

        let mut state = self.state.lock();
        if state.invalid {
            return Err(RingError::Invalidated);
        }
        state.check_invariant();

        let len = input.len();
        if len * state.size_coeff > state.capacity() {
            state.desired_len = len * state.size_coeff;
        }
        state.grow_if_requested();

        if state.buffering && state.remaining < 2 * len {
            state.buffering = false;
            return Err(RingError::Full);
        } else if state.remaining < len {
            state.buffering = true;
            if state.size_coeff < state.max_size_coeff {
                state.size_coeff += 1;
            }
            return Err(RingError::Full);
        }

        state.copy_in(input);

        if state.waiting {
            self.consumer.notify_one();
        }

        Ok(())
    }

    /// Fills `output` from the ring, waiting up to `timeout` for enough items
    /// to arrive. Returns [RingError::Empty] on timeout or when a wake-up
    /// brought no new items (a purge, for instance); the caller decides
    /// whether to retry.
    pub fn pop_blocking(&self, output: &mut [f32], timeout: Duration) -> Result<(), RingError> {
        if output.is_empty() {
            return Ok(());
        }

        let mut state = self.state.lock();
        if state.invalid {
            return Err(RingError::Invalidated);
        }

        let len = output.len();
        let deadline = Instant::now() + timeout;
        while state.occupied() < len {
            // Ask the producer to grow the ring enough to cover a whole read.
            if len * state.size_coeff > state.capacity() {
                state.desired_len = len * state.size_coeff;
            }

            let before = state.occupied();
            state.waiting = true;
            let wait = self.consumer.wait_until(&mut state, deadline);
            state.waiting = false;

            if state.invalid {
                return Err(RingError::Invalidated);
            }
            if wait.timed_out() {
                return Err(RingError::Empty);
            }
            if state.occupied() == before {
                return Err(RingError::Empty);
            }
        }

        state.check_invariant();
        state.copy_out(output);

        Ok(())
    }

    /// Fills `output` from the ring, returning [RingError::Empty] immediately
    /// when not enough items are held.
    pub fn pop(&self, output: &mut [f32]) -> Result<(), RingError> {
        if output.is_empty() {
            return Ok(());
        }

        let mut state = self.state.lock();
        if state.invalid {
            return Err(RingError::Invalidated);
        }
        if state.occupied() < output.len() {
            return Err(RingError::Empty);
        }

        state.check_invariant();
        state.copy_out(output);

        Ok(())
    }

    /// Discards everything held, keeping the storage. A parked consumer is
    /// woken so it can observe the discontinuity.
    pub fn purge(&self) {
        let mut state = self.state.lock();
        if state.invalid {
            return;
        }

        state.remaining = state.capacity();
        state.pos = 0;
        state.rempos = 0;

        if state.waiting {
            self.consumer.notify_one();
        }
    }

    /// Marks the ring invalid and releases its storage. Parked consumers are
    /// woken and exit with [RingError::Invalidated].
    pub fn invalidate(&self) {
        let mut state = self.state.lock();
        if state.invalid {
            return;
        }

        state.invalid = true;
        state.data = Vec::new();
        self.consumer.notify_all();
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use super::*;

    fn floats(range: std::ops::Range<usize>) -> Vec<f32> {
        range.map(|v| v as f32).collect()
    }

    #[test]
    fn test_wrap_is_invisible() {
        let ring = SampleRing::new(4);

        assert!(ring.push(&floats(0..100)).is_ok());
        assert_eq!(100, ring.len());

        let mut first = vec![0.0; 60];
        assert!(ring.pop(&mut first).is_ok());

        assert!(ring.push(&floats(100..180)).is_ok());

        let mut second = vec![0.0; 120];
        assert!(ring.pop(&mut second).is_ok());
        assert_eq!(0, ring.len());

        let mut removed = first;
        removed.extend_from_slice(&second);
        assert_eq!(floats(0..180), removed);
    }

    #[test]
    fn test_fifo_across_growth() {
        let ring = SampleRing::new(4);

        assert!(ring.push(&floats(0..10)).is_ok());
        let mut head = vec![0.0; 5];
        assert!(ring.pop(&mut head).is_ok());
        assert_eq!(floats(0..5), head);

        let big = floats(10..1_000_010);
        assert!(ring.push(&big).is_ok());

        let mut removed = head;
        let mut chunk = vec![0.0; 4096];
        while ring.len() >= chunk.len() {
            assert!(ring.pop(&mut chunk).is_ok());
            removed.extend_from_slice(&chunk);
        }
        let mut tail = vec![0.0; ring.len()];
        assert!(ring.pop(&mut tail).is_ok());
        removed.extend_from_slice(&tail);

        assert_eq!(floats(0..1_000_010), removed);
    }

    #[test]
    fn test_full_then_buffering_hysteresis() {
        let ring = SampleRing::new(2);

        // The first write sizes the ring at twice the write, so the second
        // and third fill it and the fourth is rejected.
        assert!(ring.push(&floats(0..8)).is_ok());
        assert!(ring.push(&floats(8..16)).is_ok());
        assert_eq!(Err(RingError::Full), ring.push(&floats(16..24)));

        // Buffering: writes keep failing until half the ring is free.
        let mut out = vec![0.0; 4];
        assert!(ring.pop(&mut out).is_ok());
        assert_eq!(Err(RingError::Full), ring.push(&floats(16..24)));

        let mut out = vec![0.0; 12];
        assert!(ring.pop(&mut out).is_ok());
        assert!(ring.push(&floats(16..24)).is_ok());
    }

    #[test]
    fn test_pop_blocking_waits_for_producer() {
        let ring = Arc::new(SampleRing::new(4));

        let join = {
            let ring = ring.clone();
            thread::spawn(move || {
                let mut out = vec![0.0; 10];
                let result = ring.pop_blocking(&mut out, Duration::from_secs(5));
                (result, out)
            })
        };

        thread::sleep(Duration::from_millis(20));
        assert!(ring.push(&floats(0..10)).is_ok());

        let (result, out) = join.join().expect("consumer panicked");
        assert!(result.is_ok());
        assert_eq!(floats(0..10), out);
    }

    #[test]
    fn test_pop_blocking_times_out() {
        let ring = SampleRing::new(4);
        let mut out = vec![0.0; 10];
        assert_eq!(
            Err(RingError::Empty),
            ring.pop_blocking(&mut out, Duration::from_millis(10))
        );
    }

    #[test]
    fn test_purge_wakes_without_progress() {
        let ring = Arc::new(SampleRing::new(4));
        assert!(ring.push(&floats(0..4)).is_ok());

        let join = {
            let ring = ring.clone();
            thread::spawn(move || {
                let mut out = vec![0.0; 10];
                ring.pop_blocking(&mut out, Duration::from_secs(5))
            })
        };

        thread::sleep(Duration::from_millis(20));
        ring.purge();
        assert_eq!(Err(RingError::Empty), join.join().expect("consumer panicked"));
        assert_eq!(0, ring.len());
    }

    #[test]
    fn test_invalidate_wakes_with_error() {
        let ring = Arc::new(SampleRing::new(4));

        let join = {
            let ring = ring.clone();
            thread::spawn(move || {
                let mut out = vec![0.0; 10];
                ring.pop_blocking(&mut out, Duration::from_secs(5))
            })
        };

        thread::sleep(Duration::from_millis(20));
        ring.invalidate();
        assert_eq!(
            Err(RingError::Invalidated),
            join.join().expect("consumer panicked")
        );
        assert_eq!(Err(RingError::Invalidated), ring.push(&[1.0]));
        let mut out = vec![0.0; 1];
        assert_eq!(Err(RingError::Invalidated), ring.pop(&mut out));
    }

    #[test]
    fn test_growth_requested_by_blocked_consumer() {
        let ring = Arc::new(SampleRing::new(4));

        // A consumer asking for more than the ring holds leaves a growth
        // request behind, so the next write can cover the whole read.
        let join = {
            let ring = ring.clone();
            thread::spawn(move || {
                let mut out = vec![0.0; 100];
                let result = ring.pop_blocking(&mut out, Duration::from_secs(5));
                (result, out)
            })
        };

        thread::sleep(Duration::from_millis(20));
        assert!(ring.push(&floats(0..100)).is_ok());

        let (result, out) = join.join().expect("consumer panicked");
        assert!(result.is_ok());
        assert_eq!(floats(0..100), out);
    }
}
