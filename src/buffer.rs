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
mod ring;
mod scratch;

pub use ring::{RingError, SampleRing};
pub use scratch::{Sample, ScratchBuffer};

/// Growth coefficient for rings that may lag behind the producer for a while,
/// such as the frame-rate detector's ingest ring.
pub const SIZE_COEFF_HIGH_LATENCY: usize = 10;

/// Growth coefficient for the main ingest ring, where latency matters more
/// than resilience to slow consumers.
pub const SIZE_COEFF_LOW_LATENCY: usize = 4;
