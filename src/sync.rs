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

/// Dimensions of the frame under analysis.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameGeometry {
    pub width: usize,
    pub height: usize,
}

/// Outcome of one sync-detection pass.
#[derive(Clone, Copy, Debug, Default)]
pub struct SyncDecision {
    /// True when the detector wrote a re-framed image into the corrected
    /// buffer; false when the input should be displayed unchanged.
    pub use_corrected: bool,
    /// Signed sample offsets the ingest path should shift by so the next
    /// frame starts on the detected blanking edges.
    pub horizontal_offset: i64,
    pub vertical_offset: i64,
}

/// Locates the horizontal and vertical blanking regions of a frame from its
/// row and column projections. The post-processor treats this as a pure
/// function over the projection vectors; implementations may keep their own
/// state across frames.
pub trait SyncDetector: Send {
    /// `supersampling` tells the detector whether sub-pixel interpolation is
    /// meaningful for this frame; `refine_pass` distinguishes the raw-frame
    /// pass from the accumulated-frame pass.
    #[allow(clippy::too_many_arguments)]
    fn detect(
        &mut self,
        frame: &[f32],
        corrected: &mut [f32],
        geometry: FrameGeometry,
        width_profile: &[f32],
        height_profile: &[f32],
        supersampling: bool,
        refine_pass: bool,
    ) -> SyncDecision;
}

/// Pass-through detector: never re-frames and reports no offsets.
pub struct NoSync;

impl SyncDetector for NoSync {
    fn detect(
        &mut self,
        _: &[f32],
        _: &mut [f32],
        _: FrameGeometry,
        _: &[f32],
        _: &[f32],
        _: bool,
        _: bool,
    ) -> SyncDecision {
        SyncDecision::default()
    }
}
