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
use std::error::Error;
use std::path::Path;
use std::time::Duration;

use duration_string::DurationString;
use serde::Deserialize;

mod error;

pub use error::ConfigError;

const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(1);

/// A YAML representation of a capture session.
#[derive(Deserialize, Clone)]
pub struct Capture {
    /// The front end to capture with.
    frontend: String,

    /// Option string handed to the front end (see the front-end docs for
    /// the accepted keys).
    options: Option<String>,

    /// Center frequency in Hz (default: 400 MHz).
    frequency: Option<u32>,

    /// Normalized gain in [0, 1] (default: 0.5).
    gain: Option<f32>,

    /// Requested sample rate in Sa/s (default: 25 MSa/s). The front end may
    /// adjust it.
    sample_rate: Option<u32>,

    /// Reconstructed image width in pixels (default: 800).
    width: Option<usize>,

    /// Reconstructed image height in pixels (default: 600).
    height: Option<usize>,

    /// Display refresh rate in Hz (default: 60).
    refresh_rate: Option<f64>,

    /// Motion-blur accumulation factor in [0, 1) (default: 0, off).
    motion_blur: Option<f32>,

    /// Auto-gain endpoint smoothing factor (default: 0.01).
    gain_norm: Option<f32>,

    /// Run the motion-blur low-pass before sync detection (default: false).
    lowpass_before_sync: Option<bool>,

    /// Run auto-gain after the rest of the chain instead of before
    /// (default: true).
    autogain_after: Option<bool>,

    /// Use nearest-neighbor resampling instead of area integration
    /// (default: false).
    nearest_neighbour: Option<bool>,

    /// Synthesize a wider bandwidth by hopping the center frequency
    /// (default: false).
    super_bandwidth: Option<bool>,

    /// Fraction of dropped samples a batch tolerates before the front end
    /// aborts it (default: 0, any drop aborts).
    dropped_fraction_tolerated: Option<f64>,

    /// How long the consumer waits for a block before rechecking
    /// (default: 1s).
    read_timeout: Option<String>,
}

impl Capture {
    /// New will create a new Capture configuration.
    pub fn new(frontend: &str) -> Capture {
        Capture {
            frontend: frontend.to_string(),
            options: None,
            frequency: None,
            gain: None,
            sample_rate: None,
            width: None,
            height: None,
            refresh_rate: None,
            motion_blur: None,
            gain_norm: None,
            lowpass_before_sync: None,
            autogain_after: None,
            nearest_neighbour: None,
            super_bandwidth: None,
            dropped_fraction_tolerated: None,
            read_timeout: None,
        }
    }

    /// Loads a capture configuration from a file.
    pub fn load(path: &Path) -> Result<Capture, ConfigError> {
        let loaded = config::Config::builder()
            .add_source(config::File::from(path))
            .build()?;
        Ok(loaded.try_deserialize()?)
    }

    /// Returns the front end name from the configuration.
    pub fn frontend(&self) -> &str {
        &self.frontend
    }

    /// Returns the front-end option string.
    pub fn options(&self) -> &str {
        self.options.as_deref().unwrap_or("")
    }

    /// Returns the center frequency (default: 400 MHz).
    pub fn frequency(&self) -> u32 {
        self.frequency.unwrap_or(400_000_000)
    }

    /// Returns the normalized gain (default: 0.5).
    pub fn gain(&self) -> f32 {
        self.gain.unwrap_or(0.5)
    }

    /// Returns the requested sample rate (default: 25 MSa/s).
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate.unwrap_or(25_000_000)
    }

    /// Returns the image width (default: 800).
    pub fn width(&self) -> usize {
        self.width.unwrap_or(800)
    }

    /// Returns the image height (default: 600).
    pub fn height(&self) -> usize {
        self.height.unwrap_or(600)
    }

    /// Returns the refresh rate (default: 60 Hz).
    pub fn refresh_rate(&self) -> f64 {
        self.refresh_rate.unwrap_or(60.0)
    }

    /// Returns the motion-blur factor (default: 0).
    pub fn motion_blur(&self) -> f32 {
        self.motion_blur.unwrap_or(0.0)
    }

    /// Returns the auto-gain smoothing factor (default: 0.01).
    pub fn gain_norm(&self) -> f32 {
        self.gain_norm.unwrap_or(0.01)
    }

    /// Returns whether the low-pass runs before sync detection (default:
    /// false).
    pub fn lowpass_before_sync(&self) -> bool {
        self.lowpass_before_sync.unwrap_or(false)
    }

    /// Returns whether auto-gain runs after the chain (default: true).
    pub fn autogain_after(&self) -> bool {
        self.autogain_after.unwrap_or(true)
    }

    /// Returns whether nearest-neighbor resampling is selected (default:
    /// false).
    pub fn nearest_neighbour(&self) -> bool {
        self.nearest_neighbour.unwrap_or(false)
    }

    /// Returns whether super-bandwidth mode is on (default: false).
    pub fn super_bandwidth(&self) -> bool {
        self.super_bandwidth.unwrap_or(false)
    }

    /// Returns the tolerated dropped-sample fraction (default: 0).
    pub fn dropped_fraction_tolerated(&self) -> f64 {
        self.dropped_fraction_tolerated.unwrap_or(0.0)
    }

    /// Returns the consumer read timeout (default: 1s).
    pub fn read_timeout(&self) -> Result<Duration, Box<dyn Error>> {
        match &self.read_timeout {
            Some(read_timeout) => Ok(DurationString::from_string(read_timeout.clone())?.into()),
            None => Ok(DEFAULT_READ_TIMEOUT),
        }
    }
}

#[cfg(test)]
mod test {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_defaults() {
        let capture = Capture::new("simulator");
        assert_eq!("simulator", capture.frontend());
        assert_eq!("", capture.options());
        assert_eq!(400_000_000, capture.frequency());
        assert_eq!(0.5, capture.gain());
        assert_eq!(25_000_000, capture.sample_rate());
        assert_eq!(800, capture.width());
        assert_eq!(600, capture.height());
        assert_eq!(60.0, capture.refresh_rate());
        assert_eq!(0.0, capture.motion_blur());
        assert_eq!(0.01, capture.gain_norm());
        assert!(!capture.lowpass_before_sync());
        assert!(capture.autogain_after());
        assert!(!capture.nearest_neighbour());
        assert!(!capture.super_bandwidth());
        assert_eq!(0.0, capture.dropped_fraction_tolerated());
        assert_eq!(
            DEFAULT_READ_TIMEOUT,
            capture.read_timeout().expect("bad timeout")
        );
    }

    #[test]
    fn test_load_from_yaml() {
        let mut file = tempfile::Builder::new()
            .suffix(".yaml")
            .tempfile()
            .expect("tempfile");
        write!(
            file,
            r#"
frontend: simulator
options: "--rate 2e6"
frequency: 430000000
gain: 0.8
sample_rate: 2000000
width: 640
height: 480
refresh_rate: 59.94
motion_blur: 0.5
super_bandwidth: true
read_timeout: 250ms
"#
        )
        .expect("write failed");

        let capture = Capture::load(file.path()).expect("load failed");
        assert_eq!("simulator", capture.frontend());
        assert_eq!("--rate 2e6", capture.options());
        assert_eq!(430_000_000, capture.frequency());
        assert_eq!(0.8, capture.gain());
        assert_eq!(2_000_000, capture.sample_rate());
        assert_eq!(640, capture.width());
        assert_eq!(480, capture.height());
        assert_eq!(59.94, capture.refresh_rate());
        assert_eq!(0.5, capture.motion_blur());
        assert!(capture.super_bandwidth());
        assert_eq!(
            Duration::from_millis(250),
            capture.read_timeout().expect("bad timeout")
        );
    }

    #[test]
    fn test_load_missing_file_fails() {
        assert!(Capture::load(Path::new("/nonexistent/capture.yaml")).is_err());
    }
}
