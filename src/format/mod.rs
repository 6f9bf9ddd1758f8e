//! Session audio format and PCM sample utilities.
//!
//! Every frame in a session carries interleaved little-endian integer PCM at
//! one fixed [`AudioFormat`]. This module provides:
//! - Format description and duration/frame arithmetic
//! - Gain application at dispatch time (master volume)
//! - Peak / RMS level measurement for the input meter

mod pcm;

pub use pcm::{apply_gain, measure_level, silence, Level, SILENCE_FLOOR_DB};

use std::fmt;
use std::time::Duration;

use crate::EngineError;

/// Bit depth of interleaved little-endian integer PCM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BitDepth {
    /// Signed 16-bit samples.
    #[default]
    Sixteen,
    /// Signed 24-bit samples, packed in 3 bytes.
    TwentyFour,
    /// Signed 32-bit samples.
    ThirtyTwo,
}

impl BitDepth {
    /// Returns the number of significant bits per sample.
    #[must_use]
    pub fn bits(self) -> u16 {
        match self {
            Self::Sixteen => 16,
            Self::TwentyFour => 24,
            Self::ThirtyTwo => 32,
        }
    }

    /// Returns the number of bytes one sample occupies in a payload.
    #[must_use]
    pub fn bytes_per_sample(self) -> usize {
        usize::from(self.bits() / 8)
    }
}

impl TryFrom<u16> for BitDepth {
    type Error = EngineError;

    fn try_from(bits: u16) -> Result<Self, Self::Error> {
        match bits {
            16 => Ok(Self::Sixteen),
            24 => Ok(Self::TwentyFour),
            32 => Ok(Self::ThirtyTwo),
            other => Err(EngineError::invalid_config(format!(
                "unsupported bit depth {other} (expected 16, 24 or 32)"
            ))),
        }
    }
}

/// Capture format shared by every frame of a session.
///
/// # Example
///
/// ```
/// use fanout_audio::format::{AudioFormat, BitDepth};
/// use std::time::Duration;
///
/// let format = AudioFormat::new(48000, 2, BitDepth::Sixteen);
/// assert_eq!(format.bytes_per_frame(), 4);
/// assert_eq!(format.frames_in(Duration::from_millis(10)), 480);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AudioFormat {
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Number of interleaved channels.
    pub channels: u16,
    /// Sample width.
    pub bit_depth: BitDepth,
}

impl AudioFormat {
    /// Creates a new format description.
    #[must_use]
    pub fn new(sample_rate: u32, channels: u16, bit_depth: BitDepth) -> Self {
        Self {
            sample_rate,
            channels,
            bit_depth,
        }
    }

    /// 44.1kHz stereo 16-bit.
    #[must_use]
    pub fn cd_quality() -> Self {
        Self::new(44100, 2, BitDepth::Sixteen)
    }

    /// 48kHz stereo 16-bit, the usual Windows shared-mode mix format.
    #[must_use]
    pub fn dvd_quality() -> Self {
        Self::new(48000, 2, BitDepth::Sixteen)
    }

    /// Returns the size in bytes of one sample frame (one sample per channel).
    #[must_use]
    pub fn bytes_per_frame(&self) -> usize {
        usize::from(self.channels) * self.bit_depth.bytes_per_sample()
    }

    /// Returns the number of sample frames in `duration`, rounded to nearest.
    #[must_use]
    pub fn frames_in(&self, duration: Duration) -> u64 {
        (duration.as_secs_f64() * f64::from(self.sample_rate)).round() as u64
    }

    /// Returns the playback duration of `frames` sample frames.
    #[must_use]
    pub fn duration_of(&self, frames: u64) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(frames as f64 / f64::from(self.sample_rate))
    }

    /// Checks that the format describes something a session can carry.
    pub fn validate(&self) -> Result<(), EngineError> {
        if !(8000..=384_000).contains(&self.sample_rate) {
            return Err(EngineError::invalid_config(format!(
                "sample rate {}Hz out of range (8000..=384000)",
                self.sample_rate
            )));
        }
        if self.channels == 0 || self.channels > 8 {
            return Err(EngineError::invalid_config(format!(
                "channel count {} out of range (1..=8)",
                self.channels
            )));
        }
        Ok(())
    }
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self::dvd_quality()
    }
}

impl fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}Hz/{}ch/{}bit",
            self.sample_rate,
            self.channels,
            self.bit_depth.bits()
        )
    }
}
