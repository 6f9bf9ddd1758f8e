//! Gain and level measurement over raw little-endian PCM payloads.

use super::BitDepth;

/// Effective silence floor in dBFS.
pub const SILENCE_FLOOR_DB: f32 = -96.0;

const I24_MAX: i32 = (1 << 23) - 1;
const I24_MIN: i32 = -(1 << 23);

/// Peak and RMS level of a block of samples, in dBFS.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Level {
    /// Peak absolute sample level.
    pub peak_db: f32,
    /// Root-mean-square level.
    pub rms_db: f32,
}

impl Level {
    /// Level reported for empty or all-zero input.
    pub const SILENT: Self = Self {
        peak_db: SILENCE_FLOOR_DB,
        rms_db: SILENCE_FLOOR_DB,
    };
}

fn full_scale(depth: BitDepth) -> f64 {
    match depth {
        BitDepth::Sixteen => f64::from(i16::MAX),
        BitDepth::TwentyFour => f64::from(I24_MAX),
        BitDepth::ThirtyTwo => f64::from(i32::MAX),
    }
}

fn read_sample(bytes: &[u8], depth: BitDepth) -> i32 {
    match depth {
        BitDepth::Sixteen => i32::from(i16::from_le_bytes([bytes[0], bytes[1]])),
        // Sign-extend by loading into the top three bytes and shifting back down.
        BitDepth::TwentyFour => i32::from_le_bytes([0, bytes[0], bytes[1], bytes[2]]) >> 8,
        BitDepth::ThirtyTwo => i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
    }
}

fn write_sample(out: &mut [u8], depth: BitDepth, value: i64) {
    match depth {
        BitDepth::Sixteen => {
            let v = value.clamp(i64::from(i16::MIN), i64::from(i16::MAX)) as i16;
            out.copy_from_slice(&v.to_le_bytes());
        }
        BitDepth::TwentyFour => {
            let v = value.clamp(i64::from(I24_MIN), i64::from(I24_MAX)) as i32;
            out.copy_from_slice(&v.to_le_bytes()[..3]);
        }
        BitDepth::ThirtyTwo => {
            let v = value.clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32;
            out.copy_from_slice(&v.to_le_bytes());
        }
    }
}

fn to_db(value: f64, depth: BitDepth) -> f32 {
    if value <= 0.0 {
        return SILENCE_FLOOR_DB;
    }
    let db = 20.0 * (value / full_scale(depth)).log10();
    (db as f32).max(SILENCE_FLOOR_DB)
}

/// Returns a copy of `payload` scaled by `gain`, saturating at full scale.
///
/// A trailing partial sample is copied through unchanged.
///
/// # Example
///
/// ```
/// use fanout_audio::format::{apply_gain, BitDepth};
///
/// let payload = 1000i16.to_le_bytes();
/// let scaled = apply_gain(&payload, BitDepth::Sixteen, 0.5);
/// assert_eq!(i16::from_le_bytes([scaled[0], scaled[1]]), 500);
/// ```
#[must_use]
pub fn apply_gain(payload: &[u8], depth: BitDepth, gain: f32) -> Vec<u8> {
    let width = depth.bytes_per_sample();
    let gain = f64::from(gain.max(0.0));
    let mut out = payload.to_vec();

    for chunk in out.chunks_exact_mut(width) {
        let sample = f64::from(read_sample(chunk, depth));
        write_sample(chunk, depth, (sample * gain).round() as i64);
    }

    out
}

/// Measures peak and RMS level of a payload.
#[must_use]
pub fn measure_level(payload: &[u8], depth: BitDepth) -> Level {
    let width = depth.bytes_per_sample();
    let mut peak: f64 = 0.0;
    let mut sum_squares: f64 = 0.0;
    let mut count: usize = 0;

    for chunk in payload.chunks_exact(width) {
        let sample = f64::from(read_sample(chunk, depth));
        peak = peak.max(sample.abs());
        sum_squares += sample * sample;
        count += 1;
    }

    if count == 0 {
        return Level::SILENT;
    }

    Level {
        peak_db: to_db(peak, depth),
        rms_db: to_db((sum_squares / count as f64).sqrt(), depth),
    }
}

/// Returns a zeroed payload of `frames` sample frames.
#[must_use]
pub fn silence(frames: usize, bytes_per_frame: usize) -> Vec<u8> {
    vec![0u8; frames * bytes_per_frame]
}
