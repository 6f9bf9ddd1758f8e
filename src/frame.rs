//! Captured audio frame with sequencing metadata.

use std::sync::Arc;
use std::time::Duration;

use crate::format::AudioFormat;

/// One immutable block of captured audio.
///
/// `AudioFrame` is the unit that moves through the fan-out pipeline: the
/// capture source stamps it with a monotonic sequence number and a capture
/// timestamp, the ring buffer stores it, and every sink hands the same frame
/// to its transport.
///
/// The payload is `Arc`-wrapped so that cloning a frame for several sinks
/// never copies samples.
///
/// # Example
///
/// ```
/// use fanout_audio::{AudioFrame, format::AudioFormat};
/// use std::time::Duration;
///
/// let format = AudioFormat::dvd_quality();
/// let frame = AudioFrame::new(7, Duration::from_millis(70), vec![0u8; 1920], format);
/// assert_eq!(frame.sequence(), 7);
/// assert_eq!(frame.sample_count(), 480);
/// assert_eq!(frame.duration(), Duration::from_millis(10));
/// ```
#[derive(Debug, Clone)]
pub struct AudioFrame {
    sequence: u64,
    timestamp: Duration,
    payload: Arc<[u8]>,
    sample_count: u32,
    format: AudioFormat,
}

impl AudioFrame {
    /// Creates a frame from interleaved PCM bytes.
    ///
    /// `sample_count` is derived from the payload length; a trailing partial
    /// sample frame is kept in the payload but not counted.
    pub fn new(sequence: u64, timestamp: Duration, payload: Vec<u8>, format: AudioFormat) -> Self {
        let bytes_per_frame = format.bytes_per_frame().max(1);
        let sample_count = (payload.len() / bytes_per_frame) as u32;
        Self {
            sequence,
            timestamp,
            payload: payload.into(),
            sample_count,
            format,
        }
    }

    /// Returns a frame with the same sequence and timestamp but a new payload.
    ///
    /// Used at dispatch to apply gain without touching the stored frame.
    #[must_use]
    pub fn with_payload(&self, payload: Vec<u8>) -> Self {
        Self::new(self.sequence, self.timestamp, payload, self.format)
    }

    /// Monotonic sequence number within the session.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Capture time, measured on the monotonic clock from session start.
    pub fn timestamp(&self) -> Duration {
        self.timestamp
    }

    /// Interleaved little-endian PCM bytes.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Number of sample frames (one sample per channel) in the payload.
    pub fn sample_count(&self) -> u32 {
        self.sample_count
    }

    /// Format of the payload.
    pub fn format(&self) -> AudioFormat {
        self.format
    }

    /// Playback duration of this frame.
    pub fn duration(&self) -> Duration {
        self.format.duration_of(u64::from(self.sample_count))
    }

    /// Returns `true` if every payload byte is zero.
    pub fn is_silent(&self) -> bool {
        self.payload.iter().all(|&b| b == 0)
    }
}
