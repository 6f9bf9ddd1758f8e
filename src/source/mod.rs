//! Capture collaborator interface and the frame-stamping capture source.
//!
//! The platform capture (WASAPI loopback, `ScreenCaptureKit`, PulseAudio
//! monitor, ...) is an external collaborator implementing [`CaptureDevice`].
//! [`CaptureSource`] wraps it and turns raw PCM blocks into sequenced,
//! timestamped [`AudioFrame`]s for the ring buffer.
//!
//! Two implementations ship with the crate:
//! - [`PushCapture`]: adapter for callback-driven platform APIs
//! - [`MockCapture`]: deterministic tone generator for tests and demos

mod mock;
mod push;

pub use mock::{MockCapture, MockCaptureControl};
pub use push::{CaptureFeed, PushCapture};

use std::time::{Duration, Instant};

use crate::format::{self, AudioFormat};
use crate::{AudioFrame, CaptureError};

/// Platform capture collaborator.
///
/// Calls are blocking and come from one dedicated producer context, never
/// from an async task.
pub trait CaptureDevice: Send {
    /// Human-readable name for logging.
    fn name(&self) -> &str;

    /// Opens the endpoint at `format`.
    ///
    /// Fails with [`CaptureError::DeviceUnavailable`] or
    /// [`CaptureError::FormatUnsupported`].
    fn open(&mut self, format: &AudioFormat) -> Result<(), CaptureError>;

    /// Waits up to `timeout` for the next block of interleaved PCM.
    ///
    /// Returns `Ok(None)` on timeout and [`CaptureError::DeviceLost`] when
    /// the endpoint disappeared.
    fn poll_frame(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>, CaptureError>;

    /// Releases the endpoint. Must be safe to call when not open.
    fn close(&mut self);
}

/// Outcome of [`CaptureSource::next_frame`].
#[derive(Debug)]
pub enum CapturePoll {
    /// A new frame was captured.
    Frame(AudioFrame),
    /// Nothing arrived within the timeout.
    Timeout,
    /// The device is gone.
    Lost(CaptureError),
}

/// Turns a [`CaptureDevice`] into a restartable sequence of [`AudioFrame`]s.
///
/// Sequence numbers start at 0 on every [`start`](Self::start) and increase by
/// one per frame, including synthesized silence frames. Timestamps come from
/// the monotonic clock, relative to the start call.
pub struct CaptureSource {
    device: Box<dyn CaptureDevice>,
    format: Option<AudioFormat>,
    next_sequence: u64,
    epoch: Instant,
}

impl CaptureSource {
    /// Wraps a capture collaborator. Nothing is opened yet.
    pub fn new(device: Box<dyn CaptureDevice>) -> Self {
        Self {
            device,
            format: None,
            next_sequence: 0,
            epoch: Instant::now(),
        }
    }

    /// Name of the underlying device.
    pub fn name(&self) -> &str {
        self.device.name()
    }

    /// Opens the device at `format` and resets sequencing.
    ///
    /// A running source is stopped first, which makes this the restart path.
    pub fn start(&mut self, format: AudioFormat) -> Result<(), CaptureError> {
        if self.is_running() {
            self.stop();
        }
        self.device.open(&format)?;
        self.format = Some(format);
        self.next_sequence = 0;
        self.epoch = Instant::now();
        tracing::info!(device = self.device.name(), %format, "capture started");
        Ok(())
    }

    /// Closes and re-opens the device after a loss, keeping sequence numbering.
    pub fn reopen(&mut self) -> Result<(), CaptureError> {
        let format = self
            .format
            .ok_or_else(|| CaptureError::DeviceUnavailable("capture was never started".into()))?;
        self.device.close();
        self.device.open(&format)
    }

    /// Returns `true` between [`start`](Self::start) and [`stop`](Self::stop).
    pub fn is_running(&self) -> bool {
        self.format.is_some()
    }

    /// Format negotiated by the last successful start.
    pub fn format(&self) -> Option<AudioFormat> {
        self.format
    }

    /// Sequence number the next frame will carry.
    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }

    /// Time elapsed since the source was started.
    pub fn elapsed(&self) -> Duration {
        self.epoch.elapsed()
    }

    /// Waits up to `timeout` for the next captured frame.
    pub fn next_frame(&mut self, timeout: Duration) -> CapturePoll {
        let Some(format) = self.format else {
            return CapturePoll::Lost(CaptureError::DeviceLost("capture not started".into()));
        };

        match self.device.poll_frame(timeout) {
            Ok(Some(mut payload)) => {
                let bytes_per_frame = format.bytes_per_frame();
                let whole = payload.len() - payload.len() % bytes_per_frame;
                if whole != payload.len() {
                    tracing::warn!(
                        device = self.device.name(),
                        len = payload.len(),
                        bytes_per_frame,
                        "capture delivered a partial sample frame; truncating"
                    );
                    payload.truncate(whole);
                }
                if payload.is_empty() {
                    return CapturePoll::Timeout;
                }
                CapturePoll::Frame(self.stamp(payload, format))
            }
            Ok(None) => CapturePoll::Timeout,
            Err(err) => CapturePoll::Lost(err),
        }
    }

    /// Synthesizes a silent frame of `duration` in the sequence.
    ///
    /// Returns `None` when the source is not running.
    pub fn silence_frame(&mut self, duration: Duration) -> Option<AudioFrame> {
        let format = self.format?;
        let frames = format.frames_in(duration).max(1) as usize;
        let payload = format::silence(frames, format.bytes_per_frame());
        Some(self.stamp(payload, format))
    }

    /// Releases the device. Idempotent.
    pub fn stop(&mut self) {
        if self.format.take().is_some() {
            self.device.close();
            tracing::info!(device = self.device.name(), "capture stopped");
        }
    }

    fn stamp(&mut self, payload: Vec<u8>, format: AudioFormat) -> AudioFrame {
        let frame = AudioFrame::new(self.next_sequence, self.epoch.elapsed(), payload, format);
        self.next_sequence += 1;
        frame
    }
}

impl Drop for CaptureSource {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mock_source() -> (CaptureSource, MockCaptureControl) {
        let mock = MockCapture::new(Duration::from_millis(10)).unpaced();
        let control = mock.control();
        (CaptureSource::new(Box::new(mock)), control)
    }

    #[test]
    fn test_frames_are_sequenced() {
        let (mut source, _control) = mock_source();
        source.start(AudioFormat::dvd_quality()).unwrap();

        for expected in 0..5 {
            match source.next_frame(Duration::from_millis(10)) {
                CapturePoll::Frame(frame) => {
                    assert_eq!(frame.sequence(), expected);
                    assert_eq!(frame.sample_count(), 480);
                }
                other => panic!("expected frame, got {other:?}"),
            }
        }
        assert_eq!(source.next_sequence(), 5);
    }

    #[test]
    fn test_timestamps_are_monotonic() {
        let (mut source, _control) = mock_source();
        source.start(AudioFormat::dvd_quality()).unwrap();

        let mut last = Duration::ZERO;
        for _ in 0..10 {
            if let CapturePoll::Frame(frame) = source.next_frame(Duration::from_millis(10)) {
                assert!(frame.timestamp() >= last);
                last = frame.timestamp();
            }
        }
    }

    #[test]
    fn test_silence_frame_takes_a_sequence_number() {
        let (mut source, _control) = mock_source();
        source.start(AudioFormat::dvd_quality()).unwrap();

        let silent = source.silence_frame(Duration::from_millis(10)).unwrap();
        assert_eq!(silent.sequence(), 0);
        assert!(silent.is_silent());
        assert_eq!(silent.sample_count(), 480);

        match source.next_frame(Duration::from_millis(10)) {
            CapturePoll::Frame(frame) => assert_eq!(frame.sequence(), 1),
            other => panic!("expected frame, got {other:?}"),
        }
    }

    #[test]
    fn test_restart_resets_sequence() {
        let (mut source, control) = mock_source();
        source.start(AudioFormat::dvd_quality()).unwrap();
        let _ = source.next_frame(Duration::from_millis(10));
        let _ = source.next_frame(Duration::from_millis(10));
        source.stop();
        assert!(!source.is_running());
        assert_eq!(control.close_count(), 1);

        source.start(AudioFormat::dvd_quality()).unwrap();
        match source.next_frame(Duration::from_millis(10)) {
            CapturePoll::Frame(frame) => assert_eq!(frame.sequence(), 0),
            other => panic!("expected frame, got {other:?}"),
        }
        assert_eq!(control.open_count(), 2);
    }

    #[test]
    fn test_start_propagates_open_errors() {
        let (mut source, control) = mock_source();
        control.set_unavailable(Some("no render endpoint"));
        assert!(matches!(
            source.start(AudioFormat::dvd_quality()),
            Err(CaptureError::DeviceUnavailable(_))
        ));
        assert!(!source.is_running());
    }

    #[test]
    fn test_loss_is_reported() {
        let (mut source, control) = mock_source();
        source.start(AudioFormat::dvd_quality()).unwrap();
        control.lose("endpoint removed");
        assert!(matches!(
            source.next_frame(Duration::from_millis(10)),
            CapturePoll::Lost(CaptureError::DeviceLost(_))
        ));

        source.reopen().unwrap();
        assert!(matches!(
            source.next_frame(Duration::from_millis(10)),
            CapturePoll::Frame(_)
        ));
    }

    #[test]
    fn test_next_frame_before_start() {
        let (mut source, _control) = mock_source();
        assert!(matches!(
            source.next_frame(Duration::from_millis(1)),
            CapturePoll::Lost(_)
        ));
        assert!(source.silence_frame(Duration::from_millis(10)).is_none());
    }
}
