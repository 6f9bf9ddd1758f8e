//! Mock capture device for testing without hardware.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::format::{AudioFormat, BitDepth};
use crate::source::CaptureDevice;
use crate::CaptureError;

#[derive(Default)]
struct MockState {
    stalled: AtomicBool,
    lost: Mutex<Option<String>>,
    unavailable: Mutex<Option<String>>,
    supported: Mutex<Option<Vec<AudioFormat>>>,
    frames: AtomicU64,
    opens: AtomicU64,
    closes: AtomicU64,
    open: AtomicBool,
}

/// Handle for scripting a [`MockCapture`] from the test side.
///
/// Cloneable; all clones drive the same device.
#[derive(Clone, Default)]
pub struct MockCaptureControl(Arc<MockState>);

impl MockCaptureControl {
    /// Stops delivering frames until [`resume`](Self::resume).
    pub fn stall(&self) {
        self.0.stalled.store(true, Ordering::SeqCst);
    }

    /// Delivers frames again after a stall, without a catch-up burst.
    pub fn resume(&self) {
        self.0.stalled.store(false, Ordering::SeqCst);
    }

    /// Makes the next poll fail with [`CaptureError::DeviceLost`].
    ///
    /// The loss persists until the device is re-opened.
    pub fn lose(&self, reason: &str) {
        *self.0.lost.lock() = Some(reason.to_string());
    }

    /// Makes `open` fail with [`CaptureError::DeviceUnavailable`] while set.
    pub fn set_unavailable(&self, reason: Option<&str>) {
        *self.0.unavailable.lock() = reason.map(str::to_string);
    }

    /// Restricts the formats `open` accepts. `None` accepts everything.
    pub fn set_supported_formats(&self, formats: Option<Vec<AudioFormat>>) {
        *self.0.supported.lock() = formats;
    }

    /// Frames delivered since creation.
    pub fn frames_delivered(&self) -> u64 {
        self.0.frames.load(Ordering::SeqCst)
    }

    /// Number of successful `open` calls.
    pub fn open_count(&self) -> u64 {
        self.0.opens.load(Ordering::SeqCst)
    }

    /// Number of `close` calls on an open device.
    pub fn close_count(&self) -> u64 {
        self.0.closes.load(Ordering::SeqCst)
    }

    /// Returns `true` while the device is open.
    pub fn is_open(&self) -> bool {
        self.0.open.load(Ordering::SeqCst)
    }
}

/// A mock capture device that generates a sine tone.
///
/// By default frames are paced in real time at the configured frame
/// duration, like a loopback endpoint would deliver them. Use
/// [`unpaced`](Self::unpaced) to get frames as fast as they are polled.
///
/// # Example
///
/// ```
/// use fanout_audio::source::{CaptureDevice, MockCapture};
/// use fanout_audio::format::AudioFormat;
/// use std::time::Duration;
///
/// let mut mock = MockCapture::new(Duration::from_millis(10)).unpaced();
/// let control = mock.control();
///
/// mock.open(&AudioFormat::dvd_quality()).unwrap();
/// let payload = mock.poll_frame(Duration::from_millis(10)).unwrap().unwrap();
/// assert_eq!(payload.len(), 480 * 4);
/// assert_eq!(control.frames_delivered(), 1);
/// ```
pub struct MockCapture {
    control: MockCaptureControl,
    frame_duration: Duration,
    frequency: f64,
    paced: bool,
    format: Option<AudioFormat>,
    next_due: Option<Instant>,
    phase: u64,
}

impl MockCapture {
    /// Creates a paced 440Hz tone generator.
    pub fn new(frame_duration: Duration) -> Self {
        Self {
            control: MockCaptureControl::default(),
            frame_duration,
            frequency: 440.0,
            paced: true,
            format: None,
            next_due: None,
            phase: 0,
        }
    }

    /// Delivers frames immediately instead of in real time.
    #[must_use]
    pub fn unpaced(mut self) -> Self {
        self.paced = false;
        self
    }

    /// Sets the tone frequency.
    #[must_use]
    pub fn with_frequency(mut self, frequency: f64) -> Self {
        self.frequency = frequency;
        self
    }

    /// Returns a control handle for scripting stalls, loss and failures.
    pub fn control(&self) -> MockCaptureControl {
        self.control.clone()
    }

    fn generate(&mut self, format: AudioFormat) -> Vec<u8> {
        let frames = format.frames_in(self.frame_duration).max(1);
        let width = format.bit_depth.bytes_per_sample();
        let mut payload = Vec::with_capacity(frames as usize * format.bytes_per_frame());
        let rate = f64::from(format.sample_rate);

        for i in 0..frames {
            let t = (self.phase + i) as f64 / rate;
            let value = 0.5 * (2.0 * std::f64::consts::PI * self.frequency * t).sin();
            let bytes = encode(value, format.bit_depth);
            for _ in 0..format.channels {
                payload.extend_from_slice(&bytes[..width]);
            }
        }

        self.phase += frames;
        payload
    }
}

fn encode(value: f64, depth: BitDepth) -> [u8; 4] {
    match depth {
        BitDepth::Sixteen => {
            let v = (value * f64::from(i16::MAX)) as i16;
            let b = v.to_le_bytes();
            [b[0], b[1], 0, 0]
        }
        BitDepth::TwentyFour => ((value * f64::from((1 << 23) - 1)) as i32).to_le_bytes(),
        BitDepth::ThirtyTwo => ((value * f64::from(i32::MAX)) as i32).to_le_bytes(),
    }
}

impl CaptureDevice for MockCapture {
    fn name(&self) -> &str {
        "mock-capture"
    }

    fn open(&mut self, format: &AudioFormat) -> Result<(), CaptureError> {
        let state = &self.control.0;
        if let Some(reason) = state.unavailable.lock().clone() {
            return Err(CaptureError::DeviceUnavailable(reason));
        }
        if let Some(ref supported) = *state.supported.lock() {
            if !supported.contains(format) {
                return Err(CaptureError::FormatUnsupported(format.to_string()));
            }
        }

        *state.lost.lock() = None;
        state.open.store(true, Ordering::SeqCst);
        state.opens.fetch_add(1, Ordering::SeqCst);
        self.format = Some(*format);
        self.next_due = None;
        Ok(())
    }

    fn poll_frame(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>, CaptureError> {
        let Some(format) = self.format else {
            return Err(CaptureError::DeviceLost("not open".into()));
        };
        if let Some(reason) = self.control.0.lost.lock().clone() {
            return Err(CaptureError::DeviceLost(reason));
        }
        if self.control.0.stalled.load(Ordering::SeqCst) {
            // Re-anchor pacing so resuming does not burst.
            self.next_due = None;
            std::thread::sleep(timeout);
            return Ok(None);
        }

        if self.paced {
            let now = Instant::now();
            let due = *self.next_due.get_or_insert(now);
            if due > now {
                let wait = due - now;
                if wait > timeout {
                    std::thread::sleep(timeout);
                    return Ok(None);
                }
                std::thread::sleep(wait);
            }
            self.next_due = Some(due + self.frame_duration);
        }

        self.control.0.frames.fetch_add(1, Ordering::SeqCst);
        Ok(Some(self.generate(format)))
    }

    fn close(&mut self) {
        if self.format.take().is_some() {
            self.control.0.open.store(false, Ordering::SeqCst);
            self.control.0.closes.fetch_add(1, Ordering::SeqCst);
        }
    }
}
