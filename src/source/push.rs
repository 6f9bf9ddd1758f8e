//! Adapter for callback-driven capture APIs.
//!
//! Platform loopback APIs usually hand out audio on their own high-priority
//! callback thread. [`CaptureFeed`] is the half that lives in that callback:
//! it copies bytes into a lock-free SPSC ring and never blocks. [`PushCapture`]
//! is the [`CaptureDevice`] half that the producer context polls for whole
//! frames.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};

use crate::format::AudioFormat;
use crate::source::CaptureDevice;
use crate::CaptureError;

struct FeedShared {
    lock: Mutex<()>,
    ready: Condvar,
    open: AtomicBool,
    lost: Mutex<Option<String>>,
    dropped_bytes: AtomicU64,
}

/// Callback-side half of a [`PushCapture`].
pub struct CaptureFeed {
    producer: HeapProd<u8>,
    shared: Arc<FeedShared>,
}

impl CaptureFeed {
    /// Copies captured PCM bytes into the capture ring.
    ///
    /// Returns the number of bytes accepted. Bytes that do not fit are
    /// dropped and counted; data pushed while the device is closed is
    /// discarded. Nothing is logged here: overflow is reported by the
    /// polling side.
    pub fn push(&mut self, data: &[u8]) -> usize {
        if !self.shared.open.load(Ordering::Acquire) {
            return 0;
        }

        let accepted = self.producer.push_slice(data);
        if accepted < data.len() {
            let dropped = (data.len() - accepted) as u64;
            self.shared
                .dropped_bytes
                .fetch_add(dropped, Ordering::Relaxed);
        }

        // Taking the lock pairs with the waiter's check-then-wait.
        let _guard = self.shared.lock.lock();
        self.shared.ready.notify_one();
        accepted
    }

    /// Reports that the platform endpoint disappeared.
    pub fn report_lost(&self, reason: impl Into<String>) {
        *self.shared.lost.lock() = Some(reason.into());
        let _guard = self.shared.lock.lock();
        self.shared.ready.notify_one();
    }

    /// Bytes dropped because the capture ring was full.
    pub fn dropped_bytes(&self) -> u64 {
        self.shared.dropped_bytes.load(Ordering::Relaxed)
    }
}

/// A [`CaptureDevice`] fed by a platform callback through a [`CaptureFeed`].
///
/// The device only supports its native format: loopback capture delivers
/// whatever the system mixer produces.
///
/// # Example
///
/// ```
/// use fanout_audio::source::{CaptureDevice, PushCapture};
/// use fanout_audio::format::AudioFormat;
/// use std::time::Duration;
///
/// let format = AudioFormat::dvd_quality();
/// let (mut capture, mut feed) =
///     PushCapture::new(format, Duration::from_millis(10), Duration::from_secs(1));
///
/// capture.open(&format).unwrap();
/// feed.push(&vec![0u8; 480 * 4]);
///
/// let frame = capture.poll_frame(Duration::from_millis(10)).unwrap();
/// assert_eq!(frame.map(|f| f.len()), Some(480 * 4));
/// ```
pub struct PushCapture {
    native: AudioFormat,
    frame_bytes: usize,
    consumer: HeapCons<u8>,
    shared: Arc<FeedShared>,
    reported_drops: u64,
}

impl PushCapture {
    /// Creates the device and its feed.
    ///
    /// `frame_duration` sets how much audio one polled frame carries;
    /// `buffer` sets how much the callback may run ahead of the poller.
    pub fn new(native: AudioFormat, frame_duration: Duration, buffer: Duration) -> (Self, CaptureFeed) {
        let bytes_per_frame = native.bytes_per_frame().max(1);
        let frame_bytes = native.frames_in(frame_duration).max(1) as usize * bytes_per_frame;
        let capacity = (native.frames_in(buffer) as usize * bytes_per_frame).max(frame_bytes * 2);

        let (producer, consumer) = HeapRb::<u8>::new(capacity).split();
        let shared = Arc::new(FeedShared {
            lock: Mutex::new(()),
            ready: Condvar::new(),
            open: AtomicBool::new(false),
            lost: Mutex::new(None),
            dropped_bytes: AtomicU64::new(0),
        });

        let capture = Self {
            native,
            frame_bytes,
            consumer,
            shared: Arc::clone(&shared),
            reported_drops: 0,
        };
        (capture, CaptureFeed { producer, shared })
    }

    /// The only format this device delivers.
    pub fn native_format(&self) -> AudioFormat {
        self.native
    }

    /// Logs bytes the feed dropped since the last call and returns them.
    fn report_drops(&mut self) -> u64 {
        let total = self.shared.dropped_bytes.load(Ordering::Relaxed);
        let dropped = total - self.reported_drops;
        if dropped > 0 {
            self.reported_drops = total;
            tracing::warn!(dropped, total, "capture ring overflowed, captured audio dropped");
        }
        dropped
    }

    fn pop_frame(&mut self) -> Vec<u8> {
        let mut frame = vec![0u8; self.frame_bytes];
        let read = self.consumer.pop_slice(&mut frame);
        frame.truncate(read);
        frame
    }
}

impl CaptureDevice for PushCapture {
    fn name(&self) -> &str {
        "push-capture"
    }

    fn open(&mut self, format: &AudioFormat) -> Result<(), CaptureError> {
        if *format != self.native {
            return Err(CaptureError::FormatUnsupported(format!(
                "{format} (device delivers {})",
                self.native
            )));
        }
        self.consumer.clear();
        *self.shared.lost.lock() = None;
        self.shared.open.store(true, Ordering::Release);
        Ok(())
    }

    fn poll_frame(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>, CaptureError> {
        if !self.shared.open.load(Ordering::Acquire) {
            return Err(CaptureError::DeviceLost("not open".into()));
        }
        self.report_drops();

        let deadline = Instant::now() + timeout;
        let mut guard = self.shared.lock.lock();
        loop {
            if let Some(reason) = self.shared.lost.lock().clone() {
                return Err(CaptureError::DeviceLost(reason));
            }
            if self.consumer.occupied_len() >= self.frame_bytes {
                drop(guard);
                return Ok(Some(self.pop_frame()));
            }
            if self
                .shared
                .ready
                .wait_until(&mut guard, deadline)
                .timed_out()
            {
                return Ok(None);
            }
        }
    }

    fn close(&mut self) {
        self.shared.open.store(false, Ordering::Release);
    }
}
