//! Single-writer, multi-reader frame ring.
//!
//! The writer never waits for readers. Each reader owns a cursor (the
//! sequence number of the next frame it wants) that the writer only inspects
//! with atomic loads for lag detection. A reader the writer has overtaken
//! gets [`ReadResult::Lagged`] and resumes at the oldest frame still stored:
//! it drops frames instead of slowing capture down.
//!
//! The write path takes no locks. Slots are `ArcSwapOption`s, so storing a
//! frame and handing one to a reader are single atomic swaps and loads. The
//! reader registry is a copy-on-write list: the writer only loads a snapshot,
//! while registering or dropping a cursor publishes a new list.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::{ArcSwap, ArcSwapOption};
use tokio::sync::futures::Notified;
use tokio::sync::Notify;

use crate::AudioFrame;

/// Outcome of [`RingBuffer::read_at`] and [`ReadCursor::read`].
#[derive(Debug, Clone)]
pub enum ReadResult {
    /// The requested frame.
    Frame(Arc<AudioFrame>),
    /// The requested sequence number has not been written yet.
    NotYetAvailable,
    /// The requested frame was overwritten; resume at the contained sequence.
    Lagged(u64),
}

/// Result of one [`RingBuffer::write`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteOutcome {
    /// Sequence number that was written.
    pub sequence: u64,
    /// Readers newly marked as lagging by this write.
    pub lagged_readers: usize,
}

struct ReaderState {
    next: AtomicU64,
    lagging: AtomicBool,
}

/// Fixed-capacity frame ring shared by one writer and any number of readers.
///
/// # Example
///
/// ```
/// use fanout_audio::{AudioFrame, RingBuffer, ReadResult, format::AudioFormat};
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// let ring = Arc::new(RingBuffer::new(4));
/// let mut cursor = ring.cursor_at(0);
///
/// let format = AudioFormat::dvd_quality();
/// ring.write(AudioFrame::new(0, Duration::ZERO, vec![0; 4], format));
///
/// assert!(matches!(cursor.read(), ReadResult::Frame(f) if f.sequence() == 0));
/// assert!(matches!(cursor.read(), ReadResult::NotYetAvailable));
/// ```
pub struct RingBuffer {
    slots: Box<[ArcSwapOption<AudioFrame>]>,
    mask: u64,
    /// Sequence number of the next frame to be written.
    head: AtomicU64,
    readers: ArcSwap<Vec<Arc<ReaderState>>>,
    wake: Notify,
}

impl RingBuffer {
    /// Creates a ring holding at least `min_slots` frames.
    ///
    /// Capacity is rounded up to a power of two (minimum 2).
    pub fn new(min_slots: usize) -> Self {
        let capacity = min_slots.max(2).next_power_of_two();
        let slots = (0..capacity).map(|_| ArcSwapOption::empty()).collect();
        Self {
            slots,
            mask: capacity as u64 - 1,
            head: AtomicU64::new(0),
            readers: ArcSwap::from_pointee(Vec::new()),
            wake: Notify::new(),
        }
    }

    /// Number of frame slots.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Sequence number the next write will carry (= frames written so far).
    pub fn head(&self) -> u64 {
        self.head.load(Ordering::Acquire)
    }

    /// Oldest sequence number still stored.
    pub fn oldest_available(&self) -> u64 {
        self.head().saturating_sub(self.capacity() as u64)
    }

    /// Number of registered reader cursors.
    pub fn reader_count(&self) -> usize {
        self.readers.load().len()
    }

    /// Stores a frame, overwriting the oldest slot if the ring is full.
    ///
    /// Never blocks on readers. Any reader whose next frame is the one being
    /// overwritten is marked lagging. Frames must arrive in sequence order
    /// starting at 0; only the single capture producer calls this.
    pub fn write(&self, frame: AudioFrame) -> WriteOutcome {
        let sequence = frame.sequence();
        debug_assert_eq!(
            sequence,
            self.head.load(Ordering::Relaxed),
            "frames must be written in sequence order"
        );

        let capacity = self.capacity() as u64;
        let mut lagged_readers = 0;
        if sequence >= capacity {
            let evicted = sequence - capacity;
            for reader in self.readers.load().iter() {
                if reader.next.load(Ordering::Acquire) <= evicted
                    && !reader.lagging.swap(true, Ordering::AcqRel)
                {
                    lagged_readers += 1;
                }
            }
        }

        let slot = &self.slots[(sequence & self.mask) as usize];
        let evicted_frame = slot.swap(Some(Arc::new(frame)));
        self.head.store(sequence + 1, Ordering::Release);
        self.wake.notify_waiters();
        drop(evicted_frame);

        WriteOutcome {
            sequence,
            lagged_readers,
        }
    }

    /// Looks up the frame with sequence number `sequence` without moving any cursor.
    pub fn read_at(&self, sequence: u64) -> ReadResult {
        let head = self.head();
        if sequence >= head {
            return ReadResult::NotYetAvailable;
        }

        let oldest = head.saturating_sub(self.capacity() as u64);
        if sequence < oldest {
            return ReadResult::Lagged(oldest);
        }

        let frame = self.slots[(sequence & self.mask) as usize].load_full();
        match frame {
            Some(frame) if frame.sequence() == sequence => ReadResult::Frame(frame),
            // Overwritten between the head load and the slot read.
            _ => ReadResult::Lagged((sequence + 1).max(self.oldest_available())),
        }
    }

    /// Registers a reader positioned at `sequence`, clamped to the stored range.
    pub fn cursor_at(self: &Arc<Self>, sequence: u64) -> ReadCursor {
        let start = sequence.clamp(self.oldest_available(), self.head());
        let state = Arc::new(ReaderState {
            next: AtomicU64::new(start),
            lagging: AtomicBool::new(false),
        });
        self.readers.rcu(|readers| {
            let mut readers = (**readers).clone();
            readers.push(Arc::clone(&state));
            readers
        });
        ReadCursor {
            ring: Arc::clone(self),
            state,
        }
    }

    /// Share of capacity between the slowest non-lagging reader and the writer.
    ///
    /// With no readers this is the share of slots holding frames. Returns 0-100.
    pub fn fill_percent(&self) -> f32 {
        let head = self.head();
        let oldest = head.saturating_sub(self.capacity() as u64);
        let slowest = self
            .readers
            .load()
            .iter()
            .filter(|r| !r.lagging.load(Ordering::Acquire))
            .map(|r| r.next.load(Ordering::Acquire).clamp(oldest, head))
            .min()
            .unwrap_or(oldest);
        (head - slowest) as f32 / self.capacity() as f32 * 100.0
    }

    /// Returns a future completed by the next write or [`wake_all`](Self::wake_all).
    ///
    /// Create (and `enable`) it before checking the ring to avoid missing a wake.
    pub fn notified(&self) -> Notified<'_> {
        self.wake.notified()
    }

    /// Wakes every reader waiting in [`notified`](Self::notified).
    pub fn wake_all(&self) {
        self.wake.notify_waiters();
    }
}

impl std::fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingBuffer")
            .field("capacity", &self.capacity())
            .field("head", &self.head())
            .field("readers", &self.reader_count())
            .finish()
    }
}

/// One reader's position in a [`RingBuffer`].
///
/// Dropping the cursor unregisters it, so the writer stops considering it
/// for lag detection and fill reporting.
pub struct ReadCursor {
    ring: Arc<RingBuffer>,
    state: Arc<ReaderState>,
}

impl ReadCursor {
    /// Sequence number of the next frame this cursor will read.
    pub fn position(&self) -> u64 {
        self.state.next.load(Ordering::Acquire)
    }

    /// Returns `true` if the writer has overtaken this cursor since its last read.
    pub fn is_lagging(&self) -> bool {
        self.state.lagging.load(Ordering::Acquire)
    }

    /// The ring this cursor reads from.
    pub fn ring(&self) -> &Arc<RingBuffer> {
        &self.ring
    }

    /// Reads the frame at the cursor and advances past it.
    ///
    /// On [`ReadResult::Lagged`] the cursor has already been moved to the
    /// returned sequence number.
    pub fn read(&mut self) -> ReadResult {
        let position = self.position();
        let result = self.ring.read_at(position);
        match &result {
            ReadResult::Frame(_) => {
                self.state.next.store(position + 1, Ordering::Release);
                self.state.lagging.store(false, Ordering::Release);
            }
            ReadResult::Lagged(resume_at) => {
                self.state.next.store(*resume_at, Ordering::Release);
                self.state.lagging.store(false, Ordering::Release);
            }
            ReadResult::NotYetAvailable => {}
        }
        result
    }

    /// Moves the cursor to `sequence`, clamped to the stored range.
    pub fn seek(&mut self, sequence: u64) {
        let target = sequence.clamp(self.ring.oldest_available(), self.ring.head());
        self.state.next.store(target, Ordering::Release);
    }
}

impl Drop for ReadCursor {
    fn drop(&mut self) {
        self.ring.readers.rcu(|readers| {
            readers
                .iter()
                .filter(|&reader| !Arc::ptr_eq(reader, &self.state))
                .cloned()
                .collect::<Vec<_>>()
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::AudioFormat;
    use std::time::{Duration, Instant};

    fn frame(sequence: u64) -> AudioFrame {
        AudioFrame::new(
            sequence,
            Duration::from_millis(sequence * 10),
            vec![0u8; 16],
            AudioFormat::dvd_quality(),
        )
    }

    fn fill(ring: &RingBuffer, count: u64) {
        let start = ring.head();
        for seq in start..start + count {
            ring.write(frame(seq));
        }
    }

    #[test]
    fn test_capacity_rounds_to_power_of_two() {
        assert_eq!(RingBuffer::new(200).capacity(), 256);
        assert_eq!(RingBuffer::new(256).capacity(), 256);
        assert_eq!(RingBuffer::new(0).capacity(), 2);
    }

    #[test]
    fn test_read_in_order() {
        let ring = Arc::new(RingBuffer::new(8));
        let mut cursor = ring.cursor_at(0);
        fill(&ring, 3);

        for expected in 0..3 {
            match cursor.read() {
                ReadResult::Frame(f) => assert_eq!(f.sequence(), expected),
                other => panic!("expected frame {expected}, got {other:?}"),
            }
        }
        assert!(matches!(cursor.read(), ReadResult::NotYetAvailable));
        assert_eq!(cursor.position(), 3);
    }

    #[test]
    fn test_read_at_ahead_of_writer() {
        let ring = RingBuffer::new(8);
        fill(&ring, 2);
        assert!(matches!(ring.read_at(2), ReadResult::NotYetAvailable));
        assert!(matches!(ring.read_at(100), ReadResult::NotYetAvailable));
    }

    #[test]
    fn test_lagged_reader_resyncs_to_oldest() {
        let ring = Arc::new(RingBuffer::new(8));
        let mut cursor = ring.cursor_at(0);
        fill(&ring, 20);

        assert!(cursor.is_lagging());
        match cursor.read() {
            ReadResult::Lagged(resume_at) => assert_eq!(resume_at, 12),
            other => panic!("expected lag, got {other:?}"),
        }
        assert_eq!(cursor.position(), 12);
        assert!(!cursor.is_lagging());

        let mut seen = Vec::new();
        while let ReadResult::Frame(f) = cursor.read() {
            seen.push(f.sequence());
        }
        assert_eq!(seen, (12..20).collect::<Vec<_>>());
    }

    #[test]
    fn test_paused_reader_never_sees_overwritten_frame() {
        let ring = Arc::new(RingBuffer::new(16));
        let mut cursor = ring.cursor_at(0);
        let mut last_read: Option<u64> = None;

        for round in 0..10u64 {
            // Pause for longer than capacity on even rounds.
            let burst = if round % 2 == 0 { 40 } else { 5 };
            fill(&ring, burst);

            loop {
                match cursor.read() {
                    ReadResult::Frame(f) => {
                        assert!(f.sequence() >= ring.oldest_available());
                        if let Some(last) = last_read {
                            assert!(f.sequence() > last, "sequence went backwards");
                        }
                        last_read = Some(f.sequence());
                    }
                    ReadResult::Lagged(resume_at) => {
                        assert!(resume_at >= ring.oldest_available());
                        if let Some(last) = last_read {
                            assert!(resume_at > last);
                        }
                    }
                    ReadResult::NotYetAvailable => break,
                }
            }
        }
        assert_eq!(last_read, Some(ring.head() - 1));
    }

    #[test]
    fn test_writer_marks_only_overtaken_readers() {
        let ring = Arc::new(RingBuffer::new(4));
        let slow = ring.cursor_at(0);
        let mut fast = ring.cursor_at(0);

        fill(&ring, 4);
        while let ReadResult::Frame(_) = fast.read() {}

        let outcome = ring.write(frame(4));
        assert_eq!(outcome.sequence, 4);
        assert_eq!(outcome.lagged_readers, 1);
        assert!(slow.is_lagging());
        assert!(!fast.is_lagging());

        // Already-lagging readers are not counted twice.
        assert_eq!(ring.write(frame(5)).lagged_readers, 0);
    }

    #[test]
    fn test_writer_not_blocked_by_stuck_reader() {
        let ring = Arc::new(RingBuffer::new(256));
        let _stuck = ring.cursor_at(0);

        let start = Instant::now();
        fill(&ring, 100_000);
        let elapsed = start.elapsed();

        assert_eq!(ring.head(), 100_000);
        assert!(elapsed < Duration::from_secs(5), "writes took {elapsed:?}");
    }

    #[test]
    fn test_cursor_churn_alongside_writer() {
        let ring = Arc::new(RingBuffer::new(64));
        let parked = ring.cursor_at(0);

        let churners: Vec<_> = (0..4)
            .map(|_| {
                let ring = Arc::clone(&ring);
                std::thread::spawn(move || {
                    for _ in 0..2_000 {
                        let mut cursor = ring.cursor_at(ring.head());
                        let _ = cursor.read();
                    }
                })
            })
            .collect();

        let start = Instant::now();
        fill(&ring, 50_000);
        let elapsed = start.elapsed();
        for churner in churners {
            churner.join().unwrap();
        }

        assert_eq!(ring.head(), 50_000);
        assert!(elapsed < Duration::from_secs(5), "writes took {elapsed:?}");
        // Registrations racing the writer never hide a live cursor from it.
        assert!(parked.is_lagging());
        assert_eq!(ring.reader_count(), 1);
    }

    #[test]
    fn test_cursor_at_clamps_to_stored_range() {
        let ring = Arc::new(RingBuffer::new(8));
        fill(&ring, 30);

        assert_eq!(ring.cursor_at(0).position(), 22);
        assert_eq!(ring.cursor_at(25).position(), 25);
        assert_eq!(ring.cursor_at(99).position(), 30);
    }

    #[test]
    fn test_seek_clamps() {
        let ring = Arc::new(RingBuffer::new(8));
        fill(&ring, 10);
        let mut cursor = ring.cursor_at(9);
        cursor.seek(0);
        assert_eq!(cursor.position(), 2);
        cursor.seek(50);
        assert_eq!(cursor.position(), 10);
    }

    #[test]
    fn test_drop_unregisters_cursor() {
        let ring = Arc::new(RingBuffer::new(8));
        let a = ring.cursor_at(0);
        let b = ring.cursor_at(0);
        assert_eq!(ring.reader_count(), 2);
        drop(a);
        assert_eq!(ring.reader_count(), 1);
        drop(b);
        assert_eq!(ring.reader_count(), 0);
    }

    #[test]
    fn test_fill_percent() {
        let ring = Arc::new(RingBuffer::new(8));
        assert!(ring.fill_percent().abs() < f32::EPSILON);

        fill(&ring, 4);
        assert!((ring.fill_percent() - 50.0).abs() < f32::EPSILON);

        let mut cursor = ring.cursor_at(2);
        assert!((ring.fill_percent() - 25.0).abs() < f32::EPSILON);
        while let ReadResult::Frame(_) = cursor.read() {}
        assert!(ring.fill_percent().abs() < f32::EPSILON);
    }

    #[tokio::test]
    async fn test_write_wakes_waiting_reader() {
        let ring = Arc::new(RingBuffer::new(8));
        let mut cursor = ring.cursor_at(0);

        let writer = Arc::clone(&ring);
        let waiter = tokio::spawn(async move {
            loop {
                let ring = Arc::clone(cursor.ring());
                let notified = ring.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if let ReadResult::Frame(f) = cursor.read() {
                    return f.sequence();
                }
                notified.await;
            }
        });

        tokio::task::yield_now().await;
        writer.write(frame(0));

        let seq = tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(seq, 0);
    }
}
