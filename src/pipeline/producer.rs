//! Capture producer: the only writer of the ring buffer.
//!
//! Runs on a blocking thread because capture collaborators poll
//! synchronously. Besides moving frames into the ring it:
//! - detects stalls (no frame within twice the frame interval)
//! - optionally fills stalls with silence so sink clocks keep moving
//! - meters the input level for health snapshots
//! - advances the sync controller's delay ramp once per frame
//! - re-opens a lost device up to the configured number of attempts

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::event::Observers;
use crate::format::measure_level;
use crate::pipeline::RingBuffer;
use crate::session::SessionState;
use crate::source::{CapturePoll, CaptureSource};
use crate::{
    AudioFrame, CaptureError, EngineConfig, EngineError, SessionEvent, SessionStatus,
    SyncController,
};

/// Shortest poll timeout, so very short frames do not spin.
const MIN_POLL_TIMEOUT: Duration = Duration::from_millis(1);

/// Tracks the gap since the last real frame.
struct StallMonitor {
    stall_after: Duration,
    frame_interval: Duration,
    last_frame: Instant,
    stalled_since: Option<Instant>,
    /// Silence frames written for the current gap.
    filled: u64,
}

impl StallMonitor {
    fn new(frame_interval: Duration) -> Self {
        Self {
            stall_after: frame_interval * 2,
            frame_interval,
            last_frame: Instant::now(),
            stalled_since: None,
            filled: 0,
        }
    }

    /// Records a real frame. Returns the stall length if one just ended.
    fn frame_arrived(&mut self) -> Option<Duration> {
        self.last_frame = Instant::now();
        self.filled = 0;
        self.stalled_since.take().map(|since| since.elapsed())
    }

    /// Checks the gap after a poll timeout. Returns the gap if a stall just began.
    fn timed_out(&mut self) -> Option<Duration> {
        let gap = self.last_frame.elapsed();
        if gap < self.stall_after || self.stalled_since.is_some() {
            return None;
        }
        self.stalled_since = Some(self.last_frame);
        Some(gap)
    }

    fn is_stalled(&self) -> bool {
        self.stalled_since.is_some()
    }

    /// Silence frames still owed for the current gap.
    fn silence_due(&self) -> u64 {
        let intervals =
            self.last_frame.elapsed().as_nanos() / self.frame_interval.as_nanos().max(1);
        (intervals as u64).saturating_sub(self.filled)
    }

    fn reset(&mut self) {
        self.last_frame = Instant::now();
        self.filled = 0;
    }
}

/// Moves captured frames into the ring until the session is cancelled or
/// capture is lost for good.
pub(crate) struct Producer {
    capture: CaptureSource,
    ring: Arc<RingBuffer>,
    sync: Arc<SyncController>,
    state: Arc<SessionState>,
    config: Arc<EngineConfig>,
    observers: Observers,
}

impl Producer {
    pub fn new(
        capture: CaptureSource,
        ring: Arc<RingBuffer>,
        sync: Arc<SyncController>,
        state: Arc<SessionState>,
        config: Arc<EngineConfig>,
        observers: Observers,
    ) -> Self {
        Self {
            capture,
            ring,
            sync,
            state,
            config,
            observers,
        }
    }

    /// Runs the capture loop and hands the (stopped) source back.
    pub fn run(mut self) -> CaptureSource {
        let frame_interval = self.config.frame_duration;
        let poll_timeout = (frame_interval / 2).max(MIN_POLL_TIMEOUT);
        let mut stall = StallMonitor::new(frame_interval);
        let mut recovery_attempt = 0u32;

        tracing::debug!(device = self.capture.name(), ?poll_timeout, "producer started");

        while !self.state.is_cancelled() {
            match self.capture.next_frame(poll_timeout) {
                CapturePoll::Frame(frame) => {
                    if let Some(stalled_for) = stall.frame_arrived() {
                        self.resume(stalled_for);
                    }
                    recovery_attempt = 0;
                    let level = measure_level(frame.payload(), frame.format().bit_depth);
                    self.state.record_level(level);
                    self.state.frames_captured.fetch_add(1, Ordering::Relaxed);
                    self.publish(frame);
                }
                CapturePoll::Timeout => {
                    if let Some(gap) = stall.timed_out() {
                        self.stall(gap);
                    }
                    if stall.is_stalled() && self.config.silence_fill_on_stall {
                        self.fill_silence(&mut stall);
                    }
                }
                CapturePoll::Lost(err) => {
                    if recovery_attempt < self.config.capture_recovery_attempts {
                        recovery_attempt += 1;
                        self.recover(recovery_attempt, &err, &mut stall);
                    } else {
                        self.fail(err);
                        break;
                    }
                }
            }
        }

        self.capture.stop();
        tracing::debug!(
            frames = self.state.frames_captured.load(Ordering::Relaxed),
            "producer exited"
        );
        self.capture
    }

    fn publish(&self, frame: AudioFrame) {
        let outcome = self.ring.write(frame);
        if outcome.lagged_readers > 0 {
            tracing::debug!(
                seq = outcome.sequence,
                readers = outcome.lagged_readers,
                "writer overtook slow readers"
            );
        }
        self.sync.tick();
    }

    fn fill_silence(&mut self, stall: &mut StallMonitor) {
        for _ in 0..stall.silence_due() {
            let Some(frame) = self.capture.silence_frame(self.config.frame_duration) else {
                return;
            };
            self.state.silence_frames.fetch_add(1, Ordering::Relaxed);
            stall.filled += 1;
            self.publish(frame);
        }
    }

    fn stall(&self, since_last_frame: Duration) {
        self.state.stalls.fetch_add(1, Ordering::Relaxed);
        self.state.set_status_if_running(SessionStatus::Degraded);
        tracing::warn!(
            gap_ms = since_last_frame.as_millis() as u64,
            silence_fill = self.config.silence_fill_on_stall,
            "capture stalled"
        );
        self.observers
            .session_event(SessionEvent::Stalled { since_last_frame });
    }

    fn resume(&self, stalled_for: Duration) {
        self.state.set_status_if_running(SessionStatus::Streaming);
        tracing::info!(stalled_ms = stalled_for.as_millis() as u64, "capture resumed");
        self.observers
            .session_event(SessionEvent::Resumed { stalled_for });
    }

    fn recover(&mut self, attempt: u32, err: &CaptureError, stall: &mut StallMonitor) {
        tracing::warn!(
            attempt,
            max = self.config.capture_recovery_attempts,
            error = %err,
            "capture lost, re-opening"
        );
        match self.capture.reopen() {
            Ok(()) => {
                stall.reset();
                tracing::info!(attempt, "capture recovered");
                self.observers
                    .session_event(SessionEvent::CaptureRecovered { attempt });
            }
            Err(reopen_err) => {
                tracing::warn!(attempt, error = %reopen_err, "re-opening capture failed");
                std::thread::sleep(self.config.frame_duration);
            }
        }
    }

    fn fail(&self, err: CaptureError) {
        let error = EngineError::from(err);
        tracing::error!(%error, "capture lost, session failed");
        self.state.set_status(SessionStatus::Failed);
        self.state.cancel();
        self.ring.wake_all();
        self.observers.session_event(SessionEvent::Failed { error });
    }
}
