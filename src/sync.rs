//! Common presentation delay across sinks with different link latencies.
//!
//! Every streaming sink reports a latency estimate. The controller keeps
//!
//! ```text
//! target_delay = max(latency_i) + safety_margin
//! delay_offset_i = target_delay - latency_i
//! ```
//!
//! and a sink only forwards frame `s` once `s < head - frames(delay_offset_i)`.
//! Frames therefore leave each sink exactly early enough to be rendered
//! `target_delay` after capture.
//!
//! Increases apply at once: sinks simply hold until the writer has moved far
//! enough ahead, so nothing is lost or replayed. Decreases are ramped over
//! `delay_ramp_frames` capture intervals by [`SyncController::tick`], which
//! the producer calls once per frame.

use std::cmp::Reverse;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::{DeviceId, EngineConfig, SinkHandle};

/// Smallest ramp step, so a decrease always terminates.
const MIN_RAMP_STEP: Duration = Duration::from_micros(1);

/// A sink's buffering offset behind the writer, written by the controller.
#[derive(Debug, Clone, Default)]
pub struct DelayOffset(Arc<AtomicU64>);

impl DelayOffset {
    /// Current offset.
    pub fn get(&self) -> Duration {
        Duration::from_nanos(self.0.load(Ordering::Acquire))
    }

    fn set(&self, offset: Duration) {
        self.0.store(duration_to_nanos(offset), Ordering::Release);
    }
}

struct SyncEntry {
    id: u64,
    device: DeviceId,
    latency: Duration,
    join_order: u64,
    offset: DelayOffset,
}

struct SyncState {
    entries: Vec<SyncEntry>,
    next_join_order: u64,
    /// Delay currently applied.
    current: Duration,
    /// Delay the latencies call for.
    goal: Duration,
    ramp_step: Duration,
}

/// Point-in-time view of the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncSnapshot {
    /// Delay currently applied to every sink.
    pub target_delay: Duration,
    /// Delay the ramp is heading to.
    pub goal_delay: Duration,
    /// Sink whose latency sets the target (earliest joined on ties).
    pub dominant: Option<DeviceId>,
    /// Accepted latency per registered sink, in join order.
    pub latencies: Vec<(DeviceId, Duration)>,
}

/// Computes the common target delay and per-sink delay offsets.
///
/// All recomputation happens in one short exclusive section over the
/// latency table; the ring buffer is never involved.
///
/// # Example
///
/// ```
/// use fanout_audio::{SyncController, SinkHandle};
/// use std::time::Duration;
///
/// let sync = SyncController::new(Duration::from_millis(20), Duration::from_millis(5), 50);
/// let a = SinkHandle::new(1, "speaker-a");
/// let b = SinkHandle::new(2, "speaker-b");
///
/// let offset_a = sync.register(&a, Duration::from_millis(50));
/// let offset_b = sync.register(&b, Duration::from_millis(200));
///
/// assert_eq!(sync.target_delay(), Duration::from_millis(220));
/// assert_eq!(offset_a.get(), Duration::from_millis(170));
/// assert_eq!(offset_b.get(), Duration::from_millis(20));
/// ```
pub struct SyncController {
    safety_margin: Duration,
    hysteresis: Duration,
    ramp_frames: u32,
    state: Mutex<SyncState>,
    target_ns: AtomicU64,
}

impl SyncController {
    /// Creates a controller with no sinks; the target starts at `safety_margin`.
    pub fn new(safety_margin: Duration, hysteresis: Duration, ramp_frames: u32) -> Self {
        Self {
            safety_margin,
            hysteresis,
            ramp_frames: ramp_frames.max(1),
            state: Mutex::new(SyncState {
                entries: Vec::new(),
                next_join_order: 0,
                current: safety_margin,
                goal: safety_margin,
                ramp_step: Duration::ZERO,
            }),
            target_ns: AtomicU64::new(duration_to_nanos(safety_margin)),
        }
    }

    /// Creates a controller from the sync-related fields of `config`.
    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(
            config.safety_margin,
            config.latency_hysteresis,
            config.delay_ramp_frames,
        )
    }

    /// Delay currently applied. Lock-free.
    pub fn target_delay(&self) -> Duration {
        Duration::from_nanos(self.target_ns.load(Ordering::Acquire))
    }

    /// Adds a streaming sink with its first latency estimate.
    ///
    /// Registering an already known sink updates its latency unconditionally
    /// and returns the existing offset.
    pub fn register(&self, handle: &SinkHandle, latency: Duration) -> DelayOffset {
        let mut state = self.state.lock();
        let existing = state.entries.iter().position(|e| e.id == handle.id());
        let offset = if let Some(index) = existing {
            state.entries[index].latency = latency;
            state.entries[index].offset.clone()
        } else {
            let join_order = state.next_join_order;
            state.next_join_order += 1;
            let offset = DelayOffset::default();
            state.entries.push(SyncEntry {
                id: handle.id(),
                device: handle.device().clone(),
                latency,
                join_order,
                offset: offset.clone(),
            });
            offset
        };

        tracing::debug!(
            device = %handle.device(),
            latency_ms = latency.as_millis() as u64,
            "sink joined sync group"
        );
        self.recompute(&mut state);
        offset
    }

    /// Updates a sink's latency estimate.
    ///
    /// Changes smaller than the hysteresis are ignored. Returns the new
    /// target delay when the estimate was accepted, `None` when it was
    /// ignored or the sink is not registered.
    pub fn report_latency(&self, handle: &SinkHandle, latency: Duration) -> Option<Duration> {
        let mut state = self.state.lock();
        let entry = state.entries.iter_mut().find(|e| e.id == handle.id())?;
        if entry.latency.abs_diff(latency) < self.hysteresis {
            return None;
        }
        entry.latency = latency;
        self.recompute(&mut state);
        Some(state.current)
    }

    /// Removes a sink. Unknown handles are ignored.
    pub fn unregister(&self, handle: &SinkHandle) {
        let mut state = self.state.lock();
        let before = state.entries.len();
        state.entries.retain(|e| e.id != handle.id());
        if state.entries.len() != before {
            tracing::debug!(device = %handle.device(), "sink left sync group");
            self.recompute(&mut state);
        }
    }

    /// Advances a pending decrease by one step.
    ///
    /// Called by the capture producer once per frame. Never blocks: when the
    /// table is being recomputed the step is simply skipped.
    pub fn tick(&self) {
        let Some(mut state) = self.state.try_lock() else {
            return;
        };
        if state.current <= state.goal {
            return;
        }
        state.current = state.current.saturating_sub(state.ramp_step).max(state.goal);
        self.publish(&state);
    }

    /// Returns `true` while a decrease is being ramped.
    pub fn is_ramping(&self) -> bool {
        let state = self.state.lock();
        state.current > state.goal
    }

    /// Point-in-time view of the controller.
    pub fn snapshot(&self) -> SyncSnapshot {
        let state = self.state.lock();
        SyncSnapshot {
            target_delay: state.current,
            goal_delay: state.goal,
            dominant: dominant(&state.entries).map(|e| e.device.clone()),
            latencies: state
                .entries
                .iter()
                .map(|e| (e.device.clone(), e.latency))
                .collect(),
        }
    }

    fn recompute(&self, state: &mut SyncState) {
        let goal = dominant(&state.entries).map_or(Duration::ZERO, |e| e.latency) + self.safety_margin;
        state.goal = goal;

        if goal >= state.current {
            if goal > state.current {
                tracing::info!(
                    target_ms = goal.as_millis() as u64,
                    previous_ms = state.current.as_millis() as u64,
                    "target delay increased"
                );
            }
            state.current = goal;
            state.ramp_step = Duration::ZERO;
        } else {
            state.ramp_step = ((state.current - goal) / self.ramp_frames).max(MIN_RAMP_STEP);
            tracing::info!(
                target_ms = goal.as_millis() as u64,
                current_ms = state.current.as_millis() as u64,
                frames = self.ramp_frames,
                "ramping target delay down"
            );
        }
        self.publish(state);
    }

    fn publish(&self, state: &SyncState) {
        for entry in &state.entries {
            entry.offset.set(state.current.saturating_sub(entry.latency));
        }
        self.target_ns
            .store(duration_to_nanos(state.current), Ordering::Release);
    }
}

impl std::fmt::Debug for SyncController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncController")
            .field("target_delay", &self.target_delay())
            .field("safety_margin", &self.safety_margin)
            .finish_non_exhaustive()
    }
}

/// Highest latency wins; on equal latency the first-joined sink stays dominant.
fn dominant(entries: &[SyncEntry]) -> Option<&SyncEntry> {
    entries
        .iter()
        .min_by_key(|e| (Reverse(e.latency), e.join_order))
}

/// Number of whole frames covering `delay`, rounded up.
pub(crate) fn delay_in_frames(delay: Duration, frame_duration: Duration) -> u64 {
    let frame_ns = frame_duration.as_nanos().max(1);
    delay.as_nanos().div_ceil(frame_ns) as u64
}

fn duration_to_nanos(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}
