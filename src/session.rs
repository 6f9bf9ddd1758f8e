//! Capture session state.
//!
//! A session bounds one capture run: it owns the ring buffer, the sync
//! controller and the producer and monitor tasks. The engine holds at most
//! one at a time.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::format::{AudioFormat, Level};
use crate::pipeline::RingBuffer;
use crate::source::CaptureSource;
use crate::{EngineConfig, SessionStatus, SyncController};

/// Counters and flags shared between the session's contexts.
pub(crate) struct SessionState {
    status: AtomicU8,
    cancelled: AtomicBool,
    started: Instant,
    pub frames_captured: AtomicU64,
    pub silence_frames: AtomicU64,
    pub stalls: AtomicU64,
    peak_db: AtomicU32,
    rms_db: AtomicU32,
}

impl SessionState {
    pub fn new() -> Self {
        Self {
            status: AtomicU8::new(SessionStatus::Streaming as u8),
            cancelled: AtomicBool::new(false),
            started: Instant::now(),
            frames_captured: AtomicU64::new(0),
            silence_frames: AtomicU64::new(0),
            stalls: AtomicU64::new(0),
            peak_db: AtomicU32::new(Level::SILENT.peak_db.to_bits()),
            rms_db: AtomicU32::new(Level::SILENT.rms_db.to_bits()),
        }
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub fn set_status(&self, status: SessionStatus) -> SessionStatus {
        SessionStatus::from_u8(self.status.swap(status as u8, Ordering::AcqRel))
    }

    /// Moves between `Streaming` and `Degraded` without overriding a
    /// terminal status.
    pub fn set_status_if_running(&self, status: SessionStatus) {
        let _ = self
            .status
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                SessionStatus::from_u8(current)
                    .is_running()
                    .then_some(status as u8)
            });
    }

    /// Tells every context of the session to wind down.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn record_level(&self, level: Level) {
        self.peak_db.store(level.peak_db.to_bits(), Ordering::Relaxed);
        self.rms_db.store(level.rms_db.to_bits(), Ordering::Relaxed);
    }

    pub fn level(&self) -> Level {
        Level {
            peak_db: f32::from_bits(self.peak_db.load(Ordering::Relaxed)),
            rms_db: f32::from_bits(self.rms_db.load(Ordering::Relaxed)),
        }
    }
}

/// Master gain applied by every sink at dispatch.
pub(crate) struct MasterVolume(AtomicU32);

impl MasterVolume {
    pub fn get(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Relaxed))
    }

    /// Sets the gain, clamped to `0.0..=1.0`. NaN is ignored.
    pub fn set(&self, volume: f32) {
        if volume.is_nan() {
            return;
        }
        self.0
            .store(volume.clamp(0.0, 1.0).to_bits(), Ordering::Relaxed);
    }
}

impl Default for MasterVolume {
    fn default() -> Self {
        Self(AtomicU32::new(1.0f32.to_bits()))
    }
}

/// One running capture session, owned by the engine.
pub(crate) struct Session {
    pub format: AudioFormat,
    /// Engine configuration with `format` set to the session's format.
    pub config: Arc<EngineConfig>,
    /// Runtime the session's tasks run on, for spawning sinks from sync code.
    pub runtime: Handle,
    pub state: Arc<SessionState>,
    pub ring: Arc<RingBuffer>,
    pub sync: Arc<SyncController>,
    /// Yields the capture source back when the producer exits.
    pub producer: Option<JoinHandle<CaptureSource>>,
    pub monitor: Option<JoinHandle<()>>,
}

impl Session {
    /// Signals every context to stop and wakes waiting sinks.
    pub fn cancel(&self) {
        self.state.cancel();
        self.ring.wake_all();
    }
}
