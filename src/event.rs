//! Runtime events for the presentation layer.
//!
//! Events are how the engine reports everything that is not a fatal start-up
//! error: sink state transitions, resyncs, capture stalls, periodic health.
//! They are delivered through two observer interfaces passed at construction:
//! [`SinkEventSink`] for per-device events and [`SessionEventSink`] for
//! session-wide ones.
//!
//! Observers run inline on engine contexts (including the capture producer),
//! so implementations must return quickly. Forward to a channel if the
//! handling is slow.

use std::sync::Arc;
use std::time::Duration;

use crate::{DeviceId, EngineError};

/// Lifecycle state of one sink.
///
/// ```text
/// Idle → Connecting → Streaming → Draining → Closed
///            └──────────(connect failed)──────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SinkState {
    /// Registered, no transport yet.
    Idle = 0,
    /// Transport handshake in progress.
    Connecting = 1,
    /// Reading the ring buffer and forwarding frames.
    Streaming = 2,
    /// Told to stop; flushing frames already handed to the transport.
    Draining = 3,
    /// Terminal.
    Closed = 4,
}

impl SinkState {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Idle,
            1 => Self::Connecting,
            2 => Self::Streaming,
            3 => Self::Draining,
            _ => Self::Closed,
        }
    }

    /// Returns `true` for states in which the sink still holds a transport.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Connecting | Self::Streaming | Self::Draining)
    }
}

/// Overall status of a capture session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SessionStatus {
    /// Capture is delivering frames.
    Streaming = 0,
    /// Capture stalled; sinks are fed silence or nothing until it recovers.
    Degraded = 1,
    /// The session was stopped.
    Stopped = 2,
    /// Capture was lost and could not be recovered.
    Failed = 3,
}

impl SessionStatus {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Streaming,
            1 => Self::Degraded,
            2 => Self::Stopped,
            _ => Self::Failed,
        }
    }

    /// Returns `true` while the session still runs its producer.
    pub fn is_running(self) -> bool {
        matches!(self, Self::Streaming | Self::Degraded)
    }
}

/// Per-device events.
#[derive(Debug, Clone)]
pub enum SinkEvent {
    /// The sink moved between lifecycle states.
    StateChanged {
        /// Device the sink drives.
        device: DeviceId,
        /// Previous state.
        from: SinkState,
        /// New state.
        to: SinkState,
    },

    /// The transport handshake failed or timed out. The sink is closed.
    ConnectFailed {
        /// Device that could not be connected.
        device: DeviceId,
        /// Description of the failure.
        error: String,
    },

    /// The writer overtook the sink; its cursor jumped forward.
    ///
    /// The skipped frames are lost for this sink only. Sequence numbers
    /// after the jump stay strictly increasing.
    Resynced {
        /// Device that fell behind.
        device: DeviceId,
        /// Sequence number the sink wanted.
        from: u64,
        /// Sequence number it resumed at.
        to: u64,
        /// Total frames this sink has missed in the session.
        missed_frames: u64,
    },

    /// Missed frames crossed the configured alarm threshold.
    MissAlarm {
        /// Device that keeps falling behind.
        device: DeviceId,
        /// Total frames this sink has missed in the session.
        missed_frames: u64,
    },

    /// A new latency estimate was accepted by the sync controller.
    LatencyUpdated {
        /// Device whose latency changed.
        device: DeviceId,
        /// New latency estimate.
        latency: Duration,
        /// Resulting common target delay.
        target_delay: Duration,
    },

    /// The sink left streaming because of a transport problem.
    ///
    /// This is per-device. The session keeps running.
    Disconnected {
        /// Device that was lost.
        device: DeviceId,
        /// Why the sink was closed.
        reason: String,
    },
}

/// Session-wide events.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Capture opened and the producer started.
    Started {
        /// Capture format of the session.
        format: crate::format::AudioFormat,
    },

    /// No frame arrived within twice the expected frame interval.
    Stalled {
        /// Time since the last captured frame.
        since_last_frame: Duration,
    },

    /// Capture delivered frames again after a stall.
    Resumed {
        /// How long the stall lasted.
        stalled_for: Duration,
    },

    /// The capture device was lost and re-opened successfully.
    CaptureRecovered {
        /// Which recovery attempt succeeded (1-based).
        attempt: u32,
    },

    /// Periodic health snapshot.
    Health(HealthSnapshot),

    /// Capture was lost for good; all sinks are draining.
    Failed {
        /// The fatal error.
        error: EngineError,
    },

    /// The session was stopped and all sinks are closed.
    Stopped,
}

/// Health of one sink, as reported in a [`HealthSnapshot`].
#[derive(Debug, Clone, PartialEq)]
pub struct SinkHealth {
    /// Device the sink drives.
    pub device: DeviceId,
    /// Current lifecycle state.
    pub state: SinkState,
    /// Last accepted latency estimate.
    pub latency: Duration,
    /// Buffering offset behind the writer assigned by the sync controller.
    pub delay_offset: Duration,
    /// Frames accepted by the transport.
    pub frames_sent: u64,
    /// Payload bytes accepted by the transport.
    pub bytes_sent: u64,
    /// Frames skipped because the writer overtook this sink.
    pub missed_frames: u64,
    /// Number of cursor jumps.
    pub resyncs: u64,
    /// Total failed send attempts.
    pub send_failures: u64,
}

/// Point-in-time engine health for monitoring and UI.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthSnapshot {
    /// Session status.
    pub status: SessionStatus,
    /// Time since the session started.
    pub uptime: Duration,
    /// Share of ring slots between the slowest reader and the writer, 0-100.
    pub buffer_fill_percent: f32,
    /// Common target presentation delay.
    pub target_delay: Duration,
    /// Frames captured (excluding silence fill).
    pub frames_captured: u64,
    /// Silence frames synthesized during stalls.
    pub silence_frames: u64,
    /// Number of capture stalls so far.
    pub stalls: u64,
    /// Peak level of the most recent captured frame, in dBFS.
    pub input_peak_db: f32,
    /// RMS level of the most recent captured frame, in dBFS.
    pub input_rms_db: f32,
    /// Master volume applied at dispatch.
    pub volume: f32,
    /// Per-sink health.
    pub sinks: Vec<SinkHealth>,
}

/// Observer for per-device events.
///
/// Implemented for any `Fn(SinkEvent) + Send + Sync` closure.
pub trait SinkEventSink: Send + Sync {
    /// Called for every sink event.
    fn on_sink_event(&self, event: SinkEvent);
}

impl<F> SinkEventSink for F
where
    F: Fn(SinkEvent) + Send + Sync,
{
    fn on_sink_event(&self, event: SinkEvent) {
        self(event);
    }
}

/// Observer for session-wide events.
///
/// Implemented for any `Fn(SessionEvent) + Send + Sync` closure.
pub trait SessionEventSink: Send + Sync {
    /// Called for every session event.
    fn on_session_event(&self, event: SessionEvent);
}

impl<F> SessionEventSink for F
where
    F: Fn(SessionEvent) + Send + Sync,
{
    fn on_session_event(&self, event: SessionEvent) {
        self(event);
    }
}

/// Both observers, shared by every engine context.
#[derive(Clone)]
pub(crate) struct Observers {
    pub sink: Option<Arc<dyn SinkEventSink>>,
    pub session: Option<Arc<dyn SessionEventSink>>,
}

impl Observers {
    pub fn sink_event(&self, event: SinkEvent) {
        if let Some(ref observer) = self.sink {
            observer.on_sink_event(event);
        }
    }

    pub fn session_event(&self, event: SessionEvent) {
        if let Some(ref observer) = self.session {
            observer.on_session_event(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_sink_state_round_trip() {
        for state in [
            SinkState::Idle,
            SinkState::Connecting,
            SinkState::Streaming,
            SinkState::Draining,
            SinkState::Closed,
        ] {
            assert_eq!(SinkState::from_u8(state as u8), state);
        }
    }

    #[test]
    fn test_sink_state_active() {
        assert!(!SinkState::Idle.is_active());
        assert!(SinkState::Streaming.is_active());
        assert!(SinkState::Draining.is_active());
        assert!(!SinkState::Closed.is_active());
    }

    #[test]
    fn test_session_status_running() {
        assert!(SessionStatus::Streaming.is_running());
        assert!(SessionStatus::Degraded.is_running());
        assert!(!SessionStatus::Failed.is_running());
        assert_eq!(SessionStatus::from_u8(SessionStatus::Stopped as u8), SessionStatus::Stopped);
    }

    #[test]
    fn test_closure_observers() {
        let sink_calls = Arc::new(AtomicUsize::new(0));
        let session_calls = Arc::new(AtomicUsize::new(0));

        let sink_counter = sink_calls.clone();
        let session_counter = session_calls.clone();
        let observers = Observers {
            sink: Some(Arc::new(move |_: SinkEvent| {
                sink_counter.fetch_add(1, Ordering::SeqCst);
            })),
            session: Some(Arc::new(move |_: SessionEvent| {
                session_counter.fetch_add(1, Ordering::SeqCst);
            })),
        };

        observers.sink_event(SinkEvent::MissAlarm {
            device: DeviceId::new("a"),
            missed_frames: 3,
        });
        observers.session_event(SessionEvent::Stopped);
        observers.session_event(SessionEvent::Stalled {
            since_last_frame: Duration::from_millis(25),
        });

        assert_eq!(sink_calls.load(Ordering::SeqCst), 1);
        assert_eq!(session_calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_event_debug() {
        let event = SinkEvent::Resynced {
            device: DeviceId::new("speaker"),
            from: 10,
            to: 74,
            missed_frames: 64,
        };
        let debug = format!("{event:?}");
        assert!(debug.contains("Resynced"));
        assert!(debug.contains("74"));
    }
}
