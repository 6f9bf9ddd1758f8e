//! The fan-out engine: session lifecycle and sink registry.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::future::join_all;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::builder::FanoutEngineBuilder;
use crate::event::Observers;
use crate::format::{AudioFormat, Level};
use crate::pipeline::{Producer, RingBuffer};
use crate::session::{MasterVolume, Session, SessionState};
use crate::sink::{SinkChannel, SinkContext, SinkShared, Transport};
use crate::source::CaptureSource;
use crate::sync::SyncSnapshot;
use crate::{
    DeviceId, EngineConfig, EngineError, HealthSnapshot, SessionEvent, SessionStatus, SinkEvent,
    SinkHandle, SinkState, SyncController,
};

struct SinkEntry {
    handle: SinkHandle,
    transport: Arc<dyn Transport>,
    shared: Arc<SinkShared>,
    task: Option<JoinHandle<()>>,
}

pub(crate) struct EngineInner {
    config: Arc<EngineConfig>,
    observers: Observers,
    volume: Arc<MasterVolume>,
    /// Parked here between sessions; the producer owns it while one runs.
    capture: Mutex<Option<CaptureSource>>,
    session: Mutex<Option<Session>>,
    sinks: Mutex<BTreeMap<u64, SinkEntry>>,
    next_sink_id: AtomicU64,
    /// Serializes start and stop.
    lifecycle: tokio::sync::Mutex<()>,
}

/// Captures one audio stream and fans it out, synchronized, to many sinks.
///
/// Create one with [`FanoutEngine::builder()`]. The engine owns the capture
/// device; sinks are added and removed at any time, with or without a running
/// session. Sinks added while no session runs stay `Idle` and start
/// connecting when the next session starts.
///
/// Lock order inside the engine is always session, then sinks. Observers are
/// never called with either held.
///
/// # Example
///
/// ```no_run
/// use fanout_audio::{FanoutEngine, MockTransport};
/// use fanout_audio::format::AudioFormat;
/// use fanout_audio::source::MockCapture;
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// # async fn run() -> Result<(), fanout_audio::EngineError> {
/// let engine = FanoutEngine::builder()
///     .capture(MockCapture::new(Duration::from_millis(10)))
///     .on_sink_event(|e| tracing::info!(?e, "sink event"))
///     .build()?;
///
/// engine.start_session(AudioFormat::dvd_quality()).await?;
/// let kitchen = engine.add_sink("kitchen", Arc::new(MockTransport::new()));
///
/// tokio::time::sleep(Duration::from_secs(5)).await;
///
/// engine.remove_sink(&kitchen);
/// engine.stop_session().await;
/// # Ok(())
/// # }
/// ```
pub struct FanoutEngine {
    inner: Arc<EngineInner>,
}

impl FanoutEngine {
    /// Creates a new builder for configuring the engine.
    pub fn builder() -> FanoutEngineBuilder {
        FanoutEngineBuilder::new()
    }

    pub(crate) fn new(capture: CaptureSource, config: EngineConfig, observers: Observers) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                config: Arc::new(config),
                observers,
                volume: Arc::new(MasterVolume::default()),
                capture: Mutex::new(Some(capture)),
                session: Mutex::new(None),
                sinks: Mutex::new(BTreeMap::new()),
                next_sink_id: AtomicU64::new(1),
                lifecycle: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// The engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Starts a session in the configured default format.
    pub async fn start(&self) -> Result<(), EngineError> {
        self.start_session(self.inner.config.format).await
    }

    /// Opens capture at `format` and starts streaming to every registered sink.
    ///
    /// A session that ended in [`SessionStatus::Failed`] is torn down first.
    /// Nothing is left behind when this fails.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - A session is already streaming ([`EngineError::SessionAlreadyActive`])
    /// - The format or configuration is invalid
    /// - The capture device is unavailable or rejects the format
    pub async fn start_session(&self, format: AudioFormat) -> Result<(), EngineError> {
        let _lifecycle = self.inner.lifecycle.lock().await;

        let stale = match self.inner.session.lock().as_ref() {
            Some(session) if session.state.status().is_running() => {
                return Err(EngineError::SessionAlreadyActive)
            }
            Some(_) => true,
            None => false,
        };
        if stale {
            tracing::debug!("tearing down ended session before restart");
            self.inner.teardown().await;
        }

        let config = Arc::new(EngineConfig {
            format,
            ..(*self.inner.config).clone()
        });
        config.validate()?;

        let capture = self.open_capture(format).await?;

        let ring = Arc::new(RingBuffer::new(config.ring_slots()));
        let sync = Arc::new(SyncController::from_config(&config));
        let state = Arc::new(SessionState::new());

        let producer = Producer::new(
            capture,
            Arc::clone(&ring),
            Arc::clone(&sync),
            Arc::clone(&state),
            Arc::clone(&config),
            self.inner.observers.clone(),
        );
        let producer = tokio::task::spawn_blocking(move || producer.run());
        let monitor = tokio::spawn(run_health_monitor(
            Arc::downgrade(&self.inner),
            Arc::clone(&state),
            config.health_interval,
        ));

        tracing::info!(
            %format,
            slots = ring.capacity(),
            frame_ms = config.frame_duration.as_millis() as u64,
            "session started"
        );

        let session = Session {
            format,
            config,
            runtime: Handle::current(),
            state,
            ring,
            sync,
            producer: Some(producer),
            monitor: Some(monitor),
        };

        {
            let mut slot = self.inner.session.lock();
            let mut sinks = self.inner.sinks.lock();
            for entry in sinks.values_mut() {
                if entry.task.is_none() && entry.shared.state() == SinkState::Idle {
                    entry.task = Some(self.inner.spawn_sink(&session, entry));
                }
            }
            *slot = Some(session);
        }

        self.inner
            .observers
            .session_event(SessionEvent::Started { format });
        Ok(())
    }

    async fn open_capture(&self, format: AudioFormat) -> Result<CaptureSource, EngineError> {
        let mut capture =
            self.inner
                .capture
                .lock()
                .take()
                .ok_or_else(|| EngineError::CaptureUnavailable {
                    reason: "capture source was lost by a previous session".into(),
                })?;

        let (capture, opened) = tokio::task::spawn_blocking(move || {
            let opened = capture.start(format);
            (capture, opened)
        })
        .await
        .map_err(|err| EngineError::CaptureUnavailable {
            reason: format!("capture open panicked: {err}"),
        })?;

        match opened {
            Ok(()) => Ok(capture),
            Err(err) => {
                tracing::warn!(device = capture.name(), %format, error = %err, "capture open failed");
                *self.inner.capture.lock() = Some(capture);
                Err(err.into())
            }
        }
    }

    /// Stops capture, drains every sink and releases the ring buffer.
    ///
    /// Capture stops at once; sinks drain concurrently, each bounded by the
    /// drain timeout. Sinks that closed are forgotten; no-op without a session.
    pub async fn stop_session(&self) {
        let _lifecycle = self.inner.lifecycle.lock().await;
        self.inner.teardown().await;
    }

    /// Registers a sink for `device` and starts connecting it if a session runs.
    ///
    /// Never fails: connection success or failure is reported through
    /// [`SinkEvent`]s.
    pub fn add_sink(&self, device: impl Into<DeviceId>, transport: Arc<dyn Transport>) -> SinkHandle {
        let id = self.inner.next_sink_id.fetch_add(1, Ordering::Relaxed);
        let handle = SinkHandle::new(id, device);
        let mut entry = SinkEntry {
            handle: handle.clone(),
            transport,
            shared: Arc::new(SinkShared::new()),
            task: None,
        };

        let session = self.inner.session.lock();
        match session.as_ref().filter(|s| s.state.status().is_running()) {
            Some(session) => entry.task = Some(self.inner.spawn_sink(session, &entry)),
            None => tracing::info!(device = %handle.device(), "sink registered, waiting for a session"),
        }
        self.inner.sinks.lock().insert(id, entry);
        handle
    }

    /// Moves the sink to draining. Idempotent; unknown handles are ignored.
    ///
    /// A sink that never started (no session since it was added) closes at once.
    pub fn remove_sink(&self, handle: &SinkHandle) {
        let event = {
            let session = self.inner.session.lock();
            let mut sinks = self.inner.sinks.lock();
            let Some(entry) = sinks.get(&handle.id()) else {
                return;
            };

            if entry.shared.close_if_idle() {
                sinks.remove(&handle.id());
                tracing::info!(device = %handle.device(), "idle sink removed");
                Some(SinkEvent::StateChanged {
                    device: handle.device().clone(),
                    from: SinkState::Idle,
                    to: SinkState::Closed,
                })
            } else {
                // Running, or draining under a teardown that already holds its task.
                if entry.shared.request_remove() {
                    tracing::info!(device = %handle.device(), "sink removal requested");
                    if let Some(session) = session.as_ref() {
                        session.ring.wake_all();
                    }
                }
                None
            }
        };

        if let Some(event) = event {
            self.inner.observers.sink_event(event);
        }
    }

    /// Overrides a streaming sink's latency estimate.
    ///
    /// The estimate goes through the same hysteresis as probed ones and holds
    /// until the sink's next probe. Returns the resulting target delay if the
    /// estimate was accepted.
    pub fn set_sink_latency(&self, handle: &SinkHandle, estimate: Duration) -> Option<Duration> {
        let (sync, shared) = {
            let session = self.inner.session.lock();
            let sync = Arc::clone(&session.as_ref()?.sync);
            let shared = Arc::clone(&self.inner.sinks.lock().get(&handle.id())?.shared);
            (sync, shared)
        };
        if shared.state() != SinkState::Streaming {
            return None;
        }

        let target_delay = sync.report_latency(handle, estimate)?;
        shared.set_latency(estimate);
        tracing::info!(
            device = %handle.device(),
            latency_ms = estimate.as_millis() as u64,
            target_ms = target_delay.as_millis() as u64,
            "sink latency set"
        );
        self.inner.observers.sink_event(SinkEvent::LatencyUpdated {
            device: handle.device().clone(),
            latency: estimate,
            target_delay,
        });
        Some(target_delay)
    }

    /// Sets the master volume applied at dispatch, clamped to `0.0..=1.0`.
    pub fn set_volume(&self, volume: f32) {
        self.inner.volume.set(volume);
        tracing::debug!(volume = self.inner.volume.get(), "master volume set");
    }

    /// Current master volume.
    pub fn volume(&self) -> f32 {
        self.inner.volume.get()
    }

    /// Status of the current session, `Stopped` when there is none.
    pub fn status(&self) -> SessionStatus {
        self.inner
            .session
            .lock()
            .as_ref()
            .map_or(SessionStatus::Stopped, |s| s.state.status())
    }

    /// Capture format of the current session.
    pub fn session_format(&self) -> Option<AudioFormat> {
        self.inner.session.lock().as_ref().map(|s| s.format)
    }

    /// Every registered sink with its current state, in the order added.
    pub fn sinks(&self) -> Vec<(SinkHandle, SinkState)> {
        self.inner
            .sinks
            .lock()
            .values()
            .map(|e| (e.handle.clone(), e.shared.state()))
            .collect()
    }

    /// State of one sink, `None` if it is unknown or was forgotten.
    pub fn sink_state(&self, handle: &SinkHandle) -> Option<SinkState> {
        self.inner
            .sinks
            .lock()
            .get(&handle.id())
            .map(|e| e.shared.state())
    }

    /// Sync controller view of the current session.
    pub fn sync_snapshot(&self) -> Option<SyncSnapshot> {
        self.inner.session.lock().as_ref().map(|s| s.sync.snapshot())
    }

    /// Point-in-time health snapshot, the same one emitted periodically.
    pub fn health(&self) -> HealthSnapshot {
        self.inner.health()
    }
}

impl std::fmt::Debug for FanoutEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FanoutEngine")
            .field("status", &self.status())
            .field("sinks", &self.inner.sinks.lock().len())
            .finish_non_exhaustive()
    }
}

impl EngineInner {
    fn spawn_sink(&self, session: &Session, entry: &SinkEntry) -> JoinHandle<()> {
        let ctx = SinkContext {
            ring: Arc::clone(&session.ring),
            sync: Arc::clone(&session.sync),
            session: Arc::clone(&session.state),
            volume: Arc::clone(&self.volume),
            config: Arc::clone(&session.config),
            observers: self.observers.clone(),
        };
        let channel = SinkChannel::new(
            entry.handle.clone(),
            Arc::clone(&entry.transport),
            Arc::clone(&entry.shared),
            ctx,
        );
        session.runtime.spawn(channel.run())
    }

    async fn teardown(&self) {
        let Some(mut session) = self.session.lock().take() else {
            return;
        };
        session.state.set_status(SessionStatus::Stopped);
        session.cancel();

        if let Some(producer) = session.producer.take() {
            match producer.await {
                Ok(capture) => *self.capture.lock() = Some(capture),
                Err(err) => tracing::error!(error = %err, "capture producer panicked, capture lost"),
            }
        }
        if let Some(monitor) = session.monitor.take() {
            monitor.abort();
        }

        let tasks: Vec<_> = self
            .sinks
            .lock()
            .values_mut()
            .filter_map(|e| e.task.take())
            .collect();
        let sink_count = tasks.len();
        for result in join_all(tasks).await {
            if let Err(err) = result {
                tracing::error!(error = %err, "sink task panicked");
            }
        }
        self.sinks
            .lock()
            .retain(|_, e| e.shared.state() != SinkState::Closed);

        tracing::info!(
            sinks = sink_count,
            frames = session.state.frames_captured.load(Ordering::Relaxed),
            "session stopped"
        );
        self.observers.session_event(SessionEvent::Stopped);
    }

    fn health(&self) -> HealthSnapshot {
        let session = self.session.lock();
        let sinks = self
            .sinks
            .lock()
            .values()
            .map(|e| e.shared.health(e.handle.device()))
            .collect();
        let volume = self.volume.get();

        let Some(session) = session.as_ref() else {
            return HealthSnapshot {
                status: SessionStatus::Stopped,
                uptime: Duration::ZERO,
                buffer_fill_percent: 0.0,
                target_delay: Duration::ZERO,
                frames_captured: 0,
                silence_frames: 0,
                stalls: 0,
                input_peak_db: Level::SILENT.peak_db,
                input_rms_db: Level::SILENT.rms_db,
                volume,
                sinks,
            };
        };

        let state = &session.state;
        let level = state.level();
        HealthSnapshot {
            status: state.status(),
            uptime: state.uptime(),
            buffer_fill_percent: session.ring.fill_percent(),
            target_delay: session.sync.target_delay(),
            frames_captured: state.frames_captured.load(Ordering::Relaxed),
            silence_frames: state.silence_frames.load(Ordering::Relaxed),
            stalls: state.stalls.load(Ordering::Relaxed),
            input_peak_db: level.peak_db,
            input_rms_db: level.rms_db,
            volume,
            sinks,
        }
    }
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        if let Some(session) = self.session.get_mut().take() {
            // Producer and sinks wind down on their own; nothing to await here.
            session.cancel();
            if let Some(monitor) = session.monitor {
                monitor.abort();
            }
        }
    }
}

async fn run_health_monitor(inner: Weak<EngineInner>, state: Arc<SessionState>, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        ticker.tick().await;
        if state.is_cancelled() {
            break;
        }
        let Some(inner) = inner.upgrade() else {
            break;
        };
        let snapshot = inner.health();
        tracing::debug!(
            status = ?snapshot.status,
            fill = snapshot.buffer_fill_percent,
            target_ms = snapshot.target_delay.as_millis() as u64,
            sinks = snapshot.sinks.len(),
            "health"
        );
        inner
            .observers
            .session_event(SessionEvent::Health(snapshot));
    }
}
