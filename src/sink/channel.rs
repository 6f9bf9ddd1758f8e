//! Per-device sink task and its state machine.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::time::Instant;

use crate::event::Observers;
use crate::format::apply_gain;
use crate::pipeline::{ReadCursor, ReadResult, RingBuffer};
use crate::session::{MasterVolume, SessionState};
use crate::sink::{SinkHandle, Transport};
use crate::sync::{delay_in_frames, DelayOffset};
use crate::{
    AudioFrame, DeviceId, EngineConfig, SinkEvent, SinkHealth, SinkState, SyncController,
    TransportError,
};

/// Sink fields read by the engine while the task runs.
///
/// Everything else about a sink is owned by its task.
pub(crate) struct SinkShared {
    state: AtomicU8,
    latency_ns: AtomicU64,
    delay_offset: OnceLock<DelayOffset>,
    missed: AtomicU64,
    resyncs: AtomicU64,
    frames_sent: AtomicU64,
    bytes_sent: AtomicU64,
    send_failures: AtomicU64,
    remove_requested: AtomicBool,
}

impl SinkShared {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(SinkState::Idle as u8),
            latency_ns: AtomicU64::new(0),
            delay_offset: OnceLock::new(),
            missed: AtomicU64::new(0),
            resyncs: AtomicU64::new(0),
            frames_sent: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            send_failures: AtomicU64::new(0),
            remove_requested: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> SinkState {
        SinkState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Swaps the state, returning the previous one.
    pub fn set_state(&self, state: SinkState) -> SinkState {
        SinkState::from_u8(self.state.swap(state as u8, Ordering::AcqRel))
    }

    /// Moves `Idle` to `Connecting`. Fails if the sink was closed first.
    pub fn begin_connecting(&self) -> bool {
        self.swap_from(SinkState::Idle, SinkState::Connecting)
    }

    /// Moves `Idle` to `Closed`. Fails once the task has started.
    pub fn close_if_idle(&self) -> bool {
        self.swap_from(SinkState::Idle, SinkState::Closed)
    }

    fn swap_from(&self, from: SinkState, to: SinkState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Asks the task to drain. Returns `false` if already requested.
    pub fn request_remove(&self) -> bool {
        !self.remove_requested.swap(true, Ordering::AcqRel)
    }

    pub fn remove_requested(&self) -> bool {
        self.remove_requested.load(Ordering::Acquire)
    }

    pub fn set_latency(&self, latency: Duration) {
        let nanos = u64::try_from(latency.as_nanos()).unwrap_or(u64::MAX);
        self.latency_ns.store(nanos, Ordering::Release);
    }

    pub fn latency(&self) -> Duration {
        Duration::from_nanos(self.latency_ns.load(Ordering::Acquire))
    }

    pub fn health(&self, device: &DeviceId) -> SinkHealth {
        SinkHealth {
            device: device.clone(),
            state: self.state(),
            latency: self.latency(),
            delay_offset: self
                .delay_offset
                .get()
                .map_or(Duration::ZERO, DelayOffset::get),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            missed_frames: self.missed.load(Ordering::Relaxed),
            resyncs: self.resyncs.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
        }
    }
}

/// Session resources every sink task reads.
#[derive(Clone)]
pub(crate) struct SinkContext {
    pub ring: Arc<RingBuffer>,
    pub sync: Arc<SyncController>,
    pub session: Arc<SessionState>,
    pub volume: Arc<MasterVolume>,
    pub config: Arc<EngineConfig>,
    pub observers: Observers,
}

/// Why a sink left streaming.
#[derive(Debug)]
enum StopReason {
    Removed,
    SessionEnded,
    LinkLost(TransportError),
    SendFailures(TransportError),
}

impl StopReason {
    fn disconnect_reason(&self) -> Option<String> {
        match self {
            Self::Removed | Self::SessionEnded => None,
            Self::LinkLost(err) => Some(err.to_string()),
            Self::SendFailures(err) => Some(format!("repeated send failures: {err}")),
        }
    }
}

/// One device's consumer: connect, stream from the ring, drain, close.
///
/// ```text
/// Idle → Connecting → Streaming → Draining → Closed
///            └────────(connect failed)──────────┘
/// ```
pub(crate) struct SinkChannel {
    handle: SinkHandle,
    transport: Arc<dyn Transport>,
    shared: Arc<SinkShared>,
    ctx: SinkContext,
    consecutive_failures: u32,
}

impl SinkChannel {
    pub fn new(
        handle: SinkHandle,
        transport: Arc<dyn Transport>,
        shared: Arc<SinkShared>,
        ctx: SinkContext,
    ) -> Self {
        Self {
            handle,
            transport,
            shared,
            ctx,
            consecutive_failures: 0,
        }
    }

    /// Runs the sink until it is closed.
    pub async fn run(mut self) {
        if !self.shared.begin_connecting() {
            // Closed before the task first ran.
            return;
        }
        self.announce(SinkState::Idle, SinkState::Connecting);

        if let Err(error) = self.connect().await {
            tracing::warn!(device = %self.handle.device(), %error, "sink connect failed");
            self.ctx.observers.sink_event(SinkEvent::ConnectFailed {
                device: self.handle.device().clone(),
                error,
            });
            self.transition(SinkState::Closed);
            return;
        }

        if self.should_stop() {
            // Removed or session stopped while the handshake ran.
            self.abandon().await;
            return;
        }

        let Some(mut cursor) = self.join_sync_group().await else {
            if !self.should_stop() {
                let error = format!(
                    "latency query timed out after {:?}",
                    self.ctx.config.latency_probe_timeout
                );
                tracing::warn!(device = %self.handle.device(), %error, "sink connect failed");
                self.ctx.observers.sink_event(SinkEvent::ConnectFailed {
                    device: self.handle.device().clone(),
                    error,
                });
            }
            self.abandon().await;
            return;
        };
        self.transition(SinkState::Streaming);

        let reason = self.stream(&mut cursor).await;

        self.ctx.sync.unregister(&self.handle);
        drop(cursor);
        self.transition(SinkState::Draining);
        self.drain().await;
        self.transition(SinkState::Closed);

        if let Some(reason) = reason.disconnect_reason() {
            tracing::warn!(device = %self.handle.device(), %reason, "sink disconnected");
            self.ctx.observers.sink_event(SinkEvent::Disconnected {
                device: self.handle.device().clone(),
                reason,
            });
        }
    }

    async fn connect(&self) -> Result<(), String> {
        let timeout = self.ctx.config.connect_timeout;
        let device = self.handle.device();
        tokio::select! {
            result = tokio::time::timeout(timeout, self.transport.connect(device)) => match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(err)) => Err(err.to_string()),
                Err(_) => Err(format!("connect timed out after {timeout:?}")),
            },
            () = self.stop_requested() => Ok(()),
        }
    }

    /// Closes a connected sink that never started streaming.
    async fn abandon(&self) {
        self.disconnect_by(Instant::now() + self.ctx.config.drain_timeout)
            .await;
        self.transition(SinkState::Closed);
    }

    /// Probes latency, registers with the sync controller and places the
    /// cursor at `head - target_delay`.
    ///
    /// `None` if the transport never answered or the sink was stopped first.
    async fn join_sync_group(&mut self) -> Option<ReadCursor> {
        let latency = self.query_latency().await?;
        self.shared.set_latency(latency);
        let offset = self.ctx.sync.register(&self.handle, latency);
        let _ = self.shared.delay_offset.set(offset);

        let target = self.ctx.sync.target_delay();
        self.ctx.observers.sink_event(SinkEvent::LatencyUpdated {
            device: self.handle.device().clone(),
            latency,
            target_delay: target,
        });

        let ring = &self.ctx.ring;
        let start = ring
            .head()
            .saturating_sub(delay_in_frames(target, self.ctx.config.frame_duration));
        let cursor = ring.cursor_at(start);
        tracing::info!(
            device = %self.handle.device(),
            transport = self.transport.name(),
            latency_ms = latency.as_millis() as u64,
            target_ms = target.as_millis() as u64,
            seq = cursor.position(),
            "sink streaming"
        );
        Some(cursor)
    }

    async fn stream(&mut self, cursor: &mut ReadCursor) -> StopReason {
        let ring = Arc::clone(&self.ctx.ring);
        let frame_duration = self.ctx.config.frame_duration;
        let max_offset_frames = ring.capacity() as u64 - 1;
        let mut next_probe = Instant::now() + self.ctx.config.latency_probe_interval;

        loop {
            if self.should_stop() {
                return self.stop_reason();
            }

            if Instant::now() >= next_probe {
                self.refresh_latency().await;
                next_probe = Instant::now() + self.ctx.config.latency_probe_interval;
                continue;
            }

            // Register for the wake before looking at the ring.
            let notified = ring.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let offset = self.delay_offset();
            let offset_frames = delay_in_frames(offset, frame_duration).min(max_offset_frames);
            let due_before = ring.head().saturating_sub(offset_frames);

            if cursor.position() >= due_before {
                let _ = tokio::time::timeout(self.ctx.config.wake_timeout, notified).await;
                continue;
            }

            let wanted = cursor.position();
            match cursor.read() {
                ReadResult::Frame(frame) => {
                    if let Some(reason) = self.send(&frame).await {
                        return reason;
                    }
                }
                ReadResult::Lagged(resume_at) => self.record_resync(wanted, resume_at),
                ReadResult::NotYetAvailable => {
                    let _ = tokio::time::timeout(self.ctx.config.wake_timeout, notified).await;
                }
            }
        }
    }

    async fn send(&mut self, frame: &Arc<AudioFrame>) -> Option<StopReason> {
        let gain = self.ctx.volume.get();
        let transport = &self.transport;
        let delivery = async move {
            if (gain - 1.0).abs() < f32::EPSILON {
                transport.send(frame).await
            } else {
                let scaled = frame.with_payload(apply_gain(
                    frame.payload(),
                    frame.format().bit_depth,
                    gain,
                ));
                transport.send(&scaled).await
            }
        };

        // A send stuck on a dead link must not hold up removal or teardown.
        let result = tokio::select! {
            result = delivery => result,
            () = self.stop_requested() => return Some(self.stop_reason()),
        };

        match result {
            Ok(()) => {
                self.consecutive_failures = 0;
                self.shared.frames_sent.fetch_add(1, Ordering::Relaxed);
                self.shared
                    .bytes_sent
                    .fetch_add(frame.payload().len() as u64, Ordering::Relaxed);
                None
            }
            Err(err) if err.is_fatal() => {
                self.shared.send_failures.fetch_add(1, Ordering::Relaxed);
                Some(StopReason::LinkLost(err))
            }
            Err(err) => {
                self.consecutive_failures += 1;
                self.shared.send_failures.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    device = %self.handle.device(),
                    seq = frame.sequence(),
                    consecutive = self.consecutive_failures,
                    error = %err,
                    "send failed, frame skipped"
                );
                if self.consecutive_failures >= self.ctx.config.max_send_failures {
                    Some(StopReason::SendFailures(err))
                } else {
                    None
                }
            }
        }
    }

    fn record_resync(&self, from: u64, to: u64) {
        let skipped = to.saturating_sub(from);
        let missed = self.shared.missed.fetch_add(skipped, Ordering::Relaxed) + skipped;
        self.shared.resyncs.fetch_add(1, Ordering::Relaxed);

        tracing::warn!(
            device = %self.handle.device(),
            from,
            to,
            skipped,
            missed,
            "sink overtaken by writer, resynced"
        );
        self.ctx.observers.sink_event(SinkEvent::Resynced {
            device: self.handle.device().clone(),
            from,
            to,
            missed_frames: missed,
        });

        let threshold = self.ctx.config.miss_alarm_threshold;
        if missed >= threshold && missed - skipped < threshold {
            self.ctx.observers.sink_event(SinkEvent::MissAlarm {
                device: self.handle.device().clone(),
                missed_frames: missed,
            });
        }
    }

    /// Asks the transport for its latency, giving up after the probe
    /// timeout or once the sink is told to stop.
    async fn query_latency(&self) -> Option<Duration> {
        let timeout = self.ctx.config.latency_probe_timeout;
        tokio::select! {
            result = tokio::time::timeout(timeout, self.transport.probe_latency()) => match result {
                Ok(latency) => Some(latency),
                Err(_) => {
                    tracing::warn!(
                        device = %self.handle.device(),
                        timeout_ms = timeout.as_millis() as u64,
                        "latency query timed out"
                    );
                    None
                }
            },
            () = self.stop_requested() => None,
        }
    }

    /// Re-probes while streaming. A missing answer keeps the last estimate.
    async fn refresh_latency(&self) {
        let Some(latency) = self.query_latency().await else {
            return;
        };
        if let Some(target_delay) = self.ctx.sync.report_latency(&self.handle, latency) {
            self.shared.set_latency(latency);
            tracing::debug!(
                device = %self.handle.device(),
                latency_ms = latency.as_millis() as u64,
                target_ms = target_delay.as_millis() as u64,
                "latency estimate updated"
            );
            self.ctx.observers.sink_event(SinkEvent::LatencyUpdated {
                device: self.handle.device().clone(),
                latency,
                target_delay,
            });
        }
    }

    /// Flushes and disconnects, bounded by the drain timeout.
    async fn drain(&self) {
        let deadline = Instant::now() + self.ctx.config.drain_timeout;

        match tokio::time::timeout_at(deadline, self.transport.flush()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                tracing::debug!(device = %self.handle.device(), error = %err, "flush failed");
            }
            Err(_) => {
                tracing::warn!(
                    device = %self.handle.device(),
                    timeout_ms = self.ctx.config.drain_timeout.as_millis() as u64,
                    "drain timed out, force-closing sink"
                );
            }
        }

        self.disconnect_by(deadline).await;
    }

    /// Disconnects the transport, abandoning it at `deadline`.
    ///
    /// Polled at least once even when the deadline has passed.
    async fn disconnect_by(&self, deadline: Instant) {
        if tokio::time::timeout_at(deadline, self.transport.disconnect())
            .await
            .is_err()
        {
            tracing::warn!(
                device = %self.handle.device(),
                timeout_ms = self.ctx.config.drain_timeout.as_millis() as u64,
                "disconnect timed out, abandoning transport"
            );
        }
    }

    fn delay_offset(&self) -> Duration {
        self.shared
            .delay_offset
            .get()
            .map_or(Duration::ZERO, DelayOffset::get)
    }

    fn should_stop(&self) -> bool {
        self.shared.remove_requested() || self.ctx.session.is_cancelled()
    }

    fn stop_reason(&self) -> StopReason {
        if self.shared.remove_requested() {
            StopReason::Removed
        } else {
            StopReason::SessionEnded
        }
    }

    /// Completes once removal or session teardown is requested.
    async fn stop_requested(&self) {
        while !self.should_stop() {
            tokio::time::sleep(self.ctx.config.wake_timeout).await;
        }
    }

    fn transition(&self, to: SinkState) {
        let from = self.shared.set_state(to);
        if from != to {
            self.announce(from, to);
        }
    }

    fn announce(&self, from: SinkState, to: SinkState) {
        tracing::info!(device = %self.handle.device(), ?from, ?to, "sink state changed");
        self.ctx.observers.sink_event(SinkEvent::StateChanged {
            device: self.handle.device().clone(),
            from,
            to,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::AudioFormat;
    use crate::sink::MockTransport;
    use crate::SessionStatus;
    use parking_lot::Mutex;

    fn frame(sequence: u64) -> AudioFrame {
        let format = AudioFormat::dvd_quality();
        AudioFrame::new(
            sequence,
            Duration::from_millis(sequence * 10),
            vec![1u8; 480 * 4],
            format,
        )
    }

    struct Harness {
        ctx: SinkContext,
        events: Arc<Mutex<Vec<SinkEvent>>>,
    }

    impl Harness {
        fn new(config: EngineConfig) -> Self {
            let events = Arc::new(Mutex::new(Vec::new()));
            let recorded = Arc::clone(&events);
            let ctx = SinkContext {
                ring: Arc::new(RingBuffer::new(config.ring_slots())),
                sync: Arc::new(SyncController::from_config(&config)),
                session: Arc::new(SessionState::new()),
                volume: Arc::new(MasterVolume::default()),
                config: Arc::new(config),
                observers: Observers {
                    sink: Some(Arc::new(move |event: SinkEvent| recorded.lock().push(event))),
                    session: None,
                },
            };
            Self { ctx, events }
        }

        fn spawn(
            &self,
            id: u64,
            transport: &MockTransport,
        ) -> (Arc<SinkShared>, tokio::task::JoinHandle<()>) {
            let shared = Arc::new(SinkShared::new());
            let channel = SinkChannel::new(
                SinkHandle::new(id, format!("sink-{id}")),
                Arc::new(transport.clone()),
                Arc::clone(&shared),
                self.ctx.clone(),
            );
            (shared, tokio::spawn(channel.run()))
        }

        fn write(&self, count: u64) {
            let start = self.ctx.ring.head();
            for seq in start..start + count {
                self.ctx.ring.write(frame(seq));
            }
        }

        fn states(&self) -> Vec<SinkState> {
            self.events
                .lock()
                .iter()
                .filter_map(|e| match e {
                    SinkEvent::StateChanged { to, .. } => Some(*to),
                    _ => None,
                })
                .collect()
        }
    }

    fn fast_config() -> EngineConfig {
        EngineConfig {
            wake_timeout: Duration::from_millis(5),
            drain_timeout: Duration::from_millis(100),
            safety_margin: Duration::ZERO,
            ..Default::default()
        }
    }

    async fn wait_for(mut check: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn test_full_lifecycle() {
        let harness = Harness::new(fast_config());
        let transport = MockTransport::new();
        let (shared, task) = harness.spawn(1, &transport);

        wait_for(|| shared.state() == SinkState::Streaming).await;
        harness.write(10);
        wait_for(|| transport.sent_sequences().len() == 10).await;

        assert!(shared.request_remove());
        harness.ctx.ring.wake_all();
        task.await.unwrap();

        assert_eq!(
            harness.states(),
            vec![
                SinkState::Connecting,
                SinkState::Streaming,
                SinkState::Draining,
                SinkState::Closed
            ]
        );
        assert_eq!(transport.sent_sequences(), (0..10).collect::<Vec<_>>());
        assert!(transport.was_flushed());
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_connect_failure_closes_sink() {
        let harness = Harness::new(fast_config());
        let transport = MockTransport::new();
        transport
            .control()
            .fail_connect(TransportError::PairingRequired);
        let (shared, task) = harness.spawn(1, &transport);
        task.await.unwrap();

        assert_eq!(shared.state(), SinkState::Closed);
        assert_eq!(
            harness.states(),
            vec![SinkState::Connecting, SinkState::Closed]
        );
        assert!(harness
            .events
            .lock()
            .iter()
            .any(|e| matches!(e, SinkEvent::ConnectFailed { .. })));
    }

    #[tokio::test]
    async fn test_connect_timeout() {
        let harness = Harness::new(EngineConfig {
            connect_timeout: Duration::from_millis(20),
            ..fast_config()
        });
        let transport = MockTransport::new();
        transport.control().hang_connect(true);
        let (shared, task) = harness.spawn(1, &transport);

        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(shared.state(), SinkState::Closed);
    }

    #[tokio::test]
    async fn test_removal_interrupts_hung_latency_query() {
        let harness = Harness::new(fast_config());
        let transport = MockTransport::new();
        transport.control().hang_latency(true);
        let (shared, task) = harness.spawn(1, &transport);
        wait_for(|| transport.is_connected()).await;

        shared.request_remove();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(shared.state(), SinkState::Closed);
        assert_eq!(
            harness.states(),
            vec![SinkState::Connecting, SinkState::Closed]
        );
        assert!(!transport.is_connected());
        assert!(harness.ctx.sync.snapshot().latencies.is_empty());
    }

    #[tokio::test]
    async fn test_unanswered_latency_query_fails_connect() {
        let harness = Harness::new(EngineConfig {
            latency_probe_timeout: Duration::from_millis(20),
            ..fast_config()
        });
        let transport = MockTransport::new();
        transport.control().hang_latency(true);
        let (shared, task) = harness.spawn(1, &transport);

        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(shared.state(), SinkState::Closed);
        assert!(!transport.is_connected());
        assert!(harness
            .events
            .lock()
            .iter()
            .any(|e| matches!(e, SinkEvent::ConnectFailed { error, .. } if error.contains("latency"))));
    }

    #[tokio::test]
    async fn test_removal_interrupts_hung_latency_refresh() {
        let harness = Harness::new(EngineConfig {
            latency_probe_interval: Duration::from_millis(10),
            latency_probe_timeout: Duration::from_secs(30),
            ..fast_config()
        });
        let transport = MockTransport::new();
        let (shared, task) = harness.spawn(1, &transport);
        wait_for(|| shared.state() == SinkState::Streaming).await;

        transport.control().hang_latency(true);
        tokio::time::sleep(Duration::from_millis(40)).await;
        shared.request_remove();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(shared.state(), SinkState::Closed);
    }

    #[tokio::test]
    async fn test_refresh_timeout_keeps_streaming() {
        let harness = Harness::new(EngineConfig {
            latency_probe_interval: Duration::from_millis(10),
            latency_probe_timeout: Duration::from_millis(10),
            ..fast_config()
        });
        let transport = MockTransport::with_latency(Duration::from_millis(30));
        let (shared, _task) = harness.spawn(1, &transport);
        wait_for(|| shared.state() == SinkState::Streaming).await;

        transport.control().hang_latency(true);
        harness.write(5);
        wait_for(|| transport.sent_sequences().len() == 5).await;

        assert_eq!(shared.state(), SinkState::Streaming);
        assert_eq!(shared.latency(), Duration::from_millis(30));
        shared.request_remove();
    }

    #[tokio::test]
    async fn test_sink_closed_before_start_never_connects() {
        let harness = Harness::new(fast_config());
        let transport = MockTransport::new();
        let shared = Arc::new(SinkShared::new());
        assert!(shared.close_if_idle());

        let channel = SinkChannel::new(
            SinkHandle::new(1, "sink-1"),
            Arc::new(transport.clone()),
            Arc::clone(&shared),
            harness.ctx.clone(),
        );
        channel.run().await;

        assert_eq!(shared.state(), SinkState::Closed);
        assert_eq!(transport.connect_count(), 0);
        assert!(harness.events.lock().is_empty());
        // A started sink can no longer be closed in place.
        let started = SinkShared::new();
        assert!(started.begin_connecting());
        assert!(!started.close_if_idle());
    }

    #[tokio::test]
    async fn test_initial_cursor_is_target_delay_behind_head() {
        let harness = Harness::new(fast_config());
        harness.write(500);

        // 100ms latency, no margin: 10 frames behind the writer.
        let transport = MockTransport::with_latency(Duration::from_millis(100));
        let (shared, _task) = harness.spawn(1, &transport);

        wait_for(|| !transport.sent_sequences().is_empty()).await;
        assert_eq!(transport.sent_sequences()[0], 490);
        shared.request_remove();
    }

    #[tokio::test]
    async fn test_send_failures_disconnect_sink() {
        let harness = Harness::new(fast_config());
        let transport = MockTransport::new();
        let (shared, task) = harness.spawn(1, &transport);
        wait_for(|| shared.state() == SinkState::Streaming).await;

        transport.control().fail_next_sends(3, TransportError::Busy);
        harness.write(5);
        task.await.unwrap();

        assert_eq!(shared.state(), SinkState::Closed);
        assert_eq!(shared.health(&DeviceId::new("sink-1")).send_failures, 3);
        assert!(harness
            .events
            .lock()
            .iter()
            .any(|e| matches!(e, SinkEvent::Disconnected { .. })));
        // The session is untouched.
        assert_eq!(harness.ctx.session.status(), SessionStatus::Streaming);
    }

    #[tokio::test]
    async fn test_isolated_failures_are_tolerated() {
        let harness = Harness::new(fast_config());
        let transport = MockTransport::new();
        let (shared, _task) = harness.spawn(1, &transport);
        wait_for(|| shared.state() == SinkState::Streaming).await;

        transport.control().fail_next_sends(2, TransportError::Busy);
        harness.write(6);
        wait_for(|| transport.sent_sequences().len() == 4).await;

        assert_eq!(shared.state(), SinkState::Streaming);
        assert_eq!(transport.sent_sequences(), vec![2, 3, 4, 5]);
        shared.request_remove();
    }

    #[tokio::test]
    async fn test_link_loss_is_immediate() {
        let harness = Harness::new(fast_config());
        let transport = MockTransport::new();
        let (shared, task) = harness.spawn(1, &transport);
        wait_for(|| shared.state() == SinkState::Streaming).await;

        transport
            .control()
            .fail_next_sends(1, TransportError::LinkLost("out of range".into()));
        harness.write(3);
        task.await.unwrap();
        assert_eq!(shared.state(), SinkState::Closed);
        assert!(transport.sent_sequences().is_empty());
    }

    #[tokio::test]
    async fn test_drain_timeout_force_closes() {
        let harness = Harness::new(fast_config());
        let transport = MockTransport::new();
        transport.control().hang_flush(true);
        let (shared, task) = harness.spawn(1, &transport);
        wait_for(|| shared.state() == SinkState::Streaming).await;

        let start = std::time::Instant::now();
        shared.request_remove();
        task.await.unwrap();

        assert_eq!(shared.state(), SinkState::Closed);
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_hung_disconnect_is_bounded() {
        let harness = Harness::new(fast_config());
        let transport = MockTransport::new();
        transport.control().hang_disconnect(true);
        let (shared, task) = harness.spawn(1, &transport);
        wait_for(|| shared.state() == SinkState::Streaming).await;

        let start = std::time::Instant::now();
        shared.request_remove();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(shared.state(), SinkState::Closed);
        assert!(transport.was_flushed());
        assert!(start.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_lagging_sink_resyncs() {
        let harness = Harness::new(EngineConfig {
            ring_capacity: Duration::from_millis(80),
            miss_alarm_threshold: 5,
            ..fast_config()
        });
        let transport = MockTransport::new();
        let (shared, _task) = harness.spawn(1, &transport);
        wait_for(|| shared.state() == SinkState::Streaming).await;

        transport.control().block_sends(true);
        harness.write(1);
        wait_for(|| transport.pending_sends() == 1).await;
        // Ring holds 8 frames; overrun it while the sink is stuck in send.
        harness.write(20);
        transport.control().block_sends(false);

        wait_for(|| transport.sent_sequences().last() == Some(&20)).await;
        let sent = transport.sent_sequences();
        assert!(sent.windows(2).all(|w| w[0] < w[1]), "not monotonic: {sent:?}");

        let health = shared.health(&DeviceId::new("sink-1"));
        assert_eq!(health.resyncs, 1);
        assert!(health.missed_frames > 0);
        let events = harness.events.lock();
        assert!(events.iter().any(|e| matches!(e, SinkEvent::Resynced { .. })));
        assert!(events.iter().any(|e| matches!(e, SinkEvent::MissAlarm { .. })));
        shared.request_remove();
    }

    #[tokio::test]
    async fn test_volume_is_applied_at_dispatch() {
        let harness = Harness::new(fast_config());
        harness.ctx.volume.set(0.0);
        let transport = MockTransport::new();
        let (shared, _task) = harness.spawn(1, &transport);
        wait_for(|| shared.state() == SinkState::Streaming).await;

        harness.write(1);
        wait_for(|| transport.sent_sequences().len() == 1).await;
        assert!(transport.last_payload().unwrap().iter().all(|&b| b == 0));
        shared.request_remove();
    }

    #[tokio::test]
    async fn test_session_cancel_drains_sink() {
        let harness = Harness::new(fast_config());
        let transport = MockTransport::new();
        let (shared, task) = harness.spawn(1, &transport);
        wait_for(|| shared.state() == SinkState::Streaming).await;

        harness.ctx.session.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(shared.state(), SinkState::Closed);
        // Teardown is not a disconnect.
        assert!(!harness
            .events
            .lock()
            .iter()
            .any(|e| matches!(e, SinkEvent::Disconnected { .. })));
    }
}
