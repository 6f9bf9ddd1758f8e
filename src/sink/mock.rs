//! Mock transport for testing without a Bluetooth stack.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::sink::Transport;
use crate::{AudioFrame, DeviceId, TransportError};

struct MockState {
    latency: Mutex<Duration>,
    send_delay: Mutex<Duration>,
    connect_error: Mutex<Option<TransportError>>,
    hang_connect: AtomicBool,
    hang_flush: AtomicBool,
    hang_latency: AtomicBool,
    hang_disconnect: AtomicBool,
    failing_sends: Mutex<(u32, Option<TransportError>)>,
    blocked: watch::Sender<bool>,
    pending_sends: AtomicUsize,
    sent: Mutex<Vec<u64>>,
    last_payload: Mutex<Option<Vec<u8>>>,
    connected: AtomicBool,
    connects: AtomicU64,
    flushed: AtomicBool,
}

/// Handle for scripting a [`MockTransport`] from the test side.
#[derive(Clone)]
pub struct MockTransportControl(Arc<MockState>);

impl MockTransportControl {
    /// Sets the latency reported by the next probes.
    pub fn set_latency(&self, latency: Duration) {
        *self.0.latency.lock() = latency;
    }

    /// Delays every send, simulating a slow link.
    pub fn set_send_delay(&self, delay: Duration) {
        *self.0.send_delay.lock() = delay;
    }

    /// Makes the next `connect` fail with `error`.
    pub fn fail_connect(&self, error: TransportError) {
        *self.0.connect_error.lock() = Some(error);
    }

    /// Makes `connect` never complete while set.
    pub fn hang_connect(&self, hang: bool) {
        self.0.hang_connect.store(hang, Ordering::SeqCst);
    }

    /// Makes the next `count` sends fail with `error`.
    pub fn fail_next_sends(&self, count: u32, error: TransportError) {
        *self.0.failing_sends.lock() = (count, Some(error));
    }

    /// Holds every send until unblocked, simulating a stalled link.
    pub fn block_sends(&self, blocked: bool) {
        self.0.blocked.send_replace(blocked);
    }

    /// Makes `flush` never complete while set.
    pub fn hang_flush(&self, hang: bool) {
        self.0.hang_flush.store(hang, Ordering::SeqCst);
    }

    /// Makes `probe_latency` never answer while set.
    pub fn hang_latency(&self, hang: bool) {
        self.0.hang_latency.store(hang, Ordering::SeqCst);
    }

    /// Makes `disconnect` never complete while set.
    pub fn hang_disconnect(&self, hang: bool) {
        self.0.hang_disconnect.store(hang, Ordering::SeqCst);
    }
}

/// A transport that records what it is sent.
///
/// Cloning shares the recording, so a test can keep one clone while the
/// engine owns another.
///
/// # Example
///
/// ```
/// use fanout_audio::{MockTransport, Transport, TransportError};
/// use std::time::Duration;
///
/// let transport = MockTransport::with_latency(Duration::from_millis(150));
/// transport.control().fail_next_sends(2, TransportError::Busy);
/// assert!(transport.sent_sequences().is_empty());
/// ```
#[derive(Clone)]
pub struct MockTransport {
    state: Arc<MockState>,
}

impl MockTransport {
    /// Creates a transport with zero latency.
    pub fn new() -> Self {
        Self::with_latency(Duration::ZERO)
    }

    /// Creates a transport reporting a fixed latency.
    pub fn with_latency(latency: Duration) -> Self {
        let (blocked, _) = watch::channel(false);
        Self {
            state: Arc::new(MockState {
                latency: Mutex::new(latency),
                send_delay: Mutex::new(Duration::ZERO),
                connect_error: Mutex::new(None),
                hang_connect: AtomicBool::new(false),
                hang_flush: AtomicBool::new(false),
                hang_latency: AtomicBool::new(false),
                hang_disconnect: AtomicBool::new(false),
                failing_sends: Mutex::new((0, None)),
                blocked,
                pending_sends: AtomicUsize::new(0),
                sent: Mutex::new(Vec::new()),
                last_payload: Mutex::new(None),
                connected: AtomicBool::new(false),
                connects: AtomicU64::new(0),
                flushed: AtomicBool::new(false),
            }),
        }
    }

    /// Returns a control handle for scripting failures.
    pub fn control(&self) -> MockTransportControl {
        MockTransportControl(Arc::clone(&self.state))
    }

    /// Sequence numbers accepted so far, in delivery order.
    pub fn sent_sequences(&self) -> Vec<u64> {
        self.state.sent.lock().clone()
    }

    /// Payload of the most recently accepted frame.
    pub fn last_payload(&self) -> Option<Vec<u8>> {
        self.state.last_payload.lock().clone()
    }

    /// Sends currently in flight.
    pub fn pending_sends(&self) -> usize {
        self.state.pending_sends.load(Ordering::SeqCst)
    }

    /// Returns `true` between a successful `connect` and `disconnect`.
    pub fn is_connected(&self) -> bool {
        self.state.connected.load(Ordering::SeqCst)
    }

    /// Number of successful `connect` calls.
    pub fn connect_count(&self) -> u64 {
        self.state.connects.load(Ordering::SeqCst)
    }

    /// Returns `true` once `flush` completed.
    pub fn was_flushed(&self) -> bool {
        self.state.flushed.load(Ordering::SeqCst)
    }

    fn take_send_failure(&self) -> Option<TransportError> {
        let mut failing = self.state.failing_sends.lock();
        if failing.0 == 0 {
            return None;
        }
        failing.0 -= 1;
        failing.1.clone()
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn name(&self) -> &str {
        "mock-transport"
    }

    async fn connect(&self, device: &DeviceId) -> Result<(), TransportError> {
        if self.state.hang_connect.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if let Some(err) = self.state.connect_error.lock().take() {
            return Err(err);
        }
        tracing::debug!(%device, "mock transport connected");
        self.state.connected.store(true, Ordering::SeqCst);
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn send(&self, frame: &AudioFrame) -> Result<(), TransportError> {
        self.state.pending_sends.fetch_add(1, Ordering::SeqCst);
        let mut blocked = self.state.blocked.subscribe();
        let _ = blocked.wait_for(|blocked| !*blocked).await;

        let delay = *self.state.send_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.state.pending_sends.fetch_sub(1, Ordering::SeqCst);

        if let Some(err) = self.take_send_failure() {
            return Err(err);
        }
        self.state.sent.lock().push(frame.sequence());
        *self.state.last_payload.lock() = Some(frame.payload().to_vec());
        Ok(())
    }

    async fn probe_latency(&self) -> Duration {
        if self.state.hang_latency.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        *self.state.latency.lock()
    }

    async fn flush(&self) -> Result<(), TransportError> {
        if self.state.hang_flush.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        self.state.flushed.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) {
        if self.state.hang_disconnect.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        self.state.connected.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::AudioFormat;

    fn frame(sequence: u64) -> AudioFrame {
        AudioFrame::new(sequence, Duration::ZERO, vec![3u8; 8], AudioFormat::dvd_quality())
    }

    #[tokio::test]
    async fn test_records_sent_frames() {
        let transport = MockTransport::new();
        transport.connect(&DeviceId::new("a")).await.unwrap();
        assert!(transport.is_connected());

        transport.send(&frame(4)).await.unwrap();
        transport.send(&frame(5)).await.unwrap();
        assert_eq!(transport.sent_sequences(), vec![4, 5]);
        assert_eq!(transport.last_payload(), Some(vec![3u8; 8]));

        transport.disconnect().await;
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_scripted_send_failures() {
        let transport = MockTransport::new();
        transport.control().fail_next_sends(2, TransportError::Busy);

        assert_eq!(transport.send(&frame(0)).await, Err(TransportError::Busy));
        assert_eq!(transport.send(&frame(1)).await, Err(TransportError::Busy));
        assert!(transport.send(&frame(2)).await.is_ok());
        assert_eq!(transport.sent_sequences(), vec![2]);
    }

    #[tokio::test]
    async fn test_connect_failure_is_one_shot() {
        let transport = MockTransport::new();
        transport.control().fail_connect(TransportError::Unreachable);
        let device = DeviceId::new("a");

        assert_eq!(transport.connect(&device).await, Err(TransportError::Unreachable));
        assert!(transport.connect(&device).await.is_ok());
        assert_eq!(transport.connect_count(), 1);
    }

    #[tokio::test]
    async fn test_blocked_send_waits() {
        let transport = MockTransport::new();
        transport.control().block_sends(true);

        let sender = transport.clone();
        let task = tokio::spawn(async move { sender.send(&frame(0)).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(transport.pending_sends(), 1);
        assert!(transport.sent_sequences().is_empty());

        transport.control().block_sends(false);
        task.await.unwrap().unwrap();
        assert_eq!(transport.sent_sequences(), vec![0]);
        assert_eq!(transport.pending_sends(), 0);
    }

    #[tokio::test]
    async fn test_latency_can_change() {
        let transport = MockTransport::with_latency(Duration::from_millis(80));
        assert_eq!(transport.probe_latency().await, Duration::from_millis(80));
        transport.control().set_latency(Duration::from_millis(240));
        assert_eq!(transport.probe_latency().await, Duration::from_millis(240));
    }
}
