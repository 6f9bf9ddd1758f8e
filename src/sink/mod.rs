//! Transport trait and per-device sink channels.
//!
//! A [`Transport`] is the platform link to one output device (an A2DP
//! connection, a network speaker, ...). The engine wraps each transport in a
//! sink channel: an independent task that reads the shared ring buffer at
//! its own pace and forwards frames through the transport.
//!
//! The crate ships [`MockTransport`] for tests and demos. Real deployments
//! implement [`Transport`] over their Bluetooth or network stack.

mod channel;
mod mock;

pub(crate) use channel::{SinkChannel, SinkContext, SinkShared};
pub use mock::{MockTransport, MockTransportControl};

use std::time::Duration;

use async_trait::async_trait;

use crate::{AudioFrame, DeviceId, TransportError};

/// Link to one output device.
///
/// # Implementation Notes
///
/// - Methods take `&self` - use interior mutability (`Mutex`, atomics) if needed
/// - All methods are async and run on the tokio runtime
/// - `send` is only ever called from the sink's own task, in sequence order
/// - A [`TransportError::LinkLost`] from `send` closes the sink at once;
///   other errors count toward the consecutive failure limit
///
/// # Example
///
/// ```
/// use fanout_audio::{AudioFrame, DeviceId, Transport, TransportError};
/// use async_trait::async_trait;
/// use std::time::Duration;
///
/// struct NullTransport;
///
/// #[async_trait]
/// impl Transport for NullTransport {
///     async fn connect(&self, _device: &DeviceId) -> Result<(), TransportError> {
///         Ok(())
///     }
///
///     async fn send(&self, _frame: &AudioFrame) -> Result<(), TransportError> {
///         Ok(())
///     }
///
///     async fn probe_latency(&self) -> Duration {
///         Duration::from_millis(120)
///     }
///
///     async fn disconnect(&self) {}
/// }
/// ```
#[async_trait]
pub trait Transport: Send + Sync {
    /// Human-readable name for logging.
    fn name(&self) -> &str {
        "transport"
    }

    /// Performs the link handshake.
    ///
    /// Fails with [`TransportError::PairingRequired`],
    /// [`TransportError::Unreachable`] or [`TransportError::Rejected`].
    async fn connect(&self, device: &DeviceId) -> Result<(), TransportError>;

    /// Hands one frame to the link.
    async fn send(&self, frame: &AudioFrame) -> Result<(), TransportError>;

    /// Current estimate of capture-to-render latency on this link.
    async fn probe_latency(&self) -> Duration;

    /// Waits until frames already handed to the link are played out.
    ///
    /// Default implementation returns immediately.
    async fn flush(&self) -> Result<(), TransportError> {
        Ok(())
    }

    /// Tears the link down.
    async fn disconnect(&self);
}

/// Identifies one sink registered with a [`FanoutEngine`](crate::FanoutEngine).
///
/// Handles are cheap to clone and stay valid after the sink closed; calls
/// with a handle of a closed sink are no-ops.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SinkHandle {
    id: u64,
    device: DeviceId,
}

impl SinkHandle {
    /// Creates a handle. The engine allocates ids; this is public for
    /// driving a [`SyncController`](crate::SyncController) directly.
    pub fn new(id: u64, device: impl Into<DeviceId>) -> Self {
        Self {
            id,
            device: device.into(),
        }
    }

    /// Engine-unique sink id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Device the sink drives.
    pub fn device(&self) -> &DeviceId {
        &self.device
    }
}

impl std::fmt::Display for SinkHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.device, self.id)
    }
}
