//! Error types for fanout-audio.
//!
//! Errors are split into three categories:
//! - **Fatal errors** ([`EngineError`]): Prevent a session from starting, or end it
//! - **Collaborator errors** ([`CaptureError`], [`TransportError`]): Reported by
//!   the platform capture and per-device transport implementations
//! - **Recoverable events**: Runtime issues surfaced via
//!   [`SinkEvent`](crate::SinkEvent) and [`SessionEvent`](crate::SessionEvent)

/// Fatal errors returned by [`FanoutEngine`](crate::FanoutEngine) operations.
///
/// Runtime issues (slow sinks, transport failures, capture stalls) never show
/// up here. They are converted to events and sink state transitions instead.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    /// `start_session` was called while a session is streaming.
    #[error("a session is already active - call stop_session() first")]
    SessionAlreadyActive,

    /// The engine configuration or requested format is invalid.
    #[error("invalid configuration: {reason}")]
    InvalidConfig {
        /// What was wrong with the configuration.
        reason: String,
    },

    /// The capture device could not be opened.
    #[error("capture device unavailable: {reason}")]
    CaptureUnavailable {
        /// Reason reported by the capture collaborator.
        reason: String,
    },

    /// The capture device rejected the requested format.
    #[error("capture format unsupported: {format}")]
    FormatUnsupported {
        /// Human-readable description of the rejected format.
        format: String,
    },

    /// Capture was lost mid-session and could not be recovered.
    #[error("capture lost: {reason}")]
    CaptureLost {
        /// Reason reported by the capture collaborator.
        reason: String,
    },
}

impl EngineError {
    /// Creates an invalid configuration error with the given reason.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }
}

/// Errors reported by a [`CaptureDevice`](crate::source::CaptureDevice).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CaptureError {
    /// No capture endpoint is available (no output device, access denied, ...).
    #[error("device unavailable: {0}")]
    DeviceUnavailable(String),

    /// The device cannot deliver the requested format.
    #[error("format unsupported: {0}")]
    FormatUnsupported(String),

    /// The device disappeared while capturing.
    #[error("device lost: {0}")]
    DeviceLost(String),
}

impl From<CaptureError> for EngineError {
    fn from(err: CaptureError) -> Self {
        match err {
            CaptureError::DeviceUnavailable(reason) => Self::CaptureUnavailable { reason },
            CaptureError::FormatUnsupported(format) => Self::FormatUnsupported { format },
            CaptureError::DeviceLost(reason) => Self::CaptureLost { reason },
        }
    }
}

/// Errors reported by a [`Transport`](crate::Transport) implementation.
///
/// Transport errors are per-sink and recoverable from the session's point of
/// view: the worst outcome is that one sink drains and closes.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The device must be paired before it can be connected.
    #[error("pairing required")]
    PairingRequired,

    /// The device could not be reached.
    #[error("device unreachable")]
    Unreachable,

    /// The device refused the connection.
    #[error("connection rejected: {0}")]
    Rejected(String),

    /// The link is temporarily saturated; the frame was not accepted.
    #[error("transport busy")]
    Busy,

    /// The link is gone.
    #[error("link lost: {0}")]
    LinkLost(String),

    /// Custom error for user-implemented transports.
    #[error("{0}")]
    Custom(String),
}

impl TransportError {
    /// Creates a custom transport error with the given message.
    pub fn custom(msg: impl Into<String>) -> Self {
        Self::Custom(msg.into())
    }

    /// Returns `true` if the link cannot carry any more frames.
    ///
    /// Fatal errors move a streaming sink straight to draining. Non-fatal
    /// ones count toward the consecutive send failure limit.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::LinkLost(_))
    }
}
