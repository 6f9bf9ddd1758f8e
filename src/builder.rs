//! Builder pattern for `FanoutEngine`.

use std::sync::Arc;

use crate::engine::FanoutEngine;
use crate::event::Observers;
use crate::source::{CaptureDevice, CaptureSource};
use crate::{EngineConfig, EngineError, SessionEvent, SessionEventSink, SinkEvent, SinkEventSink};

/// Builder for configuring a [`FanoutEngine`].
///
/// Use [`FanoutEngine::builder()`] to create a new builder. A capture device
/// is required; everything else has defaults.
///
/// # Example
///
/// ```
/// use fanout_audio::{EngineConfig, FanoutEngine};
/// use fanout_audio::source::MockCapture;
/// use std::time::Duration;
///
/// let engine = FanoutEngine::builder()
///     .capture(MockCapture::new(Duration::from_millis(10)))
///     .with_config(EngineConfig {
///         safety_margin: Duration::from_millis(40),
///         ..Default::default()
///     })
///     .on_session_event(|e| tracing::info!(?e, "session event"))
///     .build()
///     .unwrap();
///
/// assert_eq!(engine.config().safety_margin, Duration::from_millis(40));
/// ```
#[must_use]
pub struct FanoutEngineBuilder {
    capture: Option<Box<dyn CaptureDevice>>,
    config: EngineConfig,
    sink_observer: Option<Arc<dyn SinkEventSink>>,
    session_observer: Option<Arc<dyn SessionEventSink>>,
}

impl Default for FanoutEngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl FanoutEngineBuilder {
    /// Creates a new builder with default settings.
    pub fn new() -> Self {
        Self {
            capture: None,
            config: EngineConfig::default(),
            sink_observer: None,
            session_observer: None,
        }
    }

    /// Set the capture device sessions read from.
    pub fn capture<D: CaptureDevice + 'static>(mut self, device: D) -> Self {
        self.capture = Some(Box::new(device));
        self
    }

    /// Set custom engine configuration.
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Set a callback for per-device events.
    ///
    /// Called from sink tasks; keep it short.
    pub fn on_sink_event<F>(mut self, callback: F) -> Self
    where
        F: Fn(SinkEvent) + Send + Sync + 'static,
    {
        self.sink_observer = Some(Arc::new(callback));
        self
    }

    /// Set a callback for session-wide events.
    ///
    /// Stall and failure events are raised on the capture thread.
    pub fn on_session_event<F>(mut self, callback: F) -> Self
    where
        F: Fn(SessionEvent) + Send + Sync + 'static,
    {
        self.session_observer = Some(Arc::new(callback));
        self
    }

    /// Set a shared observer for per-device events.
    pub fn sink_observer(mut self, observer: Arc<dyn SinkEventSink>) -> Self {
        self.sink_observer = Some(observer);
        self
    }

    /// Set a shared observer for session-wide events.
    pub fn session_observer(mut self, observer: Arc<dyn SessionEventSink>) -> Self {
        self.session_observer = Some(observer);
        self
    }

    /// Builds the engine. No capture is opened until a session starts.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidConfig`] if no capture device was set or
    /// the configuration is invalid.
    pub fn build(self) -> Result<FanoutEngine, EngineError> {
        let device = self
            .capture
            .ok_or_else(|| EngineError::invalid_config("no capture device configured"))?;
        self.config.validate()?;

        tracing::debug!(device = device.name(), "building fan-out engine");
        let observers = Observers {
            sink: self.sink_observer,
            session: self.session_observer,
        };
        Ok(FanoutEngine::new(
            CaptureSource::new(device),
            self.config,
            observers,
        ))
    }
}
