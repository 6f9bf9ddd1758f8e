//! Configuration types for the fan-out engine.

use std::time::Duration;

use crate::format::AudioFormat;
use crate::EngineError;

/// Largest ring capacity accepted by [`EngineConfig::validate`].
const MAX_RING_CAPACITY: Duration = Duration::from_secs(60);

/// Configuration for engine behavior.
///
/// Use [`EngineConfig::default()`] for sensible defaults, or customize as needed.
/// The safety margin and capacity defaults are starting points; a real
/// deployment should calibrate them against measured A2DP link latencies,
/// which typically sit between 100 and 300ms.
///
/// # Example
///
/// ```
/// use fanout_audio::EngineConfig;
/// use std::time::Duration;
///
/// let config = EngineConfig {
///     safety_margin: Duration::from_millis(40),
///     silence_fill_on_stall: true,
///     ..Default::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Capture format used when a session is started without an explicit one.
    ///
    /// Default: 48kHz stereo 16-bit
    pub format: AudioFormat,

    /// Expected interval between captured frames.
    ///
    /// Stall detection fires after twice this interval without a frame, and
    /// silence-fill frames are this long.
    /// Default: 10ms
    pub frame_duration: Duration,

    /// Amount of audio the ring buffer holds.
    ///
    /// Rounded up to a power-of-two number of frame slots. Must cover the
    /// largest tolerated sink latency plus the safety margin.
    /// Default: 2 seconds
    pub ring_capacity: Duration,

    /// Margin added on top of the slowest sink's latency.
    ///
    /// Default: 20ms
    pub safety_margin: Duration,

    /// Fill capture stalls with silence so sink clocks keep moving.
    ///
    /// When disabled, sinks simply see no new data until capture resumes.
    /// Default: false
    pub silence_fill_on_stall: bool,

    /// Missed frames after which a sink raises a [`SinkEvent::MissAlarm`].
    ///
    /// Default: 50
    ///
    /// [`SinkEvent::MissAlarm`]: crate::SinkEvent::MissAlarm
    pub miss_alarm_threshold: u64,

    /// Latency changes smaller than this do not trigger a sync recompute.
    ///
    /// Default: 5ms
    pub latency_hysteresis: Duration,

    /// Number of frame intervals over which a target delay decrease is ramped.
    ///
    /// Default: 50
    pub delay_ramp_frames: u32,

    /// Consecutive transport send failures that force a sink to close.
    ///
    /// Default: 3
    pub max_send_failures: u32,

    /// Upper bound on the draining phase before a sink is force-closed.
    ///
    /// Default: 500ms
    pub drain_timeout: Duration,

    /// Upper bound on the transport handshake.
    ///
    /// Default: 10 seconds
    pub connect_timeout: Duration,

    /// How often each streaming sink re-probes its transport latency.
    ///
    /// Default: 1 second
    pub latency_probe_interval: Duration,

    /// Upper bound on a single transport latency query.
    ///
    /// A sink whose first query times out never starts streaming; later
    /// timeouts keep the previous estimate.
    ///
    /// Default: 2 seconds
    pub latency_probe_timeout: Duration,

    /// Longest a sink waits for the writer before re-checking its state.
    ///
    /// Default: 50ms
    pub wake_timeout: Duration,

    /// Interval between [`SessionEvent::Health`] snapshots.
    ///
    /// Default: 1 second
    ///
    /// [`SessionEvent::Health`]: crate::SessionEvent::Health
    pub health_interval: Duration,

    /// Times the capture device is re-opened after being lost before the
    /// session fails.
    ///
    /// Default: 0
    pub capture_recovery_attempts: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            format: AudioFormat::default(),
            frame_duration: Duration::from_millis(10),
            ring_capacity: Duration::from_secs(2),
            safety_margin: Duration::from_millis(20),
            silence_fill_on_stall: false,
            miss_alarm_threshold: 50,
            latency_hysteresis: Duration::from_millis(5),
            delay_ramp_frames: 50,
            max_send_failures: 3,
            drain_timeout: Duration::from_millis(500),
            connect_timeout: Duration::from_secs(10),
            latency_probe_interval: Duration::from_secs(1),
            latency_probe_timeout: Duration::from_secs(2),
            wake_timeout: Duration::from_millis(50),
            health_interval: Duration::from_secs(1),
            capture_recovery_attempts: 0,
        }
    }
}

impl EngineConfig {
    /// Checks every option for values the engine cannot run with.
    pub fn validate(&self) -> Result<(), EngineError> {
        self.format.validate()?;

        if self.frame_duration.is_zero() || self.frame_duration > Duration::from_secs(1) {
            return Err(EngineError::invalid_config(format!(
                "frame duration {:?} out of range (0, 1s]",
                self.frame_duration
            )));
        }
        if self.format.frames_in(self.frame_duration) == 0 {
            return Err(EngineError::invalid_config(
                "frame duration shorter than one sample",
            ));
        }
        if self.ring_capacity < self.frame_duration * 2 || self.ring_capacity > MAX_RING_CAPACITY {
            return Err(EngineError::invalid_config(format!(
                "ring capacity {:?} must hold at least two frames and at most {:?}",
                self.ring_capacity, MAX_RING_CAPACITY
            )));
        }
        if self.safety_margin >= self.ring_capacity {
            return Err(EngineError::invalid_config(
                "safety margin must be smaller than the ring capacity",
            ));
        }
        if self.delay_ramp_frames == 0 {
            return Err(EngineError::invalid_config("delay_ramp_frames must be at least 1"));
        }
        if self.max_send_failures == 0 {
            return Err(EngineError::invalid_config("max_send_failures must be at least 1"));
        }
        if self.latency_probe_timeout.is_zero() {
            return Err(EngineError::invalid_config(
                "latency_probe_timeout must be non-zero",
            ));
        }
        if self.wake_timeout.is_zero() || self.health_interval.is_zero() {
            return Err(EngineError::invalid_config(
                "wake_timeout and health_interval must be non-zero",
            ));
        }
        Ok(())
    }

    /// Number of frame slots the ring buffer needs for `ring_capacity`.
    ///
    /// Always a power of two so slot indices wrap with a mask.
    #[must_use]
    pub fn ring_slots(&self) -> usize {
        let frame_ns = self.frame_duration.as_nanos().max(1);
        let slots = self.ring_capacity.as_nanos().div_ceil(frame_ns);
        (slots as usize).max(2).next_power_of_two()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::BitDepth;

    #[test]
    fn test_engine_config_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.format, AudioFormat::new(48000, 2, BitDepth::Sixteen));
        assert_eq!(config.frame_duration, Duration::from_millis(10));
        assert_eq!(config.ring_capacity, Duration::from_secs(2));
        assert_eq!(config.safety_margin, Duration::from_millis(20));
        assert!(!config.silence_fill_on_stall);
        assert_eq!(config.max_send_failures, 3);
        assert_eq!(config.drain_timeout, Duration::from_millis(500));
        assert_eq!(config.latency_probe_timeout, Duration::from_secs(2));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_ring_slots_power_of_two() {
        let config = EngineConfig::default();
        // 2s / 10ms = 200 frames, rounded up to 256 slots
        assert_eq!(config.ring_slots(), 256);

        let config = EngineConfig {
            ring_capacity: Duration::from_millis(640),
            ..Default::default()
        };
        assert_eq!(config.ring_slots(), 64);
    }

    #[test]
    fn test_validate_rejects_tiny_ring() {
        let config = EngineConfig {
            ring_capacity: Duration::from_millis(10),
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(EngineError::InvalidConfig { .. })
        ));
    }

    #[test]
    fn test_validate_rejects_zero_frame_duration() {
        let config = EngineConfig {
            frame_duration: Duration::ZERO,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_margin_beyond_capacity() {
        let config = EngineConfig {
            safety_margin: Duration::from_secs(3),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_format() {
        let config = EngineConfig {
            format: AudioFormat::new(48000, 0, BitDepth::Sixteen),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
