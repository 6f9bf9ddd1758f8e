//! # fanout-audio
//!
//! **Note:** This crate is under active development. The API may change before 1.0.
//!
//! Real-time fan-out of one captured audio stream to many output devices.
//!
//! `fanout-audio` captures the system's rendered output once and plays it on
//! several independently-clocked devices (Bluetooth speakers, headsets) at
//! the same time, delaying the faster devices so everything sounds in sync.
//! A slow or disconnecting device never blocks capture or any other device.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use fanout_audio::{FanoutEngine, MockTransport, SinkEvent};
//! use fanout_audio::format::AudioFormat;
//! use fanout_audio::source::MockCapture;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn run() -> Result<(), fanout_audio::EngineError> {
//! let engine = FanoutEngine::builder()
//!     .capture(MockCapture::new(Duration::from_millis(10)))
//!     .on_sink_event(|e| {
//!         if let SinkEvent::Disconnected { device, reason } = e {
//!             tracing::warn!(%device, %reason, "speaker dropped");
//!         }
//!     })
//!     .build()?;
//!
//! engine.start_session(AudioFormat::dvd_quality()).await?;
//!
//! // Transports wrap the platform Bluetooth stack; the mock stands in here.
//! let living_room = engine.add_sink("living-room", Arc::new(MockTransport::with_latency(
//!     Duration::from_millis(180),
//! )));
//! let headset = engine.add_sink("headset", Arc::new(MockTransport::with_latency(
//!     Duration::from_millis(40),
//! )));
//!
//! tokio::time::sleep(Duration::from_secs(30)).await;
//!
//! engine.remove_sink(&headset);
//! engine.remove_sink(&living_room);
//! engine.stop_session().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! The crate maintains a strict thread boundary:
//!
//! - **Capture Thread**: Blocking producer that stamps frames and never waits on a sink
//! - **Ring Buffer**: Fixed-capacity history; every sink owns a read cursor into it
//! - **Tokio Runtime**: One task per sink pulls frames and pushes them to its transport
//!
//! A sink that falls behind the ring's history skips forward to the oldest
//! frame still held and reports the frames it missed. The sync controller
//! keeps every sink's playout aligned to the slowest device by holding the
//! faster sinks back by the latency difference.

// unsafe_code lint is configured in Cargo.toml as "deny"
#![warn(missing_docs)]
// Audio code requires intentional numeric casts between sample formats
#![allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_possible_wrap,
    clippy::cast_lossless
)]
// unwrap/expect allowed in tests only
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]
// These doc lints are too strict for internal implementation details
#![allow(clippy::missing_panics_doc, clippy::missing_errors_doc)]

mod builder;
mod config;
mod device_id;
mod engine;
mod error;
mod event;
pub mod format;
mod frame;
mod pipeline;
mod session;
pub mod sink;
pub mod source;
mod sync;

pub use builder::FanoutEngineBuilder;
pub use config::EngineConfig;
pub use device_id::DeviceId;
pub use engine::FanoutEngine;
pub use error::{CaptureError, EngineError, TransportError};
pub use event::{
    HealthSnapshot, SessionEvent, SessionEventSink, SessionStatus, SinkEvent, SinkEventSink,
    SinkHealth, SinkState,
};
pub use frame::AudioFrame;
pub use pipeline::{ReadCursor, ReadResult, RingBuffer, WriteOutcome};
pub use sink::{MockTransport, MockTransportControl, SinkHandle, Transport};
pub use sync::{DelayOffset, SyncController, SyncSnapshot};
