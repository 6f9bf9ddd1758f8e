//! Fan-out example.
//!
//! Plays a synthetic tone on three simulated speakers with different link
//! latencies, drops one halfway through and prints health once a second.
//!
//! Run with: cargo run --example fanout
//! More detail: RUST_LOG=fanout_audio=debug cargo run --example fanout

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fanout_audio::format::AudioFormat;
use fanout_audio::source::MockCapture;
use fanout_audio::{
    AudioFrame, DeviceId, FanoutEngine, SessionEvent, SinkEvent, Transport, TransportError,
};
use tracing_subscriber::EnvFilter;

/// A speaker that accepts every frame after a fixed link latency.
struct SimulatedSpeaker {
    latency: Duration,
    frames: AtomicU64,
}

impl SimulatedSpeaker {
    fn new(latency_ms: u64) -> Self {
        Self {
            latency: Duration::from_millis(latency_ms),
            frames: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl Transport for SimulatedSpeaker {
    fn name(&self) -> &str {
        "simulated-speaker"
    }

    async fn connect(&self, device: &DeviceId) -> Result<(), TransportError> {
        // Pairing handshake.
        tokio::time::sleep(Duration::from_millis(150)).await;
        println!("[{device}] connected");
        Ok(())
    }

    async fn send(&self, _frame: &AudioFrame) -> Result<(), TransportError> {
        self.frames.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn probe_latency(&self) -> Duration {
        self.latency
    }

    async fn disconnect(&self) {
        println!(
            "  speaker sent {} frames before disconnecting",
            self.frames.load(Ordering::Relaxed)
        );
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("fanout_audio=info")),
        )
        .init();

    let engine = FanoutEngine::builder()
        .capture(MockCapture::new(Duration::from_millis(10)).with_frequency(440.0))
        .on_sink_event(|e| match e {
            SinkEvent::LatencyUpdated {
                device,
                latency,
                target_delay,
            } => println!("[{device}] latency {latency:?}, group delay now {target_delay:?}"),
            SinkEvent::Disconnected { device, reason } => {
                println!("[{device}] disconnected: {reason}");
            }
            _ => {}
        })
        .on_session_event(|e| {
            if let SessionEvent::Stalled { since_last_frame } = e {
                println!("capture stalled ({since_last_frame:?} without audio)");
            }
        })
        .build()?;

    engine.start_session(AudioFormat::dvd_quality()).await?;

    let _kitchen = engine.add_sink("kitchen", Arc::new(SimulatedSpeaker::new(60)));
    let living_room = engine.add_sink("living-room", Arc::new(SimulatedSpeaker::new(210)));
    let _headset = engine.add_sink("headset", Arc::new(SimulatedSpeaker::new(35)));

    for second in 1..=6 {
        tokio::time::sleep(Duration::from_secs(1)).await;

        let health = engine.health();
        println!(
            "{second}s: {:?}, buffer {:.0}%, target {:?}, input {:.1} dBFS",
            health.status, health.buffer_fill_percent, health.target_delay, health.input_peak_db
        );
        for sink in &health.sinks {
            println!(
                "  {:<12} {:?} offset {:>4}ms sent {:>4} missed {}",
                sink.device.as_str(),
                sink.state,
                sink.delay_offset.as_millis(),
                sink.frames_sent,
                sink.missed_frames
            );
        }

        if second == 3 {
            println!("removing living-room; the others ease back to the smaller delay");
            engine.remove_sink(&living_room);
        }
    }

    engine.stop_session().await;
    println!("\nDone!");

    Ok(())
}
