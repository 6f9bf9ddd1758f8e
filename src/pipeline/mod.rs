//! Audio pipeline components.
//!
//! The pipeline connects the capture device to every sink via one ring buffer:
//!
//! ```text
//! Capture Thread → Producer → Ring Buffer ─┬→ Sink Task → Transport
//!                                          ├→ Sink Task → Transport
//!                                          └→ ...
//! ```
//!
//! - **Producer**: Blocking loop that stamps frames and writes the ring
//! - **Ring Buffer**: Single writer, one cursor per sink, never blocks the writer
//!
//! Each sink reads at its own pace, so a stalled Bluetooth link only ever
//! costs that sink frames.

mod producer;
mod ring_buffer;

pub(crate) use producer::Producer;
pub use ring_buffer::{ReadCursor, ReadResult, RingBuffer, WriteOutcome};
