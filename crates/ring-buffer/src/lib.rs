//! Fixed-Capacity History Ring
//!
//! Append-only ring buffer for tick-by-tick telemetry history.

mod buffer;

pub use buffer::{RingBuffer, DEFAULT_CAPACITY};
