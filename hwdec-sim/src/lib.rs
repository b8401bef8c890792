//! Simulated hardware backend for the decode pipeline
//!
//! Provides a packetized test bitstream, a scriptable engine with
//! configurable completion latency and fault injection, and sinks that read
//! the engine's frame stamps back out of surface memory.

pub mod engine;
pub mod sink;
pub mod stream;

pub use engine::{FrameStamp, SimConfig, SimEngine, SimProbe};
pub use sink::{Collected, CollectingSink, DeliveredFrame, RawWriterSink};
pub use stream::{MemorySource, StreamBuilder};
