//! Audio capture stack: device registry, routing graph, chunked encoder,
//! and the visualizer sampler.

pub mod devices;
pub mod encoder;
pub mod graph;
pub mod visualizer;
