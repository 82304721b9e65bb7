//! Control-side sensor access and the periodic control loop

pub mod adapter;
pub mod runner;

pub use adapter::{worst_case_cycle_latency, ChannelValue, ControlLoopAdapter, CycleReadings};
pub use runner::{ControlAlgorithm, ControlLoop, LoopTiming, ReadingLogger};
