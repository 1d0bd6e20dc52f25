//! Dispatch engine: staleness filter, dispatch queue, worker pool and the
//! controller lifecycle that wires them to a change feed and sinks.

pub mod control;
pub mod elected;
pub mod queue;
pub mod staleness;
pub mod worker;

pub use control::{Controller, ControllerSettings, Phase};
pub use elected::run_elected;
pub use queue::DispatchQueue;
pub use staleness::{StalenessFilter, should_process};
pub use worker::{SinkSet, WorkerPool, dispatch};
