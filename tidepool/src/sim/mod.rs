//! Core simulation machinery: virtual time, event queue, cooperative
//! scheduling and the runtime loop.

pub(crate) mod events;
pub(crate) mod scheduler;
pub(crate) mod timer;

mod report;
mod world;

pub use report::{HaltReason, SimReport, SimulationMetrics, TraceEntry};
pub use scheduler::SchedulerId;
pub use timer::SimDelay;
pub use world::SimWorld;

pub(crate) use world::WeakWorld;
