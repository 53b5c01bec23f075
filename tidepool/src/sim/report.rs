//! Run reports and halt reasons.

use std::fmt;
use std::time::Duration;

use crate::error::SimulationError;

/// Why the runtime loop exited.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HaltReason {
    /// The event queue ran out of work.
    QueueExhausted,
    /// `halt()` was requested, with the given message.
    Requested(String),
    /// Nothing recorded activity for longer than the configured budget.
    Inactive(Duration),
    /// The dispatch step budget was exceeded.
    StepLimit(u64),
    /// The virtual-time ceiling was reached.
    TimeLimit(Duration),
}

impl fmt::Display for HaltReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HaltReason::QueueExhausted => write!(f, "died"),
            HaltReason::Requested(msg) => write!(f, "{msg}"),
            HaltReason::Inactive(budget) => write!(f, "no activity for {budget:?}"),
            HaltReason::StepLimit(steps) => write!(f, "{steps} steps reached"),
            HaltReason::TimeLimit(limit) => write!(f, "max time {limit:?}"),
        }
    }
}

/// Aggregate counters for one run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SimulationMetrics {
    /// Total virtual time covered.
    pub simulated_time: Duration,
    /// Wall-clock time the run took.
    pub wall_time: Duration,
    /// Number of dispatched events.
    pub steps: u64,
}

/// Result of one simulation run: why it stopped, the originating fault if
/// any, and aggregate statistics.
#[derive(Debug, Clone)]
pub struct SimReport {
    /// Why the loop exited.
    pub reason: HaltReason,
    /// The fault that triggered the halt, when there was one.
    pub error: Option<SimulationError>,
    /// Aggregate counters.
    pub metrics: SimulationMetrics,
}

impl SimReport {
    /// True when the run ended by draining its queue or reaching a
    /// configured limit without a requested halt carrying an error.
    pub fn is_clean(&self) -> bool {
        self.error.is_none()
    }
}

impl fmt::Display for SimReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}; simulated {:?} in {} steps ({:?} wall)",
            self.reason,
            self.metrics.simulated_time,
            self.metrics.steps,
            self.metrics.wall_time,
        )?;
        if let Some(error) = &self.error {
            write!(f, "; fault: {error}")?;
        }
        Ok(())
    }
}

/// One dispatched event, recorded when tracing is enabled on the world.
///
/// Two runs of the same definition, seed and plan produce identical traces;
/// the determinism tests compare them entry by entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceEntry {
    /// Virtual time of the dispatch.
    pub time: Duration,
    /// Name of the owning scheduler.
    pub actor: String,
    /// Event kind label (`resume` or `fire`).
    pub kind: &'static str,
}
