//! The control plane handed to simulation plans.

use std::time::Duration;

use rand_chacha::ChaCha8Rng;

use crate::cluster::ServiceId;
use crate::error::{SimulationError, SimulationResult};
use crate::sim::{SchedulerId, SimDelay, WeakWorld};

/// Grace period used by [`SimControl::stop_all`].
pub const DEFAULT_GRACE: Duration = Duration::from_secs(2);

/// Plan-side handle over a running world: fleet start/stop, faults, clocks
/// and logging. The plan runs as its own actor, interleaved with services
/// under the same deterministic scheduler.
pub struct SimControl {
    world: WeakWorld,
    scheduler: SchedulerId,
}

impl SimControl {
    pub(crate) fn new(world: WeakWorld, scheduler: SchedulerId) -> Self {
        Self { world, scheduler }
    }

    /// Current virtual time.
    pub fn now(&self) -> Duration {
        self.world.upgrade().map(|w| w.now()).unwrap_or_default()
    }

    /// Sleeps in virtual time.
    pub fn delay(&self, duration: Duration) -> SimDelay {
        match self.world.upgrade() {
            Ok(world) => world.delay_on(self.scheduler, Some(duration), None),
            Err(error) => SimDelay::failed(error),
        }
    }

    /// Launches every installed service.
    pub fn start_all(&self) -> SimulationResult<usize> {
        self.start_where(|_| true)
    }

    /// Launches services matching the selector; errs when none match.
    pub fn start_where(&self, selector: impl Fn(&ServiceId) -> bool) -> SimulationResult<usize> {
        let world = self.world.upgrade()?;
        let cluster = world.cluster()?;
        cluster.start_services(&world, &selector)
    }

    /// Stops every installed service with the default grace period.
    pub async fn stop_all(&self) -> SimulationResult<usize> {
        self.stop_where(|_| true, DEFAULT_GRACE).await
    }

    /// Stops services matching the selector. Each gets `grace` to wind
    /// down; ones that miss it are killed without cleanup.
    pub async fn stop_where(
        &self,
        selector: impl Fn(&ServiceId) -> bool,
        grace: Duration,
    ) -> SimulationResult<usize> {
        let world = self.world.upgrade()?;
        let cluster = world.cluster()?;
        cluster
            .stop_services(&world, &selector, grace, self.scheduler)
            .await
    }

    /// Clears every storage on a machine, modeling disk loss. Open handles
    /// observe the wipe immediately.
    pub fn wipe_storage(&self, machine: &str) -> SimulationResult<()> {
        let world = self.world.upgrade()?;
        let cluster = world.cluster()?;
        let machine = cluster
            .machine(&machine.to_lowercase())
            .ok_or_else(|| SimulationError::InvalidState(format!("no machine '{machine}'")))?;
        machine.wipe_storage();
        Ok(())
    }

    /// Stops the simulation with a message.
    pub fn halt(&self, message: &str) {
        if let Ok(world) = self.world.upgrade() {
            world.halt(message, None);
        }
    }

    /// Runs a closure against the world's deterministic RNG.
    pub fn with_rng<R>(&self, f: impl FnOnce(&mut ChaCha8Rng) -> R) -> SimulationResult<R> {
        Ok(self.world.upgrade()?.with_rng(f))
    }

    /// Debug log attributed to the plan; counts as activity.
    pub fn debug(&self, message: &str) {
        if let Ok(world) = self.world.upgrade() {
            world.record_activity();
            tracing::debug!(actor = "plan", at = ?world.now(), "{message}");
        }
    }
}
