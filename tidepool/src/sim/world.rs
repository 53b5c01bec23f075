//! The simulation world: virtual clock, event loop and actor plumbing.
//!
//! A [`SimWorld`] owns every piece of mutable run state behind one
//! `Rc<RefCell<SimInner>>`. Internal actors hold [`WeakWorld`] handles and
//! upgrade per operation, so nothing outlives the world and a dropped world
//! surfaces as `SimulationShutdown` instead of a dangling reference.
//!
//! `run` drives the loop: pop the earliest event, advance the clock to it,
//! dispatch exactly one actor step, then schedule any tasks the step woke at
//! the current time. The loop exits when the queue dies, a halt is requested,
//! or an inactivity/step/time budget trips.

use std::{
    cell::RefCell,
    future::Future,
    rc::{Rc, Weak},
    sync::Arc,
    task::{Context, Poll},
    time::{Duration, Instant},
};

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tokio_util::sync::CancellationToken;

use crate::cluster::{ClusterDef, SimCluster};
use crate::control::SimControl;
use crate::error::{SimulationError, SimulationResult};

use super::events::{EventPayload, EventQueue};
use super::report::{HaltReason, SimReport, SimulationMetrics, TraceEntry};
use super::scheduler::{task_waker, SchedulerId, TaskArena, WakeList};
use super::timer::{JumpId, JumpState, PromiseHandle, SimDelay, SimPromise};

const DEFAULT_MAX_INACTIVE: Duration = Duration::from_secs(60);

struct SimInner {
    time: Duration,
    queue: EventQueue,
    arena: TaskArena,
    wakes: WakeList,
    rng: ChaCha8Rng,
    seed: u64,
    steps: u64,
    last_activity: Duration,
    halt: Option<(String, Option<SimulationError>)>,
    max_time: Option<Duration>,
    max_steps: Option<u64>,
    max_inactive: Duration,
    next_jump: u64,
    def: Rc<ClusterDef>,
    cluster: Option<Rc<SimCluster>>,
    trace: Option<Vec<TraceEntry>>,
}

impl SimInner {
    fn register_jump(
        &mut self,
        scheduler: SchedulerId,
        duration: Option<Duration>,
        token: Option<CancellationToken>,
    ) -> Rc<JumpState> {
        let id = JumpId(self.next_jump);
        self.next_jump += 1;
        let state = Rc::new(JumpState::new(id, token));
        let deadline = duration.map(|d| self.time + d);
        self.queue
            .schedule_jump(scheduler, deadline, Rc::clone(&state));
        state
    }
}

/// A simulated world: cluster definition, virtual clock, deterministic RNG
/// and the event loop that drives everything.
///
/// Construct one from a [`ClusterDef`], configure seed and budgets, then
/// [`run`](SimWorld::run) a plan against it. The same world can be run
/// several times; every run starts from a fresh clock and a fresh cluster,
/// reseeded from the configured seed.
pub struct SimWorld {
    inner: Rc<RefCell<SimInner>>,
}

/// Weak handle to the world held by actors, sockets and environments.
pub(crate) struct WeakWorld {
    inner: Weak<RefCell<SimInner>>,
}

impl Clone for WeakWorld {
    fn clone(&self) -> Self {
        Self {
            inner: Weak::clone(&self.inner),
        }
    }
}

impl WeakWorld {
    pub(crate) fn upgrade(&self) -> SimulationResult<SimWorld> {
        self.inner
            .upgrade()
            .map(|inner| SimWorld { inner })
            .ok_or(SimulationError::SimulationShutdown)
    }
}

impl SimWorld {
    /// Creates a world over a cluster definition with default budgets:
    /// seed 0, no step or time ceiling, 60 seconds of allowed inactivity.
    pub fn new(def: ClusterDef) -> Self {
        Self {
            inner: Rc::new(RefCell::new(SimInner {
                time: Duration::ZERO,
                queue: EventQueue::new(),
                arena: TaskArena::default(),
                wakes: WakeList::default(),
                rng: ChaCha8Rng::seed_from_u64(0),
                seed: 0,
                steps: 0,
                last_activity: Duration::ZERO,
                halt: None,
                max_time: None,
                max_steps: None,
                max_inactive: DEFAULT_MAX_INACTIVE,
                next_jump: 0,
                def: Rc::new(def),
                cluster: None,
                trace: None,
            })),
        }
    }

    /// Sets the RNG seed used by the next run.
    pub fn set_seed(&mut self, seed: u64) {
        self.inner.borrow_mut().seed = seed;
    }

    /// The configured RNG seed.
    pub fn seed(&self) -> u64 {
        self.inner.borrow().seed
    }

    /// Stops a run once the virtual clock reaches this ceiling.
    pub fn set_max_time(&mut self, limit: Duration) {
        self.inner.borrow_mut().max_time = Some(limit);
    }

    /// Stops a run after this many dispatched events.
    pub fn set_max_steps(&mut self, limit: u64) {
        self.inner.borrow_mut().max_steps = Some(limit);
    }

    /// Stops a run once no actor has recorded activity for this long.
    pub fn set_max_inactivity(&mut self, budget: Duration) {
        self.inner.borrow_mut().max_inactive = budget;
    }

    /// Records a [`TraceEntry`] per dispatched event during subsequent runs.
    pub fn enable_trace(&mut self) {
        self.inner.borrow_mut().trace = Some(Vec::new());
    }

    /// Takes the trace recorded by the last run.
    pub fn take_trace(&mut self) -> Vec<TraceEntry> {
        self.inner
            .borrow_mut()
            .trace
            .replace(Vec::new())
            .unwrap_or_default()
    }

    /// Current virtual time.
    pub fn now(&self) -> Duration {
        self.inner.borrow().time
    }

    /// Runs a plan to completion and reports why the run stopped.
    ///
    /// The plan receives a [`SimControl`] handle and executes as the first
    /// scheduled actor at time zero. A plan error halts the run and is
    /// carried in the report.
    pub fn run<F, Fut>(&mut self, plan: F) -> SimReport
    where
        F: FnOnce(SimControl) -> Fut,
        Fut: Future<Output = SimulationResult<()>> + 'static,
    {
        let started = Instant::now();
        self.reset();

        let cluster = SimCluster::build(self, &self.definition());
        self.inner.borrow_mut().cluster = Some(Rc::clone(&cluster));

        let seed = self.seed();
        tracing::info!(seed, "simulation starting");

        let plan_scheduler = self.create_scheduler("sim:plan");
        let control = SimControl::new(self.downgrade(), plan_scheduler);
        let weak = self.downgrade();
        let future = plan(control);
        self.spawn(plan_scheduler, async move {
            if let Err(error) = future.await {
                if let Ok(world) = weak.upgrade() {
                    tracing::error!(%error, "plan failed");
                    world.halt("plan failed", Some(error));
                }
            }
        });

        let (reason, error) = self.drive();
        self.teardown();

        let inner = self.inner.borrow();
        let report = SimReport {
            reason,
            error,
            metrics: SimulationMetrics {
                simulated_time: inner.time,
                wall_time: started.elapsed(),
                steps: inner.steps,
            },
        };
        drop(inner);
        tracing::info!(reason = %report.reason, steps = report.metrics.steps,
            simulated = ?report.metrics.simulated_time, "simulation stopped");
        report
    }

    fn drive(&self) -> (HaltReason, Option<SimulationError>) {
        loop {
            let popped = self.inner.borrow_mut().queue.pop_next();
            let Some((time, scheduler, payload)) = popped else {
                return (HaltReason::QueueExhausted, None);
            };

            {
                let mut inner = self.inner.borrow_mut();
                if time > inner.time {
                    inner.time = time;
                }
                inner.steps += 1;
                if inner.trace.is_some() {
                    let actor = inner.arena.scheduler_name(scheduler).to_string();
                    let kind = payload.kind();
                    if let Some(trace) = inner.trace.as_mut() {
                        trace.push(TraceEntry { time, actor, kind });
                    }
                }
            }

            self.dispatch(scheduler, &payload);
            self.drain_wakes();

            let mut inner = self.inner.borrow_mut();
            if let Some((message, fault)) = inner.halt.take() {
                return (HaltReason::Requested(message), fault);
            }
            if inner.time.saturating_sub(inner.last_activity) >= inner.max_inactive {
                return (HaltReason::Inactive(inner.max_inactive), None);
            }
            if let Some(limit) = inner.max_steps {
                if inner.steps >= limit {
                    return (HaltReason::StepLimit(limit), None);
                }
            }
            if let Some(limit) = inner.max_time {
                if inner.time >= limit {
                    return (HaltReason::TimeLimit(limit), None);
                }
            }
        }
    }

    fn dispatch(&self, scheduler: SchedulerId, payload: &EventPayload) {
        match payload {
            EventPayload::Resume(task) => {
                let (future, wakes) = {
                    let mut inner = self.inner.borrow_mut();
                    (inner.arena.take(*task), Arc::clone(&inner.wakes))
                };
                // None means the task already finished or was erased.
                let Some(mut future) = future else {
                    return;
                };
                let waker = task_waker(scheduler, *task, wakes);
                let mut cx = Context::from_waker(&waker);
                match future.as_mut().poll(&mut cx) {
                    Poll::Ready(()) => self.inner.borrow_mut().arena.remove(*task),
                    Poll::Pending => self.inner.borrow_mut().arena.restore(*task, future),
                }
            }
            EventPayload::Fire(state) => state.fire(),
        }
    }

    /// Converts every wake recorded during the last step into a resume at
    /// the current time, appended after already-due work.
    fn drain_wakes(&self) {
        loop {
            let pending = {
                let inner = self.inner.borrow();
                let Ok(mut list) = inner.wakes.lock() else {
                    return;
                };
                if list.is_empty() {
                    return;
                }
                std::mem::take(&mut *list)
            };
            let mut inner = self.inner.borrow_mut();
            let now = inner.time;
            for (scheduler, task) in pending {
                if inner.arena.contains(task) {
                    inner.queue.schedule_resume(scheduler, now, task);
                }
            }
        }
    }

    fn reset(&self) {
        // Drop the previous run's tasks outside the borrow; their
        // destructors may reach back into the world.
        let previous = {
            let mut inner = self.inner.borrow_mut();
            inner.time = Duration::ZERO;
            inner.steps = 0;
            inner.last_activity = Duration::ZERO;
            inner.halt = None;
            inner.next_jump = 0;
            inner.queue.clear();
            let seed = inner.seed;
            inner.rng = ChaCha8Rng::seed_from_u64(seed);
            if let Some(trace) = inner.trace.as_mut() {
                trace.clear();
            }
            if let Ok(mut wakes) = inner.wakes.lock() {
                wakes.clear();
            }
            inner.cluster.take();
            std::mem::take(&mut inner.arena)
        };
        drop(previous);
    }

    fn teardown(&self) {
        let cluster = self.inner.borrow_mut().cluster.take();
        if let Some(cluster) = cluster {
            cluster.release_all();
        }
        let remaining = std::mem::take(&mut self.inner.borrow_mut().arena);
        drop(remaining);
    }

    fn definition(&self) -> Rc<ClusterDef> {
        Rc::clone(&self.inner.borrow().def)
    }

    pub(crate) fn downgrade(&self) -> WeakWorld {
        WeakWorld {
            inner: Rc::downgrade(&self.inner),
        }
    }

    pub(crate) fn create_scheduler(&self, name: impl Into<String>) -> SchedulerId {
        self.inner.borrow_mut().arena.create_scheduler(name)
    }

    /// Spawns a task on a scheduler; it first runs at the current time,
    /// after already-queued work.
    pub(crate) fn spawn<F>(&self, scheduler: SchedulerId, future: F)
    where
        F: Future<Output = ()> + 'static,
    {
        let mut inner = self.inner.borrow_mut();
        let task = inner.arena.insert(scheduler, Box::pin(future));
        let now = inner.time;
        inner.queue.schedule_resume(scheduler, now, task);
        inner.last_activity = now;
    }

    /// Registers a delay jump. `None` waits forever, until cancellation.
    pub(crate) fn delay_on(
        &self,
        scheduler: SchedulerId,
        duration: Option<Duration>,
        token: Option<CancellationToken>,
    ) -> SimDelay {
        let state = self
            .inner
            .borrow_mut()
            .register_jump(scheduler, duration, token);
        SimDelay::new(state)
    }

    /// Registers a promise jump and returns the completion/await pair.
    pub(crate) fn promise_on<T>(
        &self,
        scheduler: SchedulerId,
        timeout: Option<Duration>,
        token: Option<CancellationToken>,
    ) -> (PromiseHandle<T>, SimPromise<T>) {
        let state = self
            .inner
            .borrow_mut()
            .register_jump(scheduler, timeout, token);
        SimPromise::pair(state)
    }

    /// Forced kill: drops every task and pending event a scheduler owns.
    pub(crate) fn erase_scheduler(&self, scheduler: SchedulerId) {
        // Erased futures are dropped outside the borrow.
        let dropped = {
            let mut inner = self.inner.borrow_mut();
            inner.queue.erase(scheduler);
            inner.arena.erase(scheduler)
        };
        drop(dropped);
    }

    /// Requests a halt; the first request wins.
    pub(crate) fn halt(&self, message: impl Into<String>, error: Option<SimulationError>) {
        let mut inner = self.inner.borrow_mut();
        if inner.halt.is_none() {
            inner.halt = Some((message.into(), error));
        }
    }

    pub(crate) fn with_rng<R>(&self, f: impl FnOnce(&mut ChaCha8Rng) -> R) -> R {
        f(&mut self.inner.borrow_mut().rng)
    }

    pub(crate) fn cluster(&self) -> SimulationResult<Rc<SimCluster>> {
        self.inner
            .borrow()
            .cluster
            .clone()
            .ok_or_else(|| SimulationError::InvalidState("no active run".into()))
    }

    /// Pushes the inactivity horizon forward to the current time.
    pub(crate) fn record_activity(&self) {
        let mut inner = self.inner.borrow_mut();
        let now = inner.time;
        inner.last_activity = now;
    }
}
