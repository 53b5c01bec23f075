//! Service processes: launch, cooperative stop, forced kill and the
//! environment handed to running code.
//!
//! A service goes through launch -> run -> dispose when it exits on its own
//! or honors a stop request in time. When the grace period expires the
//! process is erased instead: its tasks and pending events are dropped and
//! `dispose` never runs, which is exactly the crash the simulation wants to
//! model. Resources are released through the machine in both paths.

use std::{
    cell::{Cell, RefCell},
    fmt,
    future::Future,
    pin::Pin,
    rc::Rc,
    time::Duration,
};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::cluster::{Endpoint, ServiceFactory, ServiceId, SimMachine};
use crate::error::{SimulationError, SimulationResult};
use crate::network::{SimConn, SimSocket};
use crate::sim::{SchedulerId, SimDelay, WeakWorld, SimWorld};
use crate::sim::timer::PromiseHandle;
use crate::storage::StorageHandle;

/// A simulated service: the code under test.
///
/// `run` is the service body; `dispose` is its cleanup, invoked after `run`
/// returns or when a stop request is honored within the grace period. A
/// killed process never reaches `dispose`.
#[async_trait(?Send)]
pub trait Service {
    /// The service body.
    async fn run(&mut self) -> SimulationResult<()>;

    /// Cleanup on cooperative termination.
    async fn dispose(&mut self) -> SimulationResult<()> {
        Ok(())
    }
}

/// Something a process acquired that must be given back when it dies.
pub(crate) trait SimResource {
    fn label(&self) -> String;
    fn release(&self);
}

/// Shared state of one running process instance.
pub(crate) struct ProcState {
    pub(crate) id: ServiceId,
    pub(crate) scheduler: SchedulerId,
    pub(crate) token: CancellationToken,
    sockets: RefCell<Vec<u16>>,
    resources: RefCell<Vec<Box<dyn SimResource>>>,
    exit_watchers: RefCell<Vec<PromiseHandle<()>>>,
    completed: Cell<bool>,
}

impl ProcState {
    fn new(id: ServiceId, scheduler: SchedulerId) -> Self {
        Self {
            id,
            scheduler,
            token: CancellationToken::new(),
            sockets: RefCell::new(Vec::new()),
            resources: RefCell::new(Vec::new()),
            exit_watchers: RefCell::new(Vec::new()),
            completed: Cell::new(false),
        }
    }

    pub(crate) fn track_socket(&self, port: u16) {
        self.sockets.borrow_mut().push(port);
    }

    pub(crate) fn untrack_socket(&self, port: u16) {
        self.sockets.borrow_mut().retain(|p| *p != port);
    }

    pub(crate) fn track_resource(&self, resource: Box<dyn SimResource>) {
        self.resources.borrow_mut().push(resource);
    }

    /// Gives everything back to the machine: sockets first, then acquired
    /// resources in reverse acquisition order.
    pub(crate) fn release(&self, machine: &SimMachine) {
        let ports: Vec<u16> = self.sockets.borrow_mut().drain(..).collect();
        for port in ports {
            machine.release_socket(port);
        }
        loop {
            let resource = self.resources.borrow_mut().pop();
            match resource {
                Some(resource) => {
                    tracing::debug!(service = %self.id, resource = %resource.label(), "releasing");
                    resource.release();
                }
                None => break,
            }
        }
    }
}

type StopFuture = Pin<Box<dyn Future<Output = SimulationResult<()>>>>;

/// What `begin_stop` found.
pub(crate) enum StopPhase {
    /// Nothing is running.
    Idle,
    /// The instance already exited on its own; only release remains.
    Exited,
    /// Stop requested; the future resolves once the process is down.
    Stopping(StopFuture),
}

/// One installed service slot on a machine. Holds the factory and at most
/// one process instance.
pub(crate) struct SimService {
    id: ServiceId,
    scheduler: SchedulerId,
    factory: ServiceFactory,
    running: RefCell<Option<Rc<ProcState>>>,
}

impl SimService {
    pub(crate) fn new(world: &SimWorld, id: ServiceId, factory: ServiceFactory) -> Self {
        let scheduler = world.create_scheduler(id.full());
        Self {
            id,
            scheduler,
            factory,
            running: RefCell::new(None),
        }
    }

    pub(crate) fn id(&self) -> &ServiceId {
        &self.id
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running
            .borrow()
            .as_ref()
            .map(|proc| !proc.completed.get())
            .unwrap_or(false)
    }

    pub(crate) fn take_running(&self) -> Option<Rc<ProcState>> {
        self.running.borrow_mut().take()
    }

    /// Launches a fresh instance. `done` is invoked when the body finishes,
    /// with the fault if it produced one. A killed instance never reports.
    pub(crate) fn launch(
        &self,
        world: &SimWorld,
        done: impl Fn(Option<SimulationError>) + 'static,
    ) -> SimulationResult<()> {
        if self.is_running() {
            return Err(SimulationError::AlreadyRunning(self.id.full().to_string()));
        }
        // A previous instance that exited on its own may still hold sockets.
        if self.running.borrow().is_some() {
            if let Ok(cluster) = world.cluster() {
                cluster.release_service(&self.id);
            }
        }
        let proc = Rc::new(ProcState::new(self.id.clone(), self.scheduler));
        let env = Environment {
            world: world.downgrade(),
            proc: Rc::clone(&proc),
        };
        let factory = Rc::clone(&self.factory);
        let task_proc = Rc::clone(&proc);
        let id = self.id.clone();
        world.spawn(self.scheduler, async move {
            let mut engine = factory(env);
            tracing::debug!(service = %id, "process started");
            // Bowing out on cancellation is a clean exit, not a fault.
            let fault = match engine.run().await {
                Ok(()) => None,
                Err(SimulationError::Cancelled) => {
                    tracing::debug!(service = %id, "process cancelled");
                    None
                }
                Err(error) => {
                    tracing::error!(service = %id, %error, "process faulted");
                    Some(error)
                }
            };
            // Cooperative exit always disposes, faulted or not.
            let fault = match engine.dispose().await {
                Ok(()) => fault,
                Err(error) => {
                    tracing::error!(service = %id, %error, "dispose failed");
                    fault.or(Some(error))
                }
            };
            task_proc.completed.set(true);
            for watcher in task_proc.exit_watchers.borrow_mut().drain(..) {
                watcher.set_result(());
            }
            done(fault);
        });
        *self.running.borrow_mut() = Some(proc);
        Ok(())
    }

    /// Requests cancellation and arms the grace timer. The synchronous part
    /// happens before the returned future is first polled, so stopping many
    /// services signals them all before any wait begins.
    pub(crate) fn begin_stop(
        &self,
        world: &SimWorld,
        grace: Duration,
        waiter: SchedulerId,
    ) -> StopPhase {
        let proc = match self.running.borrow().clone() {
            Some(proc) => proc,
            None => return StopPhase::Idle,
        };
        if proc.completed.get() {
            return StopPhase::Exited;
        }
        tracing::debug!(service = %self.id, ?grace, "stop requested");
        proc.token.cancel();
        let (handle, exited) = world.promise_on::<()>(waiter, Some(grace), None);
        proc.exit_watchers.borrow_mut().push(handle);

        let weak = world.downgrade();
        let id = self.id.clone();
        let scheduler = self.scheduler;
        StopPhase::Stopping(Box::pin(async move {
            match exited.await {
                Ok(()) => {
                    tracing::debug!(service = %id, "stopped gracefully");
                }
                Err(SimulationError::Timeout) => {
                    tracing::warn!(service = %id, "grace period expired, killing process");
                    weak.upgrade()?.erase_scheduler(scheduler);
                }
                Err(error) => return Err(error),
            }
            let world = weak.upgrade()?;
            world.cluster()?.release_service(&id);
            Ok(())
        }))
    }
}

/// Handle a process uses to interact with its world: clocks, timers,
/// networking, storage and logging. Cheap to clone.
pub struct Environment {
    world: WeakWorld,
    proc: Rc<ProcState>,
}

impl Clone for Environment {
    fn clone(&self) -> Self {
        Self {
            world: self.world.clone(),
            proc: Rc::clone(&self.proc),
        }
    }
}

impl fmt::Debug for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Environment").field("id", &self.proc.id).finish()
    }
}

impl Environment {
    /// Identity of the running service.
    pub fn id(&self) -> &ServiceId {
        &self.proc.id
    }

    /// Token that fires when a stop has been requested. Long-running
    /// services should watch it and wind down.
    pub fn cancellation(&self) -> CancellationToken {
        self.proc.token.clone()
    }

    /// Current virtual time, or zero once the world is gone.
    pub fn now(&self) -> Duration {
        self.world.upgrade().map(|w| w.now()).unwrap_or_default()
    }

    /// Sleeps in virtual time. Resolves to `Cancelled` if a stop request
    /// arrives first.
    pub fn delay(&self, duration: Duration) -> SimDelay {
        match self.world.upgrade() {
            Ok(world) => world.delay_on(
                self.proc.scheduler,
                Some(duration),
                Some(self.proc.token.clone()),
            ),
            Err(error) => SimDelay::failed(error),
        }
    }

    /// Sleeps in virtual time ignoring stop requests. Useful for modeling
    /// a process that is stuck and must be killed.
    pub fn sleep(&self, duration: Duration) -> SimDelay {
        match self.world.upgrade() {
            Ok(world) => world.delay_on(self.proc.scheduler, Some(duration), None),
            Err(error) => SimDelay::failed(error),
        }
    }

    /// Named cancellable busywork, logged at debug level.
    pub async fn simulate_work(&self, name: &str, duration: Duration) -> SimulationResult<()> {
        self.debug(&format!("{name}: working for {duration:?}"));
        self.delay(duration).await
    }

    /// Spawns a background task owned by this process; it dies with it.
    pub fn spawn(&self, future: impl Future<Output = ()> + 'static) -> SimulationResult<()> {
        let world = self.world.upgrade()?;
        world.spawn(self.proc.scheduler, future);
        Ok(())
    }

    /// Opens a connection to a remote endpoint, running the connect
    /// handshake. Fails fast when no route exists.
    pub async fn connect(&self, destination: Endpoint) -> SimulationResult<SimConn> {
        let world = self.world.upgrade()?;
        let cluster = world.cluster()?;
        let machine = self.machine(&cluster)?;
        machine.connect(&world, &cluster, &self.proc, destination).await
    }

    /// Binds a listening socket on a well-known port of this machine.
    pub fn bind(&self, port: u16) -> SimulationResult<SimSocket> {
        let world = self.world.upgrade()?;
        let cluster = world.cluster()?;
        let machine = self.machine(&cluster)?;
        machine.bind(&world, &self.proc, port)
    }

    /// Opens (or reopens) a named storage on this machine. The handle is
    /// released with the process.
    pub fn storage(&self, name: &str) -> SimulationResult<StorageHandle> {
        let world = self.world.upgrade()?;
        let cluster = world.cluster()?;
        let machine = self.machine(&cluster)?;
        Ok(machine.open_storage(&self.proc, name))
    }

    /// Stops the whole simulation with a message and optional fault.
    pub fn halt(&self, message: &str, error: Option<SimulationError>) {
        if let Ok(world) = self.world.upgrade() {
            world.halt(message, error);
        }
    }

    /// Debug log attributed to this service; counts as activity.
    pub fn debug(&self, message: &str) {
        if let Ok(world) = self.world.upgrade() {
            world.record_activity();
            tracing::debug!(service = %self.proc.id, at = ?world.now(), "{message}");
        }
    }

    /// Warn log attributed to this service; counts as activity.
    pub fn warn(&self, message: &str) {
        if let Ok(world) = self.world.upgrade() {
            world.record_activity();
            tracing::warn!(service = %self.proc.id, at = ?world.now(), "{message}");
        }
    }

    /// Error log attributed to this service; counts as activity.
    pub fn error(&self, message: &str) {
        if let Ok(world) = self.world.upgrade() {
            world.record_activity();
            tracing::error!(service = %self.proc.id, at = ?world.now(), "{message}");
        }
    }

    fn machine<'a>(
        &self,
        cluster: &'a crate::cluster::SimCluster,
    ) -> SimulationResult<&'a SimMachine> {
        cluster.machine(self.proc.id.machine()).ok_or_else(|| {
            SimulationError::InvalidState(format!("machine '{}' not in cluster", self.proc.id.machine()))
        })
    }
}
