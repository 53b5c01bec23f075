use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

use async_trait::async_trait;
use tidepool::{
    ClusterDef, Environment, HaltReason, Service, SimWorld, SimulationError, SimulationResult,
};

fn ms(v: u64) -> Duration {
    Duration::from_millis(v)
}

/// Sleeps for an hour. The polite variant treats cancellation as its cue to
/// exit; the stubborn one ignores stop requests entirely.
struct Sleeper {
    env: Environment,
    disposed: Rc<Cell<u32>>,
    stubborn: bool,
}

#[async_trait(?Send)]
impl Service for Sleeper {
    async fn run(&mut self) -> SimulationResult<()> {
        let _socket = self.env.bind(7000)?;
        if self.stubborn {
            self.env.sleep(Duration::from_secs(3600)).await
        } else {
            match self
                .env
                .simulate_work("serving", Duration::from_secs(3600))
                .await
            {
                Err(SimulationError::Cancelled) => Ok(()),
                other => other,
            }
        }
    }

    async fn dispose(&mut self) -> SimulationResult<()> {
        self.disposed.set(self.disposed.get() + 1);
        Ok(())
    }
}

fn sleeper_cluster(disposed: &Rc<Cell<u32>>, stubborn: bool) -> ClusterDef {
    let mut def = ClusterDef::new();
    let disposed = Rc::clone(disposed);
    def.add_service("node:worker", move |env| Sleeper {
        env,
        disposed: Rc::clone(&disposed),
        stubborn,
    });
    def
}

#[test]
fn graceful_stop_disposes_once_and_returns_immediately() {
    let disposed = Rc::new(Cell::new(0u32));
    let stopped_at: Rc<RefCell<Vec<Duration>>> = Rc::default();

    let mut world = SimWorld::new(sleeper_cluster(&disposed, false));
    let plan_log = Rc::clone(&stopped_at);
    let report = world.run(|control| async move {
        control.start_all()?;
        control.delay(ms(10)).await?;
        control.stop_all().await?;
        plan_log.borrow_mut().push(control.now());
        Ok(())
    });

    assert!(report.is_clean(), "unexpected fault: {report}");
    assert_eq!(report.reason, HaltReason::QueueExhausted);
    assert_eq!(disposed.get(), 1);
    // The process honors the stop at once; none of the grace period is
    // actually spent.
    assert_eq!(*stopped_at.borrow(), vec![ms(10)]);
}

#[test]
fn expired_grace_kills_without_dispose_and_frees_the_port() {
    crate::support::init_tracing();
    let disposed = Rc::new(Cell::new(0u32));
    let stopped_at: Rc<RefCell<Vec<Duration>>> = Rc::default();

    let mut world = SimWorld::new(sleeper_cluster(&disposed, true));
    let plan_log = Rc::clone(&stopped_at);
    let report = world.run(|control| async move {
        control.start_all()?;
        control.delay(ms(10)).await?;
        control.stop_where(|_| true, ms(300)).await?;
        plan_log.borrow_mut().push(control.now());
        // The port must be free again: a relaunch binds 7000 anew. A leak
        // would fault the fresh instance and halt the run.
        control.start_all()?;
        control.delay(ms(10)).await?;
        control.stop_where(|_| true, ms(100)).await?;
        Ok(())
    });

    assert!(report.is_clean(), "unexpected fault: {report}");
    // Killed both times, exactly at the end of each grace period, and
    // dispose never ran.
    assert_eq!(disposed.get(), 0);
    assert_eq!(*stopped_at.borrow(), vec![ms(310)]);
    // The kill also erases the hour-long sleep from the queue: the run
    // drains right after the second stop instead of coasting to the
    // sleeper's deadline.
    assert_eq!(report.reason, HaltReason::QueueExhausted);
    assert!(report.metrics.simulated_time < Duration::from_secs(1));
}

#[test]
fn second_launch_while_running_is_rejected() {
    let disposed = Rc::new(Cell::new(0u32));
    let observed: Rc<RefCell<Vec<SimulationError>>> = Rc::default();

    let mut world = SimWorld::new(sleeper_cluster(&disposed, false));
    let errors = Rc::clone(&observed);
    let report = world.run(|control| async move {
        control.start_all()?;
        control.delay(ms(5)).await?;
        if let Err(error) = control.start_all() {
            errors.borrow_mut().push(error);
        }
        control.stop_all().await?;
        Ok(())
    });

    assert!(report.is_clean(), "unexpected fault: {report}");
    assert_eq!(
        *observed.borrow(),
        vec![SimulationError::AlreadyRunning("node:worker".into())]
    );
}

#[test]
fn faulting_service_halts_the_simulation() {
    let mut def = ClusterDef::new();
    def.add("node:broken", |env| async move {
        env.delay(ms(5)).await?;
        Err(SimulationError::InvalidState("boom".into()))
    });

    let mut world = SimWorld::new(def);
    let report = world.run(|control| async move {
        control.start_all()?;
        control.delay(ms(50)).await?;
        Ok(())
    });

    assert_eq!(
        report.reason,
        HaltReason::Requested("service 'node:broken' faulted".into())
    );
    assert_eq!(
        report.error,
        Some(SimulationError::InvalidState("boom".into()))
    );
}
