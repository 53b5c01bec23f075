use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use tidepool::{ClusterDef, HaltReason, SimWorld};

fn ms(v: u64) -> Duration {
    Duration::from_millis(v)
}

#[test]
fn same_deadline_fires_in_insertion_order() {
    let log: Rc<RefCell<Vec<(Duration, &'static str)>>> = Rc::default();

    let mut def = ClusterDef::new();
    let service_log = Rc::clone(&log);
    def.add("node", move |env| {
        let log = Rc::clone(&service_log);
        async move {
            // Spawn order a, b, c, d; deadlines 5, 5, 3, 7.
            for (label, delay) in [("a", 5), ("b", 5), ("c", 3), ("d", 7)] {
                let log = Rc::clone(&log);
                let env = env.clone();
                env.clone().spawn(async move {
                    if env.delay(ms(delay)).await.is_ok() {
                        log.borrow_mut().push((env.now(), label));
                    }
                })?;
            }
            Ok(())
        }
    });

    let mut world = SimWorld::new(def);
    let report = world.run(|control| async move {
        control.start_all()?;
        control.delay(ms(20)).await?;
        Ok(())
    });

    assert!(report.is_clean(), "unexpected fault: {report}");
    // Earliest deadline first; ties resolved by registration order.
    assert_eq!(
        *log.borrow(),
        vec![(ms(3), "c"), (ms(5), "a"), (ms(5), "b"), (ms(7), "d")]
    );
}

#[test]
fn cancellation_interrupts_a_far_future_wait() {
    let log: Rc<RefCell<Vec<(Duration, bool)>>> = Rc::default();

    let mut def = ClusterDef::new();
    let service_log = Rc::clone(&log);
    def.add("node", move |env| {
        let log = Rc::clone(&service_log);
        async move {
            let outcome = env.delay(Duration::from_secs(3600)).await;
            log.borrow_mut().push((env.now(), outcome.is_err()));
            Ok(())
        }
    });

    let mut world = SimWorld::new(def);
    let report = world.run(|control| async move {
        control.start_all()?;
        control.delay(ms(10)).await?;
        control.stop_all().await?;
        Ok(())
    });

    assert!(report.is_clean(), "unexpected fault: {report}");
    // The wait resolves at the moment of cancellation, not at its deadline.
    assert_eq!(*log.borrow(), vec![(ms(10), true)]);
    assert!(report.metrics.simulated_time < Duration::from_secs(1));
}

#[test]
fn empty_plan_exhausts_the_queue() {
    let mut world = SimWorld::new(ClusterDef::new());
    let report = world.run(|_control| async move { Ok(()) });
    assert_eq!(report.reason, HaltReason::QueueExhausted);
    assert_eq!(report.metrics.simulated_time, Duration::ZERO);
    assert!(report.is_clean());
}

#[test]
fn requested_halt_carries_its_message() {
    let mut world = SimWorld::new(ClusterDef::new());
    let report = world.run(|control| async move {
        control.delay(ms(5)).await?;
        control.halt("checkpoint reached");
        Ok(())
    });
    assert_eq!(
        report.reason,
        HaltReason::Requested("checkpoint reached".into())
    );
    assert!(report.is_clean());
    assert_eq!(report.metrics.simulated_time, ms(5));
}

#[test]
fn plan_error_halts_with_the_fault() {
    let mut world = SimWorld::new(ClusterDef::new());
    let report = world.run(|control| async move {
        // Nothing is installed, so any selector matches zero services.
        control.start_where(|id| id.service() == "nope")?;
        Ok(())
    });
    assert_eq!(report.reason, HaltReason::Requested("plan failed".into()));
    assert_eq!(
        report.error,
        Some(tidepool::SimulationError::NoMatchingServices)
    );
}
