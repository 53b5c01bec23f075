use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use tidepool::{ClusterDef, Endpoint, Payload, SimWorld, SimulationError};

fn msg(text: &str) -> Payload {
    Rc::new(text.to_string())
}

#[test]
fn total_loss_times_out_the_handshake() {
    let log: Rc<RefCell<Vec<(Duration, Option<SimulationError>)>>> = Rc::default();

    let mut def = ClusterDef::new();
    // Every packet in either direction is eaten by the link.
    def.link_with("west", "east", |config| {
        config.set_packet_loss(|_| true);
    });
    def.add("srv.east:echo", |env| async move {
        let socket = env.bind(9000)?;
        let _conn = socket.accept().await?;
        Ok(())
    });
    let err_log = Rc::clone(&log);
    def.add("cli.west:client", move |env| {
        let err_log = Rc::clone(&err_log);
        async move {
            let outcome = env.connect(Endpoint::new("srv.east", 9000)).await;
            err_log.borrow_mut().push((env.now(), outcome.err()));
            Ok(())
        }
    });

    let mut world = SimWorld::new(def);
    let report = world.run(|control| async move {
        control.start_all()?;
        control.delay(Duration::from_secs(8)).await?;
        control.stop_all().await?;
        Ok(())
    });

    assert!(report.is_clean(), "unexpected fault: {report}");
    // Loss is silent for the sender; only the handshake deadline surfaces.
    assert_eq!(
        *log.borrow(),
        vec![(Duration::from_secs(5), Some(SimulationError::Timeout))]
    );
}

#[test]
fn loss_after_establishment_leaves_writes_silent() {
    let write_results: Rc<RefCell<Vec<bool>>> = Rc::default();
    let reads: Rc<RefCell<Vec<Option<SimulationError>>>> = Rc::default();

    let mut def = ClusterDef::new();
    // Handshake packets pass, then the link goes fully dark.
    let sent = std::cell::Cell::new(0usize);
    def.link_with("west", "east", move |config| {
        let sent = sent.clone();
        config.set_packet_loss(move |_| {
            let n = sent.get();
            sent.set(n + 1);
            n >= 3
        });
    });

    let read_log = Rc::clone(&reads);
    def.add("srv.east:sink", move |env| {
        let read_log = Rc::clone(&read_log);
        async move {
            let socket = env.bind(9000)?;
            let conn = socket.accept().await?;
            let outcome = conn.read(Some(Duration::from_secs(1))).await;
            read_log.borrow_mut().push(outcome.err());
            Ok(())
        }
    });

    let writes = Rc::clone(&write_results);
    def.add("cli.west:client", move |env| {
        let writes = Rc::clone(&writes);
        async move {
            let conn = env.connect(Endpoint::new("srv.east", 9000)).await?;
            // The packet is dropped on the link; the sender never learns.
            writes.borrow_mut().push(conn.write(msg("lost")).is_ok());
            Ok(())
        }
    });

    let mut world = SimWorld::new(def);
    let report = world.run(|control| async move {
        control.start_all()?;
        control.delay(Duration::from_secs(8)).await?;
        control.stop_all().await?;
        Ok(())
    });

    assert!(report.is_clean(), "unexpected fault: {report}");
    assert_eq!(*write_results.borrow(), vec![true]);
    // The receiver only ever observes the absence as a read timeout.
    assert_eq!(*reads.borrow(), vec![Some(SimulationError::Timeout)]);
}
