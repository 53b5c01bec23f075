use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use tidepool::{ClusterDef, Endpoint, Payload, SimWorld, SimulationError};

fn ms(v: u64) -> Duration {
    Duration::from_millis(v)
}

fn msg(text: &str) -> Payload {
    Rc::new(text.to_string())
}

fn text(payload: &Payload) -> String {
    payload
        .downcast_ref::<String>()
        .cloned()
        .unwrap_or_default()
}

#[test]
fn echo_round_trip_pays_latency_both_ways() {
    let client_log: Rc<RefCell<Vec<(Duration, String)>>> = Rc::default();
    let server_eof: Rc<RefCell<Vec<bool>>> = Rc::default();

    let mut def = ClusterDef::new();
    // Default link: constant 50ms each way.
    def.link("west", "east");

    let eof_log = Rc::clone(&server_eof);
    def.add("srv.east:echo", move |env| {
        let eof_log = Rc::clone(&eof_log);
        async move {
            let socket = env.bind(9000)?;
            let conn = socket.accept().await?;
            while let Some(payload) = conn.read(Some(Duration::from_secs(10))).await? {
                conn.write(payload)?;
            }
            // End of stream is sticky: a second read reports it again.
            eof_log
                .borrow_mut()
                .push(conn.read(Some(ms(10))).await?.is_none());
            Ok(())
        }
    });

    let reply_log = Rc::clone(&client_log);
    def.add("cli.west:client", move |env| {
        let reply_log = Rc::clone(&reply_log);
        async move {
            let conn = env.connect(Endpoint::new("srv.east", 9000)).await?;
            reply_log
                .borrow_mut()
                .push((env.now(), "connected".to_string()));
            conn.write(msg("hello"))?;
            if let Some(reply) = conn.read(Some(Duration::from_secs(10))).await? {
                reply_log.borrow_mut().push((env.now(), text(&reply)));
            }
            conn.dispose();
            Ok(())
        }
    });

    let mut world = SimWorld::new(def);
    let report = world.run(|control| async move {
        control.start_all()?;
        control.delay(Duration::from_secs(2)).await?;
        control.stop_all().await?;
        Ok(())
    });

    assert!(report.is_clean(), "unexpected fault: {report}");
    // SYN out at 0, SYN|ACK back at 50, final ACK sent at 100: the connect
    // returns after one full round trip.
    // The echo then costs another round trip on top.
    assert_eq!(
        *client_log.borrow(),
        vec![
            (ms(100), "connected".to_string()),
            (ms(200), "hello".to_string()),
        ]
    );
    assert_eq!(*server_eof.borrow(), vec![true]);
}

#[test]
fn connect_to_dead_port_is_refused() {
    let log: Rc<RefCell<Vec<(Duration, Option<SimulationError>)>>> = Rc::default();

    let mut def = ClusterDef::new();
    def.link("west", "east");
    // Installed but never started, so the machine exists and nothing
    // listens on it.
    def.add("srv.east:idle", |_env| async move { Ok(()) });

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
        control.start_where(|id| id.service() == "client")?;
        control.delay(Duration::from_secs(1)).await?;
        Ok(())
    });

    assert!(report.is_clean(), "unexpected fault: {report}");
    // The open request travels 50ms, the reset another 50ms back.
    assert_eq!(
        *log.borrow(),
        vec![(ms(100), Some(SimulationError::ConnectionRefused))]
    );
}

#[test]
fn connect_to_missing_machine_is_refused() {
    let log: Rc<RefCell<Vec<(Duration, Option<SimulationError>)>>> = Rc::default();

    let mut def = ClusterDef::new();
    def.link("west", "east");
    // The east zone exists, but no machine is named "ghost.east".
    def.add("srv.east:echo", |_env| async move { Ok(()) });

    let err_log = Rc::clone(&log);
    def.add("cli.west:client", move |env| {
        let err_log = Rc::clone(&err_log);
        async move {
            let outcome = env.connect(Endpoint::new("ghost.east", 9000)).await;
            err_log.borrow_mut().push((env.now(), outcome.err()));
            Ok(())
        }
    });

    let mut world = SimWorld::new(def);
    let report = world.run(|control| async move {
        control.start_where(|id| id.service() == "client")?;
        control.delay(Duration::from_secs(1)).await?;
        Ok(())
    });

    assert!(report.is_clean(), "unexpected fault: {report}");
    // Refused after one round trip, like an unbound port; no handshake
    // timeout is spent.
    assert_eq!(
        *log.borrow(),
        vec![(ms(100), Some(SimulationError::ConnectionRefused))]
    );
}

#[test]
fn connect_without_a_route_fails_fast() {
    let log: Rc<RefCell<Vec<Option<SimulationError>>>> = Rc::default();

    let mut def = ClusterDef::new();
    // No links at all.
    def.add("srv.east:echo", |_env| async move { Ok(()) });
    let err_log = Rc::clone(&log);
    def.add("cli.west:client", move |env| {
        let err_log = Rc::clone(&err_log);
        async move {
            let outcome = env.connect(Endpoint::new("srv.east", 9000)).await;
            err_log.borrow_mut().push(outcome.err());
            Ok(())
        }
    });

    let mut world = SimWorld::new(def);
    let report = world.run(|control| async move {
        control.start_where(|id| id.service() == "client")?;
        Ok(())
    });

    assert!(report.is_clean(), "unexpected fault: {report}");
    assert_eq!(
        *log.borrow(),
        vec![Some(SimulationError::RouteNotFound {
            from: "west".into(),
            to: "east".into(),
        })]
    );
}
