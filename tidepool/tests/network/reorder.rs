use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

use tidepool::{ClusterDef, Endpoint, Payload, SimWorld};

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
fn reordered_packets_are_read_in_sequence_order() {
    crate::support::init_tracing();
    let received: Rc<RefCell<Vec<String>>> = Rc::default();

    let mut def = ClusterDef::new();
    // Client -> server latencies per packet, in send order: the open
    // request and final ack travel fast, then the three data packets get
    // 30/10/20ms so they arrive as m2, m3, m1.
    let sent = Cell::new(0usize);
    def.link_directed("west", "east", move |config| {
        let schedule = [5u64, 5, 30, 10, 20];
        let sent = sent.clone();
        config.set_latency(move |_| {
            let n = sent.get();
            sent.set(n + 1);
            ms(schedule.get(n).copied().unwrap_or(5))
        });
    });
    def.link_directed("east", "west", |config| {
        config.set_fixed_latency(ms(5));
    });

    let seen = Rc::clone(&received);
    def.add("srv.east:sink", move |env| {
        let seen = Rc::clone(&seen);
        async move {
            let socket = env.bind(5000)?;
            let conn = socket.accept().await?;
            while let Some(payload) = conn.read(Some(Duration::from_secs(5))).await? {
                seen.borrow_mut().push(text(&payload));
                if seen.borrow().len() == 3 {
                    break;
                }
            }
            Ok(())
        }
    });

    def.add("cli.west:source", |env| async move {
        let conn = env.connect(Endpoint::new("srv.east", 5000)).await?;
        conn.write(msg("m1"))?;
        conn.write(msg("m2"))?;
        conn.write(msg("m3"))?;
        Ok(())
    });

    let mut world = SimWorld::new(def);
    let report = world.run(|control| async move {
        control.start_all()?;
        control.delay(Duration::from_secs(1)).await?;
        control.stop_all().await?;
        Ok(())
    });

    assert!(report.is_clean(), "unexpected fault: {report}");
    // Arrival order differs; read order must not.
    assert_eq!(
        *received.borrow(),
        vec!["m1".to_string(), "m2".to_string(), "m3".to_string()]
    );
}
