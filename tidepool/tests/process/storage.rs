use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

use tidepool::{ClusterDef, SimWorld};

fn ms(v: u64) -> Duration {
    Duration::from_millis(v)
}

#[test]
fn storage_survives_restarts_until_wiped() {
    let runs = Rc::new(Cell::new(0u32));
    let observed: Rc<RefCell<Vec<Option<Vec<u8>>>>> = Rc::default();

    let mut def = ClusterDef::new();
    let counter = Rc::clone(&runs);
    let reads = Rc::clone(&observed);
    def.add("db1:store", move |env| {
        let counter = Rc::clone(&counter);
        let reads = Rc::clone(&reads);
        async move {
            let run = counter.get();
            counter.set(run + 1);
            let ledger = env.storage("ledger")?;
            if run == 0 {
                ledger.put("k", b"v1".to_vec());
            } else {
                reads.borrow_mut().push(ledger.get("k"));
            }
            Ok(())
        }
    });

    let mut world = SimWorld::new(def);
    let report = world.run(|control| async move {
        // First instance writes and exits on its own.
        control.start_all()?;
        control.delay(ms(10)).await?;
        // Second instance still sees the value: storage belongs to the
        // machine, not the process.
        control.start_all()?;
        control.delay(ms(10)).await?;
        // Disk loss: the third instance finds nothing.
        control.wipe_storage("db1")?;
        control.start_all()?;
        control.delay(ms(10)).await?;
        Ok(())
    });

    assert!(report.is_clean(), "unexpected fault: {report}");
    assert_eq!(runs.get(), 3);
    assert_eq!(*observed.borrow(), vec![Some(b"v1".to_vec()), None]);
}

#[test]
fn storages_are_scoped_per_machine_and_name() {
    let observed: Rc<RefCell<Vec<Option<Vec<u8>>>>> = Rc::default();

    let mut def = ClusterDef::new();
    def.add("db1:writer", |env| async move {
        env.storage("a")?.put("k", b"from-a".to_vec());
        Ok(())
    });
    let reads = Rc::clone(&observed);
    def.add("db1:reader", move |env| {
        let reads = Rc::clone(&reads);
        async move {
            env.delay(ms(5)).await?;
            // Same machine, same name: shared. Different name: separate.
            reads.borrow_mut().push(env.storage("a")?.get("k"));
            reads.borrow_mut().push(env.storage("b")?.get("k"));
            Ok(())
        }
    });
    let other = Rc::clone(&observed);
    def.add("db2:reader", move |env| {
        let other = Rc::clone(&other);
        async move {
            env.delay(ms(10)).await?;
            // Same name on another machine is a different storage.
            other.borrow_mut().push(env.storage("a")?.get("k"));
            Ok(())
        }
    });

    let mut world = SimWorld::new(def);
    let report = world.run(|control| async move {
        control.start_all()?;
        control.delay(ms(50)).await?;
        Ok(())
    });

    assert!(report.is_clean(), "unexpected fault: {report}");
    assert_eq!(
        *observed.borrow(),
        vec![Some(b"from-a".to_vec()), None, None]
    );
}
