mod common;

use common::{Kernel, Sim};
use ember_rtos::{QueueId, RtosError, Wait};
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::task::Poll;

/// Take `m` and hold it until `release` is set
fn holder(m: QueueId, release: Rc<Cell<bool>>) -> impl FnMut(&mut Kernel) {
    let mut held = false;
    let mut wait = Wait::forever();
    move |k: &mut Kernel| {
        if !held {
            held = k.take(m, &mut wait) == Ok(Poll::Ready(()));
        } else if release.get() {
            k.give(m).unwrap();
            release.set(false);
        }
    }
}

/// Wait for `m`, log `name` once it is ours, give it back and suspend
fn contender(m: QueueId, name: &'static str, log: Rc<RefCell<Vec<&'static str>>>) -> impl FnMut(&mut Kernel) {
    let mut wait = Wait::forever();
    move |k: &mut Kernel| {
        if let Ok(Poll::Ready(())) = k.take(m, &mut wait) {
            log.borrow_mut().push(name);
            k.give(m).unwrap();
            k.suspend_task(None).unwrap();
        }
    }
}

#[test]
fn holder_inherits_the_highest_waiting_priority() {
    let mut sim = Sim::new();
    let m = sim.k.create_mutex().unwrap();
    let release = Rc::new(Cell::new(false));
    let log = Rc::new(RefCell::new(Vec::new()));

    let low = sim.spawn("low", 1, holder(m, release.clone()));
    let mid = sim.spawn("mid", 5, contender(m, "mid", log.clone()));
    let high = sim.spawn("high", 9, contender(m, "high", log.clone()));
    let p3 = sim.spawn_idle_loop("p3", 3);
    for t in [mid, high, p3] {
        sim.k.suspend_task(Some(t)).unwrap();
    }
    sim.start();
    sim.step();
    assert_eq!(sim.k.mutex_holder(m), Ok(Some(low)));

    sim.k.resume_task(mid).unwrap();
    sim.service_switch();
    assert_eq!(sim.current(), mid);
    sim.step();
    assert_eq!(sim.current(), low);
    assert_eq!(sim.k.priority(Some(low)), Ok(5));
    assert_eq!(sim.k.base_priority(Some(low)), Ok(1));

    // A medium task can't get in while the holder is boosted
    sim.k.resume_task(p3).unwrap();
    sim.service_switch();
    assert_eq!(sim.current(), low);

    sim.k.resume_task(high).unwrap();
    sim.service_switch();
    sim.step();
    assert_eq!(sim.current(), low);
    assert_eq!(sim.k.priority(Some(low)), Ok(9));
    assert_eq!(sim.k.waiting_receivers(m), Ok(2));

    // Lowering the base while boosted leaves the boost in place
    sim.k.set_priority(Some(low), 2).unwrap();
    assert_eq!(sim.k.priority(Some(low)), Ok(9));

    release.set(true);
    sim.step();
    assert_eq!(sim.k.priority(Some(low)), Ok(2));
    assert_eq!(sim.current(), high);

    sim.step();
    assert_eq!(sim.current(), mid);
    sim.step();
    assert_eq!(*log.borrow(), vec!["high", "mid"]);
    assert_eq!(sim.current(), p3);
    assert_eq!(sim.k.mutex_holder(m), Ok(None));
}

#[test]
fn inheritance_follows_a_chain_of_holders() {
    let mut sim = Sim::new();
    let m1 = sim.k.create_mutex().unwrap();
    let m2 = sim.k.create_mutex().unwrap();
    let release = Rc::new(Cell::new(false));
    let log = Rc::new(RefCell::new(Vec::new()));

    let a = sim.spawn("a", 1, holder(m1, release.clone()));

    // b holds m2, then waits for m1
    let mut stage = 0;
    let (mut wait1, mut wait2) = (Wait::forever(), Wait::forever());
    let b = sim.spawn("b", 4, move |k: &mut Kernel| {
        if stage == 0 && k.take(m2, &mut wait2) == Ok(Poll::Ready(())) {
            stage = 1;
        } else if stage == 1 && k.take(m1, &mut wait1) == Ok(Poll::Ready(())) {
            k.give(m1).unwrap();
            k.give(m2).unwrap();
            stage = 2;
        }
    });
    let c = sim.spawn("c", 8, contender(m2, "c", log.clone()));
    sim.k.suspend_task(Some(b)).unwrap();
    sim.k.suspend_task(Some(c)).unwrap();
    sim.start();
    sim.step();

    sim.k.resume_task(b).unwrap();
    sim.service_switch();
    sim.step();
    sim.step();
    assert_eq!(sim.current(), a);
    assert_eq!(sim.k.priority(Some(a)), Ok(4));

    sim.k.resume_task(c).unwrap();
    sim.service_switch();
    sim.step();
    assert_eq!(sim.current(), a);
    assert_eq!(sim.k.priority(Some(b)), Ok(8));
    assert_eq!(sim.k.priority(Some(a)), Ok(8));

    release.set(true);
    sim.step();
    assert_eq!(sim.k.priority(Some(a)), Ok(1));
    assert_eq!(sim.current(), b);

    sim.step();
    assert_eq!(sim.k.priority(Some(b)), Ok(4));
    assert_eq!(sim.current(), c);
    sim.step();
    assert_eq!(*log.borrow(), vec!["c"]);
}

#[test]
fn timed_out_waiter_stops_boosting_the_holder() {
    let mut sim = Sim::new();
    let m = sim.k.create_mutex().unwrap();
    let low = sim.spawn("low", 1, holder(m, Rc::new(Cell::new(false))));

    let outcome = Rc::new(Cell::new(None));
    let record = outcome.clone();
    let mut wait = Wait::ticks(3);
    let high = sim.spawn("high", 9, move |k: &mut Kernel| {
        if record.get().is_none() {
            match k.take(m, &mut wait) {
                Ok(Poll::Pending) => {}
                other => record.set(Some((other, k.tick_count().0))),
            }
        }
    });
    sim.k.suspend_task(Some(high)).unwrap();
    sim.start();
    sim.step();

    sim.k.resume_task(high).unwrap();
    sim.service_switch();
    sim.step();
    assert_eq!(sim.k.priority(Some(low)), Ok(9));

    sim.run_ticks(2);
    assert_eq!(sim.k.priority(Some(low)), Ok(9));
    sim.step();
    sim.tick();
    assert_eq!(sim.k.priority(Some(low)), Ok(1));
    assert_eq!(sim.k.waiting_receivers(m), Ok(0));
    assert_eq!(sim.current(), high);

    sim.step();
    assert_eq!(outcome.get(), Some((Err(RtosError::Timeout), 3)));
    assert_eq!(sim.k.mutex_holder(m), Ok(Some(low)));
}

#[test]
fn suspended_or_deleted_waiter_stops_boosting_the_holder() {
    let mut sim = Sim::new();
    let m = sim.k.create_mutex().unwrap();
    let low = sim.spawn("low", 1, holder(m, Rc::new(Cell::new(false))));
    let high = sim.spawn("high", 9, contender(m, "high", Rc::default()));
    sim.k.suspend_task(Some(high)).unwrap();
    sim.start();
    sim.step();

    sim.k.resume_task(high).unwrap();
    sim.service_switch();
    sim.step();
    assert_eq!(sim.k.priority(Some(low)), Ok(9));

    sim.k.suspend_task(Some(high)).unwrap();
    assert_eq!(sim.k.priority(Some(low)), Ok(1));
    assert_eq!(sim.k.waiting_receivers(m), Ok(0));

    sim.k.resume_task(high).unwrap();
    sim.service_switch();
    sim.step();
    assert_eq!(sim.k.priority(Some(low)), Ok(9));

    sim.k.delete_task(Some(high)).unwrap();
    assert_eq!(sim.k.priority(Some(low)), Ok(1));
    assert_eq!(sim.k.waiting_receivers(m), Ok(0));
}

#[test]
fn recursive_mutex_is_released_by_the_last_give() {
    let mut sim = Sim::new();
    let m = sim.k.create_recursive_mutex().unwrap();
    let owner = sim.spawn_idle_loop("owner", 2);
    sim.start();
    let none = &mut Wait::none();

    for _ in 0..3 {
        assert_eq!(sim.k.take_recursive(m, none), Ok(Poll::Ready(())));
    }
    sim.k.give_recursive(m).unwrap();
    sim.k.give_recursive(m).unwrap();
    assert_eq!(sim.k.mutex_holder(m), Ok(Some(owner)));
    sim.k.give_recursive(m).unwrap();
    assert_eq!(sim.k.mutex_holder(m), Ok(None));
    assert_eq!(sim.k.give_recursive(m), Err(RtosError::NotOwner));

    // The plain calls don't apply to a recursive mutex, and the other way round
    assert_eq!(sim.k.take(m, none), Err(RtosError::InvalidParameter));
    let plain = sim.k.create_mutex().unwrap();
    assert_eq!(sim.k.take_recursive(plain, none), Err(RtosError::InvalidParameter));
    assert_eq!(sim.k.send(plain, &[], none), Err(RtosError::InvalidParameter));
}

#[test]
fn busy_mutex_and_foreign_give_are_refused() {
    let mut sim = Sim::new();
    let m = sim.k.create_mutex().unwrap();
    let a = sim.spawn_idle_loop("a", 3);
    let b = sim.spawn_idle_loop("b", 2);
    sim.start();

    assert_eq!(sim.k.take(m, &mut Wait::none()), Ok(Poll::Ready(())));
    sim.k.suspend_task(None).unwrap();
    sim.service_switch();
    assert_eq!(sim.current(), b);

    assert_eq!(sim.k.take(m, &mut Wait::none()), Err(RtosError::ResourceBusy));
    assert_eq!(sim.k.give(m), Err(RtosError::NotOwner));
    assert_eq!(sim.k.mutex_holder(m), Ok(Some(a)));
    assert_eq!(sim.k.priority(Some(a)), Ok(3));
}

#[test]
#[should_panic(expected = "already holds")]
fn taking_a_held_plain_mutex_again_is_fatal() {
    let mut sim = Sim::new();
    let m = sim.k.create_mutex().unwrap();
    sim.spawn_idle_loop("a", 3);
    sim.start();
    let _ = sim.k.take(m, &mut Wait::none());
    let _ = sim.k.take(m, &mut Wait::none());
}
