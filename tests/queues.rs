mod common;

use common::{storage, Kernel, Sim};
use ember_rtos::kernel::QueueKind;
use ember_rtos::{RtosError, TaskState, TickType, Wait};
use quickcheck_macros::quickcheck;
use std::cell::RefCell;
use std::rc::Rc;
use std::task::Poll;

#[test]
fn producer_and_consumer_alternate_through_a_one_slot_queue() {
    let mut sim = Sim::new();
    let q = sim.k.create_queue(1, 4, storage(4)).unwrap();

    let mut next = 0u32;
    let mut wait = Wait::forever();
    sim.spawn("producer", 2, move |k: &mut Kernel| {
        if next < 10 && k.send(q, &next.to_le_bytes(), &mut wait) == Ok(Poll::Ready(())) {
            next += 1;
            wait = Wait::forever();
        }
    });

    let received = Rc::new(RefCell::new(Vec::new()));
    let out = received.clone();
    let mut wait = Wait::forever();
    sim.spawn("consumer", 2, move |k: &mut Kernel| {
        let mut buf = [0u8; 4];
        if k.receive(q, &mut buf, &mut wait) == Ok(Poll::Ready(())) {
            out.borrow_mut().push(u32::from_le_bytes(buf));
            wait = Wait::forever();
        }
    });
    sim.start();

    let mut ticks = 0;
    while received.borrow().len() < 10 {
        sim.run_ticks(1);
        ticks += 1;
        assert!(ticks < 1000, "consumer stalled at {:?}", received.borrow());
    }
    assert_eq!(*received.borrow(), (0..10).collect::<Vec<_>>());
    assert!(sim.k.tick_count() >= TickType::new(10));
}

#[quickcheck]
fn receive_timeout_expires_no_earlier_than_requested(timeout: u8) -> bool {
    let timeout = timeout as u32 % 40 + 1;
    let mut sim = Sim::new();
    let q = sim.k.create_queue(2, 1, storage(2)).unwrap();

    let outcome = Rc::new(RefCell::new(None));
    let record = outcome.clone();
    let mut wait = Wait::ticks(timeout);
    let receiver = sim.spawn("receiver", 3, move |k: &mut Kernel| {
        if record.borrow().is_some() {
            return;
        }
        let mut buf = [0u8];
        match k.receive(q, &mut buf, &mut wait) {
            Ok(Poll::Pending) => {}
            other => *record.borrow_mut() = Some((other, k.tick_count())),
        }
    });
    sim.spawn_idle_loop("busy", 1);
    sim.start();

    sim.step();
    let mut ok = sim.k.task_state(receiver) == Ok(TaskState::Blocked)
        && sim.k.waiting_receivers(q) == Ok(1)
        && sim.k.delayed_len() == 1;

    for _ in 0..timeout + 2 {
        sim.run_ticks(1);
        if outcome.borrow().is_some() {
            break;
        }
    }

    let result = *outcome.borrow();
    ok &= matches!(result, Some((Err(RtosError::Timeout), t)) if t >= TickType::new(timeout));
    ok && sim.k.waiting_receivers(q) == Ok(0) && sim.k.delayed_len() == 0
}

#[test]
fn event_before_the_timeout_tick_wins() {
    let mut sim = Sim::new();
    let q = sim.k.create_queue(1, 1, storage(1)).unwrap();
    let got = Rc::new(RefCell::new(None));
    let record = got.clone();
    let mut wait = Wait::ticks(5);
    let receiver = sim.spawn("receiver", 3, move |k: &mut Kernel| {
        let mut buf = [0u8];
        if let Ok(Poll::Ready(())) = k.receive(q, &mut buf, &mut wait) {
            *record.borrow_mut() = Some(buf[0]);
        }
    });
    sim.spawn_idle_loop("busy", 1);
    sim.start();
    sim.step();
    sim.run_ticks(4);

    // Sent on the last tick before the deadline
    assert_eq!(sim.isr(|k| k.send_from_isr(q, &[42])), Ok(true));
    assert_eq!(sim.k.delayed_len(), 0);
    sim.interrupt_exit(true);
    assert_eq!(sim.current(), receiver);
    sim.step();
    assert_eq!(*got.borrow(), Some(42));
}

#[test]
fn highest_priority_waiter_is_served_first() {
    let mut sim = Sim::new();
    let q = sim.k.create_queue(1, 1, storage(1)).unwrap();
    let served = Rc::new(RefCell::new(Vec::new()));

    for (name, priority) in [("p3", 3), ("p7", 7), ("p5", 5)] {
        let log = served.clone();
        let mut wait = Wait::forever();
        sim.spawn(name, priority, move |k: &mut Kernel| {
            let mut buf = [0u8];
            if let Ok(Poll::Ready(())) = k.receive(q, &mut buf, &mut wait) {
                log.borrow_mut().push((priority, buf[0]));
                k.suspend_task(None).unwrap();
            }
        });
    }
    sim.spawn_idle_loop("busy", 1);
    sim.start();
    for _ in 0..3 {
        sim.step();
    }
    assert_eq!(sim.k.waiting_receivers(q), Ok(3));

    for item in 1..=3u8 {
        assert_eq!(sim.isr(|k| k.send_from_isr(q, &[item])), Ok(true));
        sim.interrupt_exit(true);
        sim.step();
    }
    assert_eq!(*served.borrow(), vec![(7, 1), (5, 2), (3, 3)]);
}

#[test]
fn zero_timeout_reports_full_and_empty() {
    let mut sim = Sim::new();
    let q = sim.k.create_queue(2, 1, storage(2)).unwrap();
    let mut buf = [0u8];

    assert_eq!(sim.k.receive(q, &mut buf, &mut Wait::none()), Err(RtosError::QueueEmpty));
    assert_eq!(sim.k.send(q, &[1], &mut Wait::none()), Ok(Poll::Ready(())));
    assert_eq!(sim.k.send(q, &[2], &mut Wait::none()), Ok(Poll::Ready(())));
    assert_eq!(sim.k.send(q, &[3], &mut Wait::none()), Err(RtosError::QueueFull));
    assert_eq!(sim.isr(|k| k.send_from_isr(q, &[3])), Err(RtosError::QueueFull));
    assert_eq!(sim.k.messages_waiting(q), Ok(2));
    assert_eq!(sim.k.spaces_available(q), Ok(0));
}

#[test]
fn front_send_peek_and_reset() {
    let mut sim = Sim::new();
    let q = sim.k.create_queue(3, 2, storage(6)).unwrap();
    let none = &mut Wait::none();
    let mut buf = [0u8; 2];

    let sent = Ok(Poll::Ready(()));
    assert_eq!(sim.k.send(q, &[1, 1], none), sent);
    assert_eq!(sim.k.send(q, &[2, 2], none), sent);
    assert_eq!(sim.k.send_to_front(q, &[9, 9], none), sent);

    assert_eq!(sim.k.peek(q, &mut buf, none), Ok(Poll::Ready(())));
    assert_eq!(buf, [9, 9]);
    assert_eq!(sim.k.messages_waiting(q), Ok(3));

    assert_eq!(sim.k.receive(q, &mut buf, none), sent);
    assert_eq!(buf, [9, 9]);
    assert_eq!(sim.k.receive(q, &mut buf, none), sent);
    assert_eq!(buf, [1, 1]);

    sim.k.reset(q).unwrap();
    assert_eq!(sim.k.messages_waiting(q), Ok(0));
    assert_eq!(sim.k.spaces_available(q), Ok(3));
    assert_eq!(sim.k.receive(q, &mut buf, none), Err(RtosError::QueueEmpty));
}

#[test]
fn overwrite_keeps_only_the_latest_value() {
    let mut sim = Sim::new();
    let mailbox = sim.k.create_queue(1, 4, storage(4)).unwrap();
    for v in [10u32, 20, 30] {
        sim.k.overwrite(mailbox, &v.to_le_bytes()).unwrap();
    }
    let mut buf = [0u8; 4];
    assert_eq!(sim.k.receive(mailbox, &mut buf, &mut Wait::none()), Ok(Poll::Ready(())));
    assert_eq!(u32::from_le_bytes(buf), 30);
    assert_eq!(sim.k.messages_waiting(mailbox), Ok(0));
}

#[test]
fn wrong_item_size_is_rejected() {
    let mut sim = Sim::new();
    let q = sim.k.create_queue(2, 4, storage(8)).unwrap();
    assert_eq!(sim.k.send(q, &[1, 2], &mut Wait::none()), Err(RtosError::InvalidParameter));
    assert_eq!(sim.k.create_queue(4, 4, storage(8)), Err(RtosError::InvalidParameter));
    assert_eq!(sim.k.create_queue(0, 4, storage(8)), Err(RtosError::InvalidParameter));
}

#[test]
fn receive_from_isr_frees_a_blocked_sender() {
    let mut sim = Sim::new();
    let q = sim.k.create_queue(1, 1, storage(1)).unwrap();
    assert_eq!(sim.k.send(q, &[5], &mut Wait::none()), Ok(Poll::Ready(())));

    let mut wait = Wait::forever();
    let sender = sim.spawn("sender", 4, move |k: &mut Kernel| {
        let _ = k.send(q, &[6], &mut wait);
    });
    sim.spawn_idle_loop("busy", 2);
    sim.start();
    sim.step();
    assert_eq!(sim.k.waiting_senders(q), Ok(1));

    let mut buf = [0u8];
    assert_eq!(sim.isr(|k| k.receive_from_isr(q, &mut buf)), Ok(true));
    assert_eq!(buf, [5]);
    assert_eq!(sim.k.task_state(sender), Ok(TaskState::Ready));
    assert_eq!(sim.isr(|k| k.receive_from_isr(q, &mut buf)), Err(RtosError::QueueEmpty));
}

#[test]
fn counting_semaphore_counts() {
    let mut sim = Sim::new();
    let sem = sim.k.create_counting_semaphore(3, 1).unwrap();
    let none = &mut Wait::none();

    assert_eq!(sim.k.take(sem, none), Ok(Poll::Ready(())));
    assert_eq!(sim.k.take(sem, none), Err(RtosError::QueueEmpty));
    for _ in 0..3 {
        sim.k.give(sem).unwrap();
    }
    assert_eq!(sim.k.give(sem), Err(RtosError::QueueFull));
    assert_eq!(sim.k.messages_waiting(sem), Ok(3));
    assert_eq!(
        sim.k.create_counting_semaphore(2, 3),
        Err(RtosError::InvalidParameter)
    );
}

#[test]
fn binary_semaphore_signals_a_waiting_task() {
    let mut sim = Sim::new();
    let sem = sim.k.create_binary_semaphore().unwrap();
    let mut wait = Wait::forever();
    let counter = Rc::new(RefCell::new(0));
    let seen = counter.clone();
    let handler = sim.spawn("handler", 6, move |k: &mut Kernel| {
        if let Ok(Poll::Ready(())) = k.take(sem, &mut wait) {
            *seen.borrow_mut() += 1;
            wait = Wait::forever();
        }
    });
    sim.spawn_idle_loop("busy", 1);
    sim.start();
    sim.step();
    assert_eq!(sim.k.task_state(handler), Ok(TaskState::Blocked));

    for round in 1..=3 {
        assert_eq!(sim.isr(|k| k.give_from_isr(sem)), Ok(true));
        sim.interrupt_exit(true);
        sim.step(); // takes it
        sim.step(); // blocks again
        assert_eq!(*counter.borrow(), round);
        assert_eq!(sim.k.task_state(handler), Ok(TaskState::Blocked));
    }
}

#[test]
#[should_panic(expected = "deleted with tasks waiting")]
fn deleting_a_queue_with_waiters_is_fatal() {
    let mut sim = Sim::new();
    let q = sim.k.create_queue(1, 1, storage(1)).unwrap();
    let mut wait = Wait::forever();
    sim.spawn("receiver", 3, move |k: &mut Kernel| {
        let _ = k.receive(q, &mut [0u8], &mut wait);
    });
    sim.start();
    sim.step();
    sim.k.delete_queue(q);
}

#[test]
#[should_panic(expected = "deleted twice")]
fn deleting_a_queue_twice_is_fatal() {
    let mut sim = Sim::new();
    let q = sim.k.create_queue(1, 1, storage(1)).unwrap();
    sim.k.delete_queue(q);
    sim.k.delete_queue(q);
}

#[test]
fn deleted_queue_handles_stop_resolving() {
    let mut sim = Sim::new();
    let q = sim.k.create_queue(1, 1, storage(1)).unwrap();
    sim.k.delete_queue(q);
    assert_eq!(sim.k.messages_waiting(q), Err(RtosError::QueueNotFound));
    let again = sim.k.create_queue(1, 1, storage(1)).unwrap();
    assert_eq!(again.index(), q.index());
    assert_ne!(again, q);
}

#[test]
fn every_primitive_reports_its_kind() {
    let mut sim = Sim::new();
    let q = sim.k.create_queue(1, 1, storage(1)).unwrap();
    let bin = sim.k.create_binary_semaphore().unwrap();
    let count = sim.k.create_counting_semaphore(2, 0).unwrap();
    let m = sim.k.create_mutex().unwrap();
    let rm = sim.k.create_recursive_mutex().unwrap();
    let kinds: Vec<_> = [q, bin, count, m, rm]
        .iter()
        .map(|&id| sim.k.queue_kind(id).unwrap())
        .collect();
    assert_eq!(
        kinds,
        vec![
            QueueKind::Queue,
            QueueKind::BinarySemaphore,
            QueueKind::CountingSemaphore,
            QueueKind::Mutex,
            QueueKind::RecursiveMutex,
        ]
    );
    assert_eq!(sim.k.messages_waiting(m), Ok(1));
    assert_eq!(sim.k.mutex_holder(q), Err(RtosError::InvalidParameter));
}
