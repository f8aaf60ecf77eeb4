//! Step-driven simulation of a kernel on the host port.
//!
//! Each task body is a closure that performs one step of the task's work per
//! call, keeping its own state between calls. A blocking call that returns
//! `Pending` is simply retried the next time the task is scheduled, which is
//! exactly what the board's blocking wrappers do.
#![allow(dead_code)]

use ember_rtos::arch::host::HostPort;
use ember_rtos::kernel::TIMER_QUEUE_BYTES;
use ember_rtos::{Priority, Scheduler, TaskId};
use std::collections::HashMap;
use std::task::Poll;

pub type Kernel = Scheduler<HostPort>;
type Body = Box<dyn FnMut(&mut Kernel)>;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn stack() -> &'static mut [usize] {
    vec![0usize; 256].leak()
}

pub fn storage(bytes: usize) -> &'static mut [u8] {
    vec![0u8; bytes].leak()
}

pub extern "C" fn entry(_: usize) {}

pub struct Sim {
    pub k: Kernel,
    bodies: HashMap<TaskId, Body>,
    /// Saved stack pointer of every task that has been switched in
    sp: HashMap<TaskId, usize>,
    /// Task running at each tick interrupt, oldest first
    pub slices: Vec<TaskId>,
}

impl Sim {
    pub fn new() -> Self {
        init_logging();
        Sim {
            k: Scheduler::new(HostPort::new()),
            bodies: HashMap::new(),
            sp: HashMap::new(),
            slices: Vec::new(),
        }
    }

    pub fn spawn(&mut self, name: &str, priority: Priority, body: impl FnMut(&mut Kernel) + 'static) -> TaskId {
        let id = self
            .k
            .create_task(name, priority, entry, 0, stack())
            .expect("task slots exhausted");
        self.bodies.insert(id, Box::new(body));
        id
    }

    /// A task that only ever spins
    pub fn spawn_idle_loop(&mut self, name: &str, priority: Priority) -> TaskId {
        self.spawn(name, priority, |_| {})
    }

    /// The timer daemon, running every expired callback until it blocks
    pub fn start_timer_service(&mut self) -> TaskId {
        let id = self
            .k
            .start_timer_service(entry, stack(), storage(TIMER_QUEUE_BYTES))
            .expect("no slot for the timer daemon");
        self.bodies.insert(
            id,
            Box::new(|k: &mut Kernel| {
                while let Poll::Ready((callback, timer)) = k.timer_service_step() {
                    callback(timer);
                }
            }),
        );
        id
    }

    /// Run ready tasks until only the idle task is left
    pub fn settle(&mut self) {
        self.service_switch();
        let idle = self.k.idle_task().expect("scheduler not started");
        for _ in 0..64 {
            if self.current() == idle {
                return;
            }
            self.step();
        }
        panic!("tasks never settled");
    }

    pub fn start(&mut self) {
        let first_sp = self.k.start(entry, stack()).expect("no slot for the idle task");
        let first = self.current();
        self.sp.insert(first, first_sp);
        let idle = self.k.idle_task().unwrap();
        self.bodies.insert(idle, Box::new(|k: &mut Kernel| k.idle_step()));
    }

    pub fn current(&self) -> TaskId {
        self.k.current_task().expect("no current task")
    }

    /// Run one step of the current task, then switch if it asked to
    pub fn step(&mut self) {
        let current = self.current();
        if let Some(mut body) = self.bodies.remove(&current) {
            body(&mut self.k);
            if self.k.task_state(current).is_ok() {
                self.bodies.insert(current, body);
            }
        }
        self.service_switch();
    }

    /// What the port does on interrupt exit
    pub fn service_switch(&mut self) {
        self.k.port_mut().take_switch();
        if !self.k.switch_pending() {
            return;
        }
        let saved = self
            .k
            .current_task()
            .and_then(|t| self.sp.get(&t).copied())
            .unwrap_or(0);
        let next_sp = self.k.switch_context(saved);
        if !self.k.is_scheduler_suspended() {
            let next = self.current();
            self.sp.insert(next, next_sp);
        }
    }

    /// One tick interrupt
    pub fn tick(&mut self) {
        self.slices.push(self.current());
        self.k.port_mut().in_isr = true;
        let switch = self.k.tick_advance();
        self.k.port_mut().in_isr = false;
        self.interrupt_exit(switch);
    }

    /// Leave an interrupt, switching if the handler woke a task that
    /// outranks the interrupted one
    pub fn interrupt_exit(&mut self, switch: bool) {
        if switch {
            self.k.request_switch();
        }
        self.service_switch();
    }

    /// `n` rounds of one task step followed by a tick
    pub fn run_ticks(&mut self, n: usize) {
        for _ in 0..n {
            self.step();
            self.tick();
        }
    }

    /// Pretend to be an interrupt handler for the duration of `f`
    pub fn isr<R>(&mut self, f: impl FnOnce(&mut Kernel) -> R) -> R {
        self.k.port_mut().in_isr = true;
        let result = f(&mut self.k);
        self.k.port_mut().in_isr = false;
        result
    }
}
