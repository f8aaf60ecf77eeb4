//! A small preemptive, fixed-priority, tick-driven real-time kernel.
//!
//! The portable core lives in [`kernel`]: per-priority ready lists with
//! round-robin at equal priority, wake-time ordered delayed lists, queues,
//! semaphores, priority-inheriting mutexes and software timers run by a
//! daemon task. Everything machine-specific sits behind [`kernel::Port`];
//! [`arch`] has the RISC-V board port and a hosted port for running the
//! kernel in tests.
#![cfg_attr(not(test), no_std)]

pub mod arch;
pub mod kernel;

pub use kernel::{
    config, Hooks, Priority, QueueId, Result, RtosError, Scheduler, TaskId, TaskState, TickType,
    TimerId, Wait,
};
