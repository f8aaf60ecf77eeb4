//! A hosted stand-in for the hardware port.
//!
//! Nothing here touches registers. Switch requests and interrupt context are
//! plain flags the caller (normally a test harness) reads and drives, and a
//! task's "context" is just the stack pointer the kernel hands back.

use crate::kernel::port::{InterruptMask, Port};
use crate::kernel::types::{TaskEntry, TickType};

/// Words of fake frame written below the top of every stack
pub const FRAME_WORDS: usize = 4;

#[derive(Debug, Default)]
pub struct HostPort {
    /// A switch was requested and not yet serviced
    pub switch_pending: bool,
    /// Total switch requests seen
    pub switch_requests: usize,
    /// The caller is pretending to be an interrupt handler
    pub in_isr: bool,
    /// Kernel-class interrupts enabled
    pub interrupts_enabled: bool,
    /// Ticks `suppress_ticks` reports as slept; 0 disables tickless idle
    pub tickless_budget: u32,
}

impl HostPort {
    pub const fn new() -> Self {
        HostPort {
            switch_pending: false,
            switch_requests: 0,
            in_isr: false,
            interrupts_enabled: true,
            tickless_budget: 0,
        }
    }

    /// Consume a pending switch request
    pub fn take_switch(&mut self) -> bool {
        core::mem::take(&mut self.switch_pending)
    }
}

impl Port for HostPort {
    fn init_stack(&mut self, stack: &mut [usize], entry: TaskEntry, parameter: usize) -> usize {
        let base = stack.len() - FRAME_WORDS;
        let frame = &mut stack[base..];
        frame.fill(0);
        frame[0] = entry as usize;
        frame[1] = parameter;
        frame.as_ptr() as usize
    }

    fn request_switch(&mut self) {
        self.switch_pending = true;
        self.switch_requests += 1;
    }

    fn in_isr(&self) -> bool {
        self.in_isr
    }

    fn tickless_idle(&self) -> bool {
        self.tickless_budget > 0
    }

    fn suppress_ticks(&mut self, expected_idle: TickType) -> TickType {
        TickType::new(expected_idle.0.min(self.tickless_budget))
    }
}

impl InterruptMask for HostPort {
    fn mask(&mut self) -> bool {
        core::mem::replace(&mut self.interrupts_enabled, false)
    }

    fn restore(&mut self, was_enabled: bool) {
        self.interrupts_enabled = was_enabled;
    }
}
