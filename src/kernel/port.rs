//! The seam between the portable kernel and a particular CPU.
//!
//! A port owns the raw register state. The kernel only ever sees a saved
//! stack pointer: the trap entry pushes the interrupted task's registers onto
//! its own stack, hands that stack pointer to
//! [`Scheduler::switch_context`](crate::kernel::Scheduler::switch_context)
//! (save and select next) and restores whatever stack pointer comes back.

use crate::kernel::types::{config, TaskEntry, TickType};

pub trait Port {
    /// Build the frame the first restore of a new task will pop
    ///
    /// Returns the stack pointer to store in the TCB. The frame must start
    /// the task at `entry(parameter)` and send a returning task to the
    /// port's exit path, which deletes it.
    fn init_stack(&mut self, stack: &mut [usize], entry: TaskEntry, parameter: usize) -> usize;

    /// Ask for a context switch at the next interrupt exit
    fn request_switch(&mut self);

    /// Running in interrupt context?
    fn in_isr(&self) -> bool;

    /// Whether the idle task should try `suppress_ticks`
    fn tickless_idle(&self) -> bool {
        config::USE_TICKLESS_IDLE
    }

    /// Reprogram the tick timer to stay quiet for up to `expected_idle`
    /// ticks. Returns the number of ticks that actually passed.
    fn suppress_ticks(&mut self, expected_idle: TickType) -> TickType {
        let _ = expected_idle;
        TickType::zero()
    }
}

/// Masking of the interrupt class the kernel shares state with
///
/// Ports with a second, higher interrupt class leave it enabled: handlers in
/// that class must not call into the kernel at all.
pub trait InterruptMask {
    /// Mask kernel-aware interrupts, returning whether they were enabled
    fn mask(&mut self) -> bool;

    /// Put the mask back to what `mask` reported
    fn restore(&mut self, was_enabled: bool);
}
