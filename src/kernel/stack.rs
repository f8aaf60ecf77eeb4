// Stack fill, high-water mark and overflow detection
//
// Stacks grow down from `stack_end` towards `stack_base`. Every stack is
// filled with `STACK_FILL_WORD` at creation; words still holding the pattern
// at the low end have never been touched.

use crate::kernel::task::TaskControlBlock;
use crate::kernel::types::{config, StackCheck};

pub fn fill(stack: &mut [usize]) {
    stack.fill(config::STACK_FILL_WORD);
}

/// Words at the bottom of the stack that were never written
pub fn high_water_mark(tcb: &TaskControlBlock) -> usize {
    let base = tcb.stack_base.as_ptr();
    (0..tcb.stack_size)
        // Safety: the region was handed to the kernel at creation and stays
        // alive for the task's lifetime. Reads are volatile because the task
        // writes it behind the compiler's back.
        .take_while(|&i| unsafe { core::ptr::read_volatile(base.add(i)) } == config::STACK_FILL_WORD)
        .count()
}

/// Has the task run off the end of its stack?
///
/// Opportunistic: an overflow that skipped over the canary words without
/// writing them goes unnoticed.
pub fn overflowed(tcb: &TaskControlBlock, saved_sp: usize) -> bool {
    let base = tcb.stack_base.as_ptr() as usize;
    match config::CHECK_FOR_STACK_OVERFLOW {
        StackCheck::Off => false,
        StackCheck::Pointer => saved_sp < base || saved_sp > tcb.stack_end(),
        StackCheck::Canary => {
            saved_sp < base
                || saved_sp > tcb.stack_end()
                || high_water_mark(tcb) < config::STACK_CANARY_WORDS.min(tcb.stack_size)
        }
    }
}
