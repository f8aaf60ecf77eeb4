// RISC-V trap decoding, shared by the board port and host-side tests

const MCAUSE_INTERRUPT: usize = 1 << (usize::BITS - 1);
const IRQ_MACHINE_SOFT: usize = 3;
const IRQ_MACHINE_TIMER: usize = 7;
const IRQ_MACHINE_EXTERNAL: usize = 11;
const EXC_ECALL_FROM_M: usize = 11;

/// What a trap asks of the handler, decoded from `mcause`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trap {
    /// Machine timer: advance the tick
    Tick,
    /// Machine software interrupt: a pended context switch
    SwitchRequest,
    /// `ecall` from machine mode: voluntary yield
    Yield,
    /// Device interrupt. Stays unmasked inside critical sections, so it
    /// must not touch the kernel.
    External,
    UnexpectedInterrupt(usize),
    Exception(usize),
}

impl Trap {
    pub fn decode(mcause: usize) -> Self {
        if mcause & MCAUSE_INTERRUPT != 0 {
            match mcause & !MCAUSE_INTERRUPT {
                IRQ_MACHINE_TIMER => Trap::Tick,
                IRQ_MACHINE_SOFT => Trap::SwitchRequest,
                IRQ_MACHINE_EXTERNAL => Trap::External,
                other => Trap::UnexpectedInterrupt(other),
            }
        } else {
            match mcause {
                EXC_ECALL_FROM_M => Trap::Yield,
                other => Trap::Exception(other),
            }
        }
    }

    /// Whether the handler may borrow the kernel and run the switch epilogue.
    /// Only traps that critical sections mask qualify.
    pub fn is_kernel_class(self) -> bool {
        matches!(self, Trap::Tick | Trap::SwitchRequest | Trap::Yield)
    }
}
