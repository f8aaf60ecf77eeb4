// RISC-V 64-bit machine-mode port (QEMU `virt`)
//
// Interrupts come in two classes. Timer and software interrupts (tick and
// switch requests) belong to the kernel and are what critical sections mask,
// through `mie.MTIE`/`mie.MSIE`. External interrupts stay enabled across
// critical sections for latency-critical devices; their handler must never
// call into the kernel.

pub mod clint;
pub mod logger;

use crate::arch::trap::Trap;
use crate::kernel::critical::CriticalNesting;
use crate::kernel::port::{InterruptMask, Port};
use crate::kernel::timeout::Wait;
use crate::kernel::types::*;
use crate::kernel::{QueueId, Scheduler};
use core::arch::asm;
use core::ptr::addr_of_mut;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use core::task::Poll;

/// Words in a trap frame; must match `switch.S`
pub const FRAME_WORDS: usize = 32;

/// Stack must be aligned to 16 bytes (RISC-V ABI requirement)
pub const STACK_ALIGNMENT: usize = 16;

const FRAME_MEPC: usize = 0;
const FRAME_RA: usize = 1;
const FRAME_MSTATUS: usize = 2;
const FRAME_GP: usize = 3;
const FRAME_A0: usize = 10;

/// mstatus for a fresh task: MPP = machine, MPIE set so `mret` enables
/// interrupts
const MSTATUS_INIT: usize = (0b11 << 11) | (1 << 7);


extern "C" {
    fn ember_trap_entry();
    fn ember_start_first_task(frame: usize) -> !;
}

static IN_ISR: AtomicBool = AtomicBool::new(false);
/// High-class handler, stored as a `fn()` address; 0 = none
static EXTERNAL_HANDLER: AtomicUsize = AtomicUsize::new(0);

pub struct BoardPort;

impl Port for BoardPort {
    fn init_stack(&mut self, stack: &mut [usize], entry: TaskEntry, parameter: usize) -> usize {
        // Get the top of the stack (stacks grow downward)
        let end = stack.as_ptr() as usize + stack.len() * core::mem::size_of::<usize>();
        let aligned_top = end & !(STACK_ALIGNMENT - 1);
        let words_below = (aligned_top - stack.as_ptr() as usize) / core::mem::size_of::<usize>();
        let base = words_below - FRAME_WORDS;

        let frame = &mut stack[base..words_below];
        frame.fill(0);
        frame[FRAME_MEPC] = entry as usize;
        frame[FRAME_RA] = task_exit as usize;
        frame[FRAME_MSTATUS] = MSTATUS_INIT;
        frame[FRAME_GP] = global_pointer();
        frame[FRAME_A0] = parameter;

        frame.as_ptr() as usize
    }

    fn request_switch(&mut self) {
        clint::pend_switch();
    }

    fn in_isr(&self) -> bool {
        IN_ISR.load(Ordering::Relaxed)
    }
}

/// gp is set once by the runtime and shared by every task
fn global_pointer() -> usize {
    let gp: usize;
    unsafe { asm!("mv {}, gp", out(reg) gp) };
    gp
}

/// Masks the kernel's interrupt class only
struct KernelMask;

impl InterruptMask for KernelMask {
    fn mask(&mut self) -> bool {
        let was_enabled = riscv::register::mie::read().mtimer();
        unsafe {
            riscv::register::mie::clear_mtimer();
            riscv::register::mie::clear_msoft();
        }
        was_enabled
    }

    fn restore(&mut self, was_enabled: bool) {
        if was_enabled {
            unsafe {
                riscv::register::mie::set_mtimer();
                riscv::register::mie::set_msoft();
            }
        }
    }
}

static mut KERNEL: Scheduler<BoardPort> = Scheduler::new(BoardPort);
static mut NESTING: CriticalNesting = CriticalNesting::new();

/// Run `f` with the kernel's interrupt class masked
pub fn critical<R>(f: impl FnOnce() -> R) -> R {
    // Safety: NESTING is only touched with the kernel class masked, and
    // `enter` masks before it reads the counter
    unsafe { (*addr_of_mut!(NESTING)).enter(&mut KernelMask) };
    let result = f();
    unsafe { (*addr_of_mut!(NESTING)).exit(&mut KernelMask) };
    result
}

/// Run `f` on the kernel inside a critical section
pub fn with_kernel<R>(f: impl FnOnce(&mut Scheduler<BoardPort>) -> R) -> R {
    // Safety: single hart, and every access happens under `critical` or in
    // the trap handler, which runs with interrupts globally disabled
    critical(|| f(unsafe { &mut *addr_of_mut!(KERNEL) }))
}

/// Install the handler for the high interrupt class
///
/// The handler runs even inside kernel critical sections, so it must not
/// call any kernel function.
pub fn set_external_handler(handler: fn()) {
    EXTERNAL_HANDLER.store(handler as usize, Ordering::Relaxed);
}

#[no_mangle]
extern "C" fn ember_trap_handler(frame: usize) -> usize {
    let trap = Trap::decode(riscv::register::mcause::read().bits());
    if !trap.is_kernel_class() {
        match trap {
            Trap::External => {
                // May have interrupted a critical section: the kernel and
                // the switch request are off limits here
                run_external_handler();
                return frame;
            }
            Trap::UnexpectedInterrupt(irq) => panic!("unexpected interrupt {}", irq),
            _ => {
                let mepc = unsafe { *(frame as *const usize).add(FRAME_MEPC) };
                panic!("{:?} at {:#x}", trap, mepc);
            }
        }
    }

    IN_ISR.store(true, Ordering::Relaxed);
    // Safety: kernel-class traps are masked inside every critical section,
    // so no `with_kernel` borrow is live, and interrupts are globally
    // disabled for the whole handler
    let kernel = unsafe { &mut *addr_of_mut!(KERNEL) };

    match trap {
        Trap::Tick => {
            clint::rearm_tick();
            if kernel.tick_advance() {
                kernel.request_switch();
            }
        }
        Trap::Yield => {
            // Resume after the ecall
            // Safety: `frame` points at the frame switch.S just saved
            unsafe { *(frame as *mut usize).add(FRAME_MEPC) += 4 };
            kernel.yield_now();
        }
        _ => {}
    }

    clint::clear_switch();
    let next = if kernel.switch_pending() {
        kernel.switch_context(frame)
    } else {
        frame
    };
    IN_ISR.store(false, Ordering::Relaxed);
    next
}

fn run_external_handler() {
    let handler = EXTERNAL_HANDLER.load(Ordering::Relaxed);
    if handler != 0 {
        // Safety: only ever stored from a `fn()`
        let handler: fn() = unsafe { core::mem::transmute(handler) };
        handler();
    }
}

/// Wait for interrupt (low power mode)
#[inline]
pub fn wait_for_interrupt() {
    unsafe {
        asm!("wfi");
    }
}

/// Where a task's entry function returns to
extern "C" fn task_exit() -> ! {
    with_kernel(|k| k.exit_current());
    // The switch fires as soon as the critical section ends
    loop {
        wait_for_interrupt();
    }
}

extern "C" fn idle_entry(_: usize) {
    loop {
        let others_ready = with_kernel(|k| {
            k.idle_step();
            k.ready_len(config::IDLE_PRIORITY) > 1
        });
        if !others_ready {
            wait_for_interrupt();
        }
    }
}

extern "C" fn timer_daemon_entry(_: usize) {
    loop {
        // Callbacks run with the kernel released, so they may call into it
        if let Poll::Ready((callback, timer)) = with_kernel(|k| k.timer_service_step()) {
            callback(timer);
        }
    }
}

/// Create the timer daemon; call before `start`
pub fn start_timer_service(
    stack: &'static mut [usize],
    queue_storage: &'static mut [u8],
) -> Result<TaskId> {
    with_kernel(|k| k.start_timer_service(timer_daemon_entry, stack, queue_storage))
}

/// Start the scheduler. Never returns.
pub fn start(idle_stack: &'static mut [usize]) -> Result<core::convert::Infallible> {
    let first = with_kernel(|k| k.start(idle_entry, idle_stack))?;

    unsafe {
        asm!("csrw mtvec, {}", in(reg) ember_trap_entry as usize);
    }
    clint::start_tick();
    unsafe {
        riscv::register::mie::set_mtimer();
        riscv::register::mie::set_msoft();
        riscv::register::mie::set_mext();
        ember_start_first_task(first)
    }
}

// ----------------------------------------------------------------------
// Blocking wrappers for task code
// ----------------------------------------------------------------------

/// Retry a blocking kernel call until it completes or fails
///
/// A `Pending` result means the task has been parked; the switch happens as
/// the critical section ends, and the loop resumes when the task is woken.
fn block_on<T>(mut op: impl FnMut(&mut Scheduler<BoardPort>) -> Result<Poll<T>>) -> Result<T> {
    loop {
        if let Poll::Ready(value) = with_kernel(&mut op)? {
            return Ok(value);
        }
    }
}

pub fn delay(ticks: TickType) {
    with_kernel(|k| k.delay(ticks));
}

pub fn delay_until(previous_wake: &mut TickType, period: TickType) -> bool {
    with_kernel(|k| k.delay_until(previous_wake, period))
}

/// Yield through the trap path so the full context is saved
pub fn yield_now() {
    unsafe { asm!("ecall") };
}

pub fn send(queue: QueueId, item: &[u8], timeout: TickType) -> Result<()> {
    let mut wait = Wait::new(timeout);
    block_on(|k| k.send(queue, item, &mut wait))
}

pub fn receive(queue: QueueId, out: &mut [u8], timeout: TickType) -> Result<()> {
    let mut wait = Wait::new(timeout);
    block_on(|k| k.receive(queue, &mut *out, &mut wait))
}

pub fn take(semaphore: QueueId, timeout: TickType) -> Result<()> {
    let mut wait = Wait::new(timeout);
    block_on(|k| k.take(semaphore, &mut wait))
}

pub fn give(semaphore: QueueId) -> Result<()> {
    with_kernel(|k| k.give(semaphore))
}

pub fn start_timer(timer: TimerId, timeout: TickType) -> Result<()> {
    let mut wait = Wait::new(timeout);
    block_on(|k| k.start_timer(timer, &mut wait))
}

pub fn stop_timer(timer: TimerId, timeout: TickType) -> Result<()> {
    let mut wait = Wait::new(timeout);
    block_on(|k| k.stop_timer(timer, &mut wait))
}

pub fn reset_timer(timer: TimerId, timeout: TickType) -> Result<()> {
    let mut wait = Wait::new(timeout);
    block_on(|k| k.reset_timer(timer, &mut wait))
}

pub fn change_timer_period(timer: TimerId, period: TickType, timeout: TickType) -> Result<()> {
    let mut wait = Wait::new(timeout);
    block_on(|k| k.change_timer_period(timer, period, &mut wait))
}
