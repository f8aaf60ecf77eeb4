#![no_std]              // No standard library (embedded)
#![no_main]             // Custom entry point

use core::fmt::Write;
use core::panic::PanicInfo;
use core::ptr::addr_of_mut;
use riscv_rt::entry;     // Provides #[entry] macro

use ember_rtos::arch::riscv64::{self as board, logger::UartWriter};
use ember_rtos::kernel::{config, QueueId, TickType, TIMER_QUEUE_BYTES};
use log::{error, info};

static mut QUEUE: Option<QueueId> = None;
static mut LOCK: Option<QueueId> = None;

fn queue() -> QueueId {
    // Safety: written once in main before the scheduler starts
    unsafe { (*addr_of_mut!(QUEUE)).unwrap() }
}

fn lock() -> QueueId {
    unsafe { (*addr_of_mut!(LOCK)).unwrap() }
}

// ============================================================================
// TASK FUNCTIONS
// ============================================================================

/// Producer - sends 0..9 through a one-slot queue, then returns
extern "C" fn producer(_: usize) {
    for i in 0u32..10 {
        if let Err(e) = board::send(queue(), &i.to_le_bytes(), config::MAX_DELAY) {
            error!("send {}: {}", i, e);
        }
    }
    info!("producer done");
}

/// Consumer - prints whatever arrives
extern "C" fn consumer(_: usize) {
    let mut buf = [0u8; 4];
    loop {
        match board::receive(queue(), &mut buf, TickType::from_ms(1000)) {
            Ok(()) => info!("received {}", u32::from_le_bytes(buf)),
            Err(e) => info!("receive: {}", e),
        }
    }
}

/// Periodic task - fixed cadence, shares the lock with the consumer side
extern "C" fn heartbeat(period_ms: usize) {
    let period = TickType::from_ms(period_ms as u32);
    let mut last_wake = board::with_kernel(|k| k.tick_count());
    loop {
        board::delay_until(&mut last_wake, period);
        if board::take(lock(), config::MAX_DELAY).is_ok() {
            let (tick, hwm) = board::with_kernel(|k| {
                (k.tick_count(), k.stack_high_water_mark(None).unwrap_or(0))
            });
            info!("heartbeat at tick {}, {} stack words untouched", tick.0, hwm);
            let _ = board::give(lock());
        }
    }
}

/// Auto-reload timer callback, run by the timer daemon
fn uptime(timer: ember_rtos::TimerId) {
    let tick = board::with_kernel(|k| k.tick_count());
    info!("timer {} at tick {}", timer, tick.0);
}

fn stack_overflow(task: ember_rtos::TaskId, name: &str) {
    let _ = writeln!(UartWriter, "stack overflow in {} '{}'", task, name);
}

// ============================================================================
// MAIN
// ============================================================================

#[entry]
fn main() -> ! {
    board::logger::init(log::LevelFilter::Info);
    info!("ember-rtos demo, {} Hz tick", config::TICK_RATE_HZ);

    // Task stacks
    static mut IDLE_STACK: [usize; 512] = [0; 512];
    static mut PRODUCER_STACK: [usize; 1024] = [0; 1024];
    static mut CONSUMER_STACK: [usize; 1024] = [0; 1024];
    static mut HEARTBEAT_STACK: [usize; 1024] = [0; 1024];
    static mut QUEUE_STORAGE: [u8; 4] = [0; 4];
    static mut TIMER_STACK: [usize; config::TIMER_TASK_STACK_DEPTH] = [0; config::TIMER_TASK_STACK_DEPTH];
    static mut TIMER_COMMANDS: [u8; TIMER_QUEUE_BYTES] = [0; TIMER_QUEUE_BYTES];

    let started = board::with_kernel(|k| {
        k.set_hooks(ember_rtos::Hooks {
            stack_overflow: Some(stack_overflow),
            ..Default::default()
        });

        // Safety: each static is handed out exactly once, here
        unsafe {
            QUEUE = Some(k.create_queue(1, 4, &mut *addr_of_mut!(QUEUE_STORAGE))?);
            LOCK = Some(k.create_mutex()?);

            k.create_task("producer", 2, producer, 0, &mut *addr_of_mut!(PRODUCER_STACK))?;
            k.create_task("consumer", 2, consumer, 0, &mut *addr_of_mut!(CONSUMER_STACK))?;
            k.create_task("heartbeat", 3, heartbeat, 500, &mut *addr_of_mut!(HEARTBEAT_STACK))?;
        }
        Ok::<_, ember_rtos::RtosError>(())
    });
    if let Err(e) = started {
        panic!("task setup failed: {}", e);
    }

    // Safety: as above
    let timers = unsafe {
        board::start_timer_service(
            &mut *addr_of_mut!(TIMER_STACK),
            &mut *addr_of_mut!(TIMER_COMMANDS),
        )
    }
    .and_then(|_| {
        let timer = board::with_kernel(|k| {
            k.create_timer("uptime", TickType::from_ms(1000), true, uptime)
        })?;
        // The daemon isn't running yet, so the command just queues
        board::with_kernel(|k| k.start_timer(timer, &mut ember_rtos::Wait::none())).map(|_| ())
    });
    if let Err(e) = timers {
        panic!("timer setup failed: {}", e);
    }

    // Safety: as above
    let idle_stack = unsafe { &mut *addr_of_mut!(IDLE_STACK) };
    match board::start(idle_stack) {
        Err(e) => panic!("Scheduler failed to start: {}", e),
        Ok(never) => match never {},
    }
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    let mut uart = UartWriter;
    let _ = writeln!(uart);
    let _ = writeln!(uart, "========================================");
    let _ = writeln!(uart, "           *** PANIC! ***");
    let _ = writeln!(uart, "========================================");

    if let Some(location) = info.location() {
        let _ = writeln!(
            uart,
            "Location: {}:{}:{}",
            location.file(),
            location.line(),
            location.column()
        );
    }
    let _ = writeln!(uart, "Message: {}", info.message());
    let _ = writeln!(uart, "System halted.");

    loop {
        board::wait_for_interrupt();
    }
}
