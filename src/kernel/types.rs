// Core types for the RTOS

use core::fmt;

/// Priority type - higher number = higher priority
/// Range: 0 (idle) to MAX_PRIORITIES-1 (highest)
pub type Priority = usize;

/// Tick counter type - wraps around at 32 bits
///
/// Wake times past the wrap point go to the overflow delayed list, so `<` is
/// only ever used between values of the same counter epoch. Durations go
/// through [`TickType::elapsed_since`].
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TickType(pub u32);

impl TickType {
    pub const fn new(value: u32) -> Self {
        TickType(value)
    }

    pub const fn zero() -> Self {
        TickType(0)
    }

    pub const fn max() -> Self {
        TickType(u32::MAX)
    }

    pub fn wrapping_add(self, other: TickType) -> TickType {
        TickType(self.0.wrapping_add(other.0))
    }

    pub fn elapsed_since(self, earlier: TickType) -> TickType {
        TickType(self.0.wrapping_sub(earlier.0))
    }

    /// Convert from milliseconds, rounding down to whole ticks
    pub fn from_ms(ms: u32) -> Self {
        TickType(((ms as u64 * config::TICK_RATE_HZ as u64) / 1000) as u32)
    }

    pub fn to_ms(self) -> u64 {
        self.0 as u64 * 1000 / config::TICK_RATE_HZ as u64
    }
}

impl From<u32> for TickType {
    fn from(value: u32) -> Self {
        TickType(value)
    }
}

/// Task states
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TaskState {
    Ready,
    Running,
    Blocked,
    Suspended,
    /// Deleted while running; the slot is reclaimed by the idle task.
    Deleted,
}

pub type StackSize = usize;

/// Handle to a task slot.
///
/// The generation makes handles to reclaimed slots fail lookup instead of
/// aliasing whatever task is created in the slot next.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct TaskId {
    pub(crate) index: u16,
    pub(crate) generation: u16,
}

impl TaskId {
    pub fn index(self) -> usize {
        self.index as usize
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T{:02}.{}", self.index, self.generation)
    }
}

/// Handle to a queue, semaphore or mutex slot.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct QueueId {
    pub(crate) index: u16,
    pub(crate) generation: u16,
}

impl QueueId {
    pub fn index(self) -> usize {
        self.index as usize
    }
}

impl fmt::Display for QueueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Q{:02}.{}", self.index, self.generation)
    }
}

/// Handle to a software timer slot.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct TimerId {
    pub(crate) index: u16,
    pub(crate) generation: u16,
}

impl TimerId {
    pub fn index(self) -> usize {
        self.index as usize
    }
}

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tm{:02}.{}", self.index, self.generation)
    }
}

/// Task entry point. Returning from it deletes the task.
pub type TaskEntry = extern "C" fn(usize);

/// Error types for RTOS operations
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RtosError {
    /// No free task or queue slot: creation failed
    OutOfMemory,
    TaskNotFound,
    QueueNotFound,
    TimerNotFound,
    InvalidParameter,
    /// The wait expired before the operation could complete
    Timeout,
    /// Zero-timeout send (or send from an ISR) on a full queue
    QueueFull,
    /// Zero-timeout receive (or receive from an ISR) on an empty queue
    QueueEmpty,
    /// Mutex released by a task that does not hold it
    NotOwner,
    ResourceBusy,
}

impl fmt::Display for RtosError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            RtosError::OutOfMemory => "no free slot",
            RtosError::TaskNotFound => "no such task",
            RtosError::QueueNotFound => "no such queue",
            RtosError::TimerNotFound => "no such timer",
            RtosError::InvalidParameter => "invalid parameter",
            RtosError::Timeout => "timed out",
            RtosError::QueueFull => "queue full",
            RtosError::QueueEmpty => "queue empty",
            RtosError::NotOwner => "mutex not held by caller",
            RtosError::ResourceBusy => "resource busy",
        };
        f.write_str(msg)
    }
}

pub type Result<T> = core::result::Result<T, RtosError>;

/// How hard the kernel looks for stack overflows on every context switch
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StackCheck {
    Off,
    /// Saved stack pointer must lie inside the task's stack region
    Pointer,
    /// Pointer check, plus the lowest `STACK_CANARY_WORDS` words must still
    /// hold the fill pattern
    Canary,
}

// Configuration constants
pub mod config {
    use super::*;

    /// Maximum number of priority levels
    pub const MAX_PRIORITIES: usize = 15;

    /// Idle task priority (always 0)
    pub const IDLE_PRIORITY: Priority = 0;

    /// Task slots, idle task included
    pub const MAX_TASKS: usize = 16;

    /// Queue, semaphore and mutex slots
    pub const MAX_QUEUES: usize = 16;

    /// Task name length, including the terminating zero
    pub const MAX_TASK_NAME_LEN: usize = 16;

    /// Default task stack size (in words)
    pub const DEFAULT_STACK_SIZE: StackSize = 1024;

    /// Minimum task stack size (in words)
    pub const MIN_STACK_SIZE: StackSize = 128;

    /// System tick frequency in Hz
    pub const TICK_RATE_HZ: u32 = 100;

    /// A higher-priority task becoming ready preempts the running one at once
    pub const USE_PREEMPTION: bool = true;

    /// Rotate equal-priority ready tasks on tick
    pub const USE_TIME_SLICING: bool = true;

    /// Ticks a task runs before yielding to an equal-priority peer
    pub const TIME_SLICE_TICKS: u32 = 1;

    /// Idle task yields to other idle-priority tasks every pass
    pub const IDLE_SHOULD_YIELD: bool = true;

    pub const CHECK_FOR_STACK_OVERFLOW: StackCheck = StackCheck::Canary;

    /// Words at the low end of every stack checked by `StackCheck::Canary`
    pub const STACK_CANARY_WORDS: usize = 4;

    /// Stack fill pattern, used for the high-water mark and the canary
    pub const STACK_FILL_WORD: usize = usize::from_ne_bytes([0xa5; core::mem::size_of::<usize>()]);

    /// Mutexes a single task may hold at once
    pub const MAX_HELD_MUTEXES: usize = 4;

    /// Call `Port::suppress_ticks` from the idle task when nothing is due
    pub const USE_TICKLESS_IDLE: bool = false;

    /// Minimum expected idle time before ticks are suppressed
    pub const EXPECTED_IDLE_TIME_BEFORE_SLEEP: u32 = 2;

    /// Software timer slots
    pub const MAX_TIMERS: usize = 8;

    /// Timer daemon priority
    pub const TIMER_TASK_PRIORITY: Priority = 2;

    /// Commands the timer daemon's queue holds before senders block
    pub const TIMER_QUEUE_LENGTH: usize = 10;

    /// Stack size (in words) the board gives the timer daemon
    pub const TIMER_TASK_STACK_DEPTH: StackSize = 512;

    /// Timeout meaning "wait forever"
    pub const MAX_DELAY: TickType = TickType::max();
}
