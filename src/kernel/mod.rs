// Kernel module - Core RTOS functionality
pub mod critical;
pub mod lifecycle;
pub mod list;
pub mod mutex;
pub mod port;
pub mod queue;
pub mod scheduler;
pub mod stack;
pub mod task;
pub mod timeout;
pub mod timer;
pub mod types;

// Re-export commonly used items
pub use lifecycle::TaskStatus;
pub use list::{List, ListId, ListNode};
pub use port::{InterruptMask, Port};
pub use queue::QueueKind;
pub use scheduler::{Hooks, Scheduler};
pub use task::TaskControlBlock;
pub use timeout::Wait;
pub use timer::{TimerCallback, TIMER_QUEUE_BYTES};
pub use types::{
    config, Priority, QueueId, Result, RtosError, StackCheck, TaskEntry, TaskId, TaskState,
    TickType, TimerId,
};
