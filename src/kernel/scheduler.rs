use crate::kernel::list::{List, ListId, NodeRef, NodeStore};
use crate::kernel::port::Port;
use crate::kernel::queue::QueueTable;
use crate::kernel::stack;
use crate::kernel::task::{event_node, state_node, TaskTable};
use crate::kernel::timer::TimerTable;
use crate::kernel::types::*;
use log::{error, trace};

/// Every list owned by the scheduler itself (queue wait lists live in the
/// queue control blocks)
pub(crate) struct StateLists {
    /// Ready lists - one per priority level
    /// Index 0 = priority 0 (idle task)
    pub(crate) ready: [List; config::MAX_PRIORITIES],
    /// Wake-time ordered. `delayed[current_delayed]` holds wake times in the
    /// current counter epoch, the other one those past the wrap point.
    pub(crate) delayed: [List; 2],
    pub(crate) pending_ready: List,
    pub(crate) suspended: List,
    pub(crate) blocked_forever: List,
    pub(crate) terminating: List,
}

impl StateLists {
    const fn new() -> Self {
        // No const loops over non-Copy arrays, so spell the ready lists out
        macro_rules! ready {
            ($($p:literal)*) => { [$(List::new(ListId::Ready($p)),)*] };
        }
        StateLists {
            ready: ready!(0 1 2 3 4 5 6 7 8 9 10 11 12 13 14),
            delayed: [List::new(ListId::Delayed(0)), List::new(ListId::Delayed(1))],
            pending_ready: List::new(ListId::PendingReady),
            suspended: List::new(ListId::Suspended),
            blocked_forever: List::new(ListId::BlockedForever),
            terminating: List::new(ListId::Terminating),
        }
    }

    fn get_mut(&mut self, id: ListId) -> Option<&mut List> {
        Some(match id {
            ListId::Ready(p) => &mut self.ready[p as usize],
            ListId::Delayed(i) => &mut self.delayed[i as usize],
            ListId::PendingReady => &mut self.pending_ready,
            ListId::Suspended => &mut self.suspended,
            ListId::BlockedForever => &mut self.blocked_forever,
            ListId::Terminating => &mut self.terminating,
            ListId::SendWaiters(_) | ListId::RecvWaiters(_) => return None,
        })
    }
}

/// Application hooks, all optional
#[derive(Copy, Clone, Default)]
pub struct Hooks {
    /// Called on every pass of the idle task
    pub idle: Option<fn()>,
    /// Called from every tick interrupt
    pub tick: Option<fn()>,
    /// Called with the offending task before the kernel halts
    pub stack_overflow: Option<fn(TaskId, &str)>,
}

pub struct Scheduler<P: Port> {
    pub(crate) tasks: TaskTable,
    pub(crate) lists: StateLists,
    pub(crate) queues: QueueTable,
    pub(crate) timers: TimerTable,

    /// Which of the two delayed lists holds the current epoch
    current_delayed: usize,

    /// Currently running task (single-core)
    pub(crate) current_task: Option<TaskId>,
    pub(crate) idle_task: Option<TaskId>,

    /// Highest priority level that has ready tasks
    /// Optimization: Don't scan all lists, start from here
    top_ready_priority: Priority,

    /// Total number of tasks in the system, including ones awaiting reclaim
    pub(crate) task_count: usize,

    /// Current system tick count (incremented by timer interrupt)
    tick_count: TickType,
    /// Earliest wake time in the current delayed list
    next_unblock: TickType,
    overflow_count: u32,

    /// Is the scheduler running?
    scheduler_running: bool,

    /// Scheduler suspension depth
    /// 0 = not suspended, >0 = suspended
    /// Suspensions nest - must call resume_all same number of times
    suspend_depth: usize,
    /// Ticks that arrived while suspended, replayed on resume
    pended_ticks: u32,
    /// A switch is wanted but has not happened yet
    yield_pending: bool,

    pub(crate) hooks: Hooks,
    pub(crate) port: P,
}

impl<P: Port> Scheduler<P> {
    pub const fn new(port: P) -> Self {
        Scheduler {
            tasks: TaskTable::new(),
            lists: StateLists::new(),
            queues: QueueTable::new(),
            timers: TimerTable::new(),
            current_delayed: 0,
            current_task: None,
            idle_task: None,
            top_ready_priority: config::IDLE_PRIORITY,
            task_count: 0,
            tick_count: TickType::zero(),
            next_unblock: TickType::max(),
            overflow_count: 0,
            scheduler_running: false,
            suspend_depth: 0,
            pended_ticks: 0,
            yield_pending: false,
            hooks: Hooks {
                idle: None,
                tick: None,
                stack_overflow: None,
            },
            port,
        }
    }

    // ------------------------------------------------------------------
    // List plumbing
    // ------------------------------------------------------------------

    /// Unlink a node from whatever list it is in
    ///
    /// Returns the list it was in and how many entries that list has left.
    fn unlink(&mut self, node: NodeRef) -> Option<(ListId, usize)> {
        let id = self.tasks.node(node).container()?;
        let Scheduler {
            tasks,
            lists,
            queues,
            ..
        } = self;
        let list = match lists.get_mut(id) {
            Some(list) => list,
            None => queues.wait_list_mut(id),
        };
        Some((id, list.remove(tasks, node)))
    }

    /// Take a task off its ready/delayed/suspended list
    pub(crate) fn unlink_state(&mut self, task: TaskId) {
        if let Some((ListId::Ready(p), 0)) = self.unlink(state_node(task.index())) {
            if p as usize == self.top_ready_priority {
                self.update_top_ready_priority();
            }
        }
    }

    /// Take a task off the event list it waits on, if any
    pub(crate) fn unlink_event(&mut self, task: TaskId) -> Option<ListId> {
        self.unlink(event_node(task.index())).map(|(id, _)| id)
    }

    pub(crate) fn insert_state_end(&mut self, list: ListId, task: TaskId) {
        let Scheduler { tasks, lists, .. } = self;
        if let Some(list) = lists.get_mut(list) {
            list.insert_end(tasks, state_node(task.index()));
        }
    }

    pub(crate) fn insert_event_end(&mut self, list: ListId, task: TaskId) {
        let Scheduler { tasks, lists, .. } = self;
        if let Some(list) = lists.get_mut(list) {
            list.insert_end(tasks, event_node(task.index()));
        }
    }

    pub(crate) fn insert_event_sorted(&mut self, list: ListId, task: TaskId) {
        let Scheduler {
            tasks,
            lists,
            queues,
            ..
        } = self;
        let list = match lists.get_mut(list) {
            Some(list) => list,
            None => queues.wait_list_mut(list),
        };
        list.insert_sorted(tasks, event_node(task.index()));
    }

    pub(crate) fn add_to_ready_list(&mut self, task: TaskId) {
        let tcb = &mut self.tasks[task];
        tcb.state = TaskState::Ready;
        let priority = tcb.priority;

        let Scheduler { tasks, lists, .. } = self;
        lists.ready[priority].insert_end(tasks, state_node(task.index()));
        if priority > self.top_ready_priority {
            self.top_ready_priority = priority;
        }
    }

    pub fn update_top_ready_priority(&mut self) {
        let mut priority = self.top_ready_priority;

        while priority > config::IDLE_PRIORITY {
            if !self.lists.ready[priority].is_empty() {
                self.top_ready_priority = priority;
                return;
            }
            priority -= 1;
        }
        self.top_ready_priority = config::IDLE_PRIORITY;
    }

    /// Highest priority with a ready task
    pub(crate) fn highest_ready(&self) -> Option<TaskId> {
        let mut priority = self.top_ready_priority;
        loop {
            if let Some(head) = self.lists.ready[priority].head() {
                return Some(self.tasks.owner(head));
            }
            if priority == config::IDLE_PRIORITY {
                return None;
            }
            priority -= 1;
        }
    }

    // ------------------------------------------------------------------
    // Task selection and switching
    // ------------------------------------------------------------------

    /// Select the highest priority ready task and make it current
    ///
    /// Must be called with kernel-aware interrupts masked.
    pub fn select_next_task(&mut self) -> TaskId {
        // Set previous running task back to Ready state
        if let Some(prev) = self.current_task {
            if let Some(tcb) = self.tasks.get_mut(prev) {
                if tcb.state == TaskState::Running {
                    tcb.state = TaskState::Ready;
                }
            }
        }

        let next = match self.highest_ready() {
            Some(next) => next,
            None => panic!("no ready task: the idle task must always be ready"),
        };
        let tcb = &mut self.tasks[next];
        if self.current_task != Some(next) {
            tcb.slice_remaining = config::TIME_SLICE_TICKS;
        }
        tcb.state = TaskState::Running;
        self.current_task = Some(next);
        next
    }

    /// Save the interrupted task's stack pointer and pick the next task
    ///
    /// Called by the port on interrupt exit when a switch was requested.
    /// Returns the stack pointer to restore, which belongs to the task that
    /// is current afterwards.
    pub fn switch_context(&mut self, saved_sp: usize) -> usize {
        if self.suspend_depth > 0 {
            // Can't switch now; remember to do it on resume_all
            self.yield_pending = true;
            return saved_sp;
        }
        self.yield_pending = false;

        let prev = self.current_task;
        if let Some(prev) = prev {
            if let Some(tcb) = self.tasks.get_mut(prev) {
                tcb.stack_top = saved_sp;
                if stack::overflowed(tcb, saved_sp) {
                    self.stack_overflow(prev);
                }
            }
        }

        let next = self.select_next_task();
        if prev != Some(next) {
            trace!(
                "switch {} -> {} '{}'",
                prev.map_or(-1, |p| p.index() as i32),
                next,
                self.tasks[next].name_str()
            );
        }
        self.tasks[next].stack_top
    }

    fn stack_overflow(&self, task: TaskId) -> ! {
        let name = self.tasks[task].name_str();
        error!("stack overflow in task {} '{}'", task, name);
        if let Some(hook) = self.hooks.stack_overflow {
            hook(task, name);
        }
        panic!("stack overflow in task '{}'", name);
    }

    /// Request a context switch at the next opportunity
    pub fn request_switch(&mut self) {
        self.yield_pending = true;
        if self.scheduler_running && self.suspend_depth == 0 {
            self.port.request_switch();
        }
    }

    /// Has a switch been requested that has not happened yet?
    pub fn switch_pending(&self) -> bool {
        self.yield_pending
    }

    /// Switch if `task` just became ready and outranks the running task
    pub(crate) fn preempt_for(&self, task: TaskId) -> bool {
        let Some(current) = self.current_task else {
            return false;
        };
        config::USE_PREEMPTION && self.tasks[task].priority > self.tasks[current].priority
    }

    /// Switch if the running task no longer has the highest priority
    pub(crate) fn preempt_if_outranked(&mut self) {
        if self.outranked() {
            self.request_switch();
        }
    }

    fn outranked(&self) -> bool {
        let (Some(current), Some(top)) = (self.current_task, self.highest_ready()) else {
            return false;
        };
        match self.tasks.get(current) {
            Some(tcb) if tcb.state == TaskState::Running => self.tasks[top].priority > tcb.priority,
            _ => true,
        }
    }

    /// Yield the current task
    ///
    /// Moves it to the end of its ready list and requests a switch if that
    /// puts a different task at the front. Returns whether a switch was
    /// requested.
    pub fn yield_now(&mut self) -> bool {
        let Some(current) = self.current_task else {
            return false;
        };
        if self.tasks[current].state == TaskState::Running {
            self.rotate_to_tail(current);
        }
        if self.highest_ready() != Some(current) {
            self.request_switch();
            true
        } else {
            false
        }
    }

    /// Round-robin: put a ready task behind its equal-priority peers
    fn rotate_to_tail(&mut self, task: TaskId) {
        let priority = self.tasks[task].priority;
        let Scheduler { tasks, lists, .. } = self;
        let node = state_node(task.index());
        lists.ready[priority].remove(tasks, node);
        lists.ready[priority].insert_end(tasks, node);
    }

    // ------------------------------------------------------------------
    // Time
    // ------------------------------------------------------------------

    /// Advance the tick count by one
    ///
    /// Called once per timer interrupt. Moves tasks whose wake time has come
    /// to their ready lists and rotates the running task's level when its
    /// time slice runs out. Returns whether a context switch is needed.
    pub fn tick_advance(&mut self) -> bool {
        if let Some(hook) = self.hooks.tick {
            hook();
        }
        if self.suspend_depth > 0 {
            self.pended_ticks += 1;
            return false;
        }
        self.increment_tick()
    }

    fn increment_tick(&mut self) -> bool {
        let mut switch_required = false;
        let tick = self.tick_count.wrapping_add(TickType::new(1));
        self.tick_count = tick;
        if tick == TickType::zero() {
            self.switch_delayed_lists();
        }

        if tick >= self.next_unblock {
            loop {
                let Some(head) = self.lists.delayed[self.current_delayed].head() else {
                    self.next_unblock = TickType::max();
                    break;
                };
                let wake = TickType::new(self.tasks.node(head).value());
                if tick < wake {
                    self.next_unblock = wake;
                    break;
                }

                let task = self.tasks.owner(head);
                self.unlink_state(task);
                // A timeout beats an event that has not been delivered yet
                if let Some(list) = self.unlink_event(task) {
                    self.waiter_left(list);
                }
                trace!("tick {}: wake {}", tick.0, task);
                self.add_to_ready_list(task);
                if self.preempt_for(task) {
                    switch_required = true;
                }
            }
        }

        if config::USE_TIME_SLICING {
            if let Some(current) = self.current_task {
                let tcb = &mut self.tasks[current];
                if tcb.state == TaskState::Running {
                    tcb.slice_remaining = tcb.slice_remaining.saturating_sub(1);
                    if tcb.slice_remaining == 0 {
                        tcb.slice_remaining = config::TIME_SLICE_TICKS;
                        let priority = tcb.priority;
                        if self.lists.ready[priority].len() > 1 {
                            self.rotate_to_tail(current);
                            switch_required = true;
                        }
                    }
                }
            }
        }

        // A holder losing its boost to a timed-out waiter may now be outranked
        if self.yield_pending || self.outranked() {
            switch_required = true;
        }
        switch_required
    }

    fn switch_delayed_lists(&mut self) {
        assert!(
            self.lists.delayed[self.current_delayed].is_empty(),
            "delayed list not drained before tick wrap"
        );
        self.current_delayed ^= 1;
        self.overflow_count = self.overflow_count.wrapping_add(1);
        self.reset_next_unblock();
    }

    pub(crate) fn reset_next_unblock(&mut self) {
        self.next_unblock = match self.lists.delayed[self.current_delayed].head() {
            Some(head) => TickType::new(self.tasks.node(head).value()),
            None => TickType::max(),
        };
    }

    /// Move the running task from its ready list to a delayed list
    ///
    /// With `can_block_indefinitely`, a `MAX_DELAY` wait parks the task
    /// with no wake time at all.
    pub(crate) fn add_current_to_delayed_list(
        &mut self,
        ticks: TickType,
        can_block_indefinitely: bool,
    ) {
        let current = self.current_task.expect("no running task to delay");
        self.unlink_state(current);
        self.tasks[current].state = TaskState::Blocked;

        if ticks == config::MAX_DELAY && can_block_indefinitely {
            self.insert_state_end(ListId::BlockedForever, current);
            return;
        }

        let node = state_node(current.index());
        let wake = self.tick_count.wrapping_add(ticks);
        self.tasks.node_mut(node).set_value(wake.0);

        // A wake time that wrapped belongs to the next epoch
        let wrapped = wake < self.tick_count;
        let epoch = if wrapped {
            self.current_delayed ^ 1
        } else {
            self.current_delayed
        };
        let Scheduler { tasks, lists, .. } = self;
        lists.delayed[epoch].insert_sorted(tasks, node);

        if !wrapped && wake < self.next_unblock {
            self.next_unblock = wake;
        }
    }

    /// Block the running task for `ticks` ticks
    ///
    /// A zero delay is a plain yield.
    pub fn delay(&mut self, ticks: TickType) {
        self.assert_may_block();
        if ticks == TickType::zero() {
            self.yield_now();
            return;
        }
        self.add_current_to_delayed_list(ticks, false);
        self.request_switch();
    }

    /// Block until `previous_wake + period`, then advance `previous_wake`
    ///
    /// Gives a fixed cadence regardless of how long the task ran. Returns
    /// whether the task actually blocked (it does not when the wake time
    /// has already passed).
    pub fn delay_until(&mut self, previous_wake: &mut TickType, period: TickType) -> bool {
        self.assert_may_block();
        let now = self.tick_count;
        let wake = previous_wake.wrapping_add(period);

        let should_delay = if now < *previous_wake {
            // The tick count overflowed since the last wake
            wake < *previous_wake && wake > now
        } else {
            wake < *previous_wake || wake > now
        };
        *previous_wake = wake;

        if should_delay {
            self.add_current_to_delayed_list(wake.elapsed_since(now), false);
            self.request_switch();
        } else {
            self.yield_now();
        }
        should_delay
    }

    pub(crate) fn assert_may_block(&self) {
        assert!(!self.port.in_isr(), "blocking call from interrupt context");
        assert!(self.suspend_depth == 0, "blocking call with the scheduler suspended");
        assert!(self.current_task.is_some(), "blocking call with no running task");
    }

    // ------------------------------------------------------------------
    // Scheduler suspension
    // ------------------------------------------------------------------

    /// Suspend the scheduler
    ///
    /// Interrupts stay enabled but no context switch happens until the
    /// matching `resume_all`. Suspensions nest.
    pub fn suspend_all(&mut self) {
        self.suspend_depth += 1;
    }

    /// Resume the scheduler
    ///
    /// Readies everything that was unblocked from interrupts meanwhile and
    /// replays the ticks that arrived. Returns whether a switch was
    /// requested as a result.
    pub fn resume_all(&mut self) -> bool {
        assert!(self.suspend_depth > 0, "resume_all without suspend_all");
        self.suspend_depth -= 1;
        if self.suspend_depth > 0 || !self.scheduler_running {
            return false;
        }

        let mut moved = false;
        while let Some(head) = self.lists.pending_ready.head() {
            let task = self.tasks.owner(head);
            self.unlink_event(task);
            self.unlink_state(task);
            self.add_to_ready_list(task);
            if self.preempt_for(task) {
                self.yield_pending = true;
            }
            moved = true;
        }
        if moved {
            self.reset_next_unblock();
        }

        let pended = core::mem::take(&mut self.pended_ticks);
        for _ in 0..pended {
            if self.increment_tick() {
                self.yield_pending = true;
            }
        }

        if self.yield_pending {
            self.port.request_switch();
            true
        } else {
            false
        }
    }

    pub fn is_scheduler_suspended(&self) -> bool {
        self.suspend_depth > 0
    }

    // ------------------------------------------------------------------
    // Start / stop
    // ------------------------------------------------------------------

    /// Create the idle task and pick the first task to run
    ///
    /// Returns the stack pointer the port restores to enter the first task.
    pub fn start(&mut self, idle_entry: TaskEntry, idle_stack: &'static mut [usize]) -> Result<usize> {
        assert!(!self.scheduler_running, "scheduler started twice");
        let idle = self.create_task("IDLE", config::IDLE_PRIORITY, idle_entry, 0, idle_stack)?;
        self.idle_task = Some(idle);
        self.tick_count = TickType::zero();
        self.reset_next_unblock();
        self.scheduler_running = true;

        let first = self.select_next_task();
        log::debug!(
            "scheduler started, {} tasks, first '{}'",
            self.task_count,
            self.tasks[first].name_str()
        );
        Ok(self.tasks[first].stack_top)
    }

    /// Stop scheduling. Ports with nothing to return to treat this as a no-op.
    pub fn end_scheduler(&mut self) {
        self.scheduler_running = false;
        log::debug!("scheduler stopped at tick {}", self.tick_count.0);
    }

    pub fn is_running(&self) -> bool {
        self.scheduler_running
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub fn current_task(&self) -> Option<TaskId> {
        self.current_task
    }

    pub fn idle_task(&self) -> Option<TaskId> {
        self.idle_task
    }

    pub fn tick_count(&self) -> TickType {
        self.tick_count
    }

    /// Same as `tick_count`; ISR callers already run masked
    pub fn tick_count_from_isr(&self) -> TickType {
        self.tick_count
    }

    /// Number of times the tick counter has wrapped
    pub fn overflow_count(&self) -> u32 {
        self.overflow_count
    }

    pub fn task_count(&self) -> usize {
        self.task_count
    }

    pub fn top_ready_priority(&self) -> Priority {
        self.top_ready_priority
    }

    pub fn ready_len(&self, priority: Priority) -> usize {
        self.lists.ready[priority].len()
    }

    /// Tasks waiting on a wake time, in both epochs
    pub fn delayed_len(&self) -> usize {
        self.lists.delayed[0].len() + self.lists.delayed[1].len()
    }

    pub fn suspended_len(&self) -> usize {
        self.lists.suspended.len()
    }

    /// Deleted tasks the idle task has not reclaimed yet
    pub fn terminating_len(&self) -> usize {
        self.lists.terminating.len()
    }

    pub fn port(&self) -> &P {
        &self.port
    }

    pub fn port_mut(&mut self) -> &mut P {
        &mut self.port
    }

    pub fn set_hooks(&mut self, hooks: Hooks) {
        self.hooks = hooks;
    }

    /// Ticks until the next task is due, when only idle-priority work exists
    pub fn expected_idle_time(&self) -> TickType {
        let Some(current) = self.current_task else {
            return TickType::zero();
        };
        if self.tasks[current].priority > config::IDLE_PRIORITY
            || self.lists.ready[config::IDLE_PRIORITY].len() > 1
        {
            TickType::zero()
        } else {
            self.next_unblock.elapsed_since(self.tick_count)
        }
    }

    /// Account for ticks that passed while the tick interrupt was suppressed
    ///
    /// The last of them goes through the normal tick path, so a task due on
    /// that tick wakes on it.
    pub fn step_tick(&mut self, ticks: TickType) {
        let budget = self.next_unblock.elapsed_since(self.tick_count);
        assert!(ticks <= budget, "stepped past the next wake time");
        if ticks == TickType::zero() {
            return;
        }
        let before = self.tick_count;
        self.tick_count = before.wrapping_add(TickType::new(ticks.0 - 1));
        if self.tick_count < before {
            self.switch_delayed_lists();
        }
        if self.increment_tick() {
            self.request_switch();
        }
    }
}
