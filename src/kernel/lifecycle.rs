// Task lifecycle: create, delete, suspend, resume, priorities, event waits,
// the idle step and state snapshots.

use crate::kernel::list::{ListId, NodeStore};
use crate::kernel::port::Port;
use crate::kernel::scheduler::Scheduler;
use crate::kernel::stack;
use crate::kernel::task::{event_node, event_value, state_node, TaskControlBlock};
use crate::kernel::types::*;
use log::{debug, trace};

/// One row of [`Scheduler::task_snapshot`]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TaskStatus {
    pub id: TaskId,
    pub name: [u8; config::MAX_TASK_NAME_LEN],
    pub state: TaskState,
    pub priority: Priority,
    pub base_priority: Priority,
    /// Words never touched at the bottom of the stack
    pub stack_high_water_mark: usize,
}

impl TaskStatus {
    pub fn name_str(&self) -> &str {
        let len = self.name.iter().position(|&c| c == 0).unwrap_or(self.name.len());
        core::str::from_utf8(&self.name[..len]).unwrap_or("<invalid>")
    }
}

impl<P: Port> Scheduler<P> {
    /// Create a task and make it ready
    ///
    /// The stack is caller-owned and lives as long as the kernel does. Fails
    /// with `OutOfMemory` when every task slot is taken.
    pub fn create_task(
        &mut self,
        name: &str,
        priority: Priority,
        entry: TaskEntry,
        parameter: usize,
        stack: &'static mut [usize],
    ) -> Result<TaskId> {
        let Some(slot) = self.tasks.free_slot() else {
            debug!("create '{}': no free task slot", name);
            return Err(RtosError::OutOfMemory);
        };

        stack::fill(stack);
        let stack_top = self.port.init_stack(stack, entry, parameter);
        let generation = self.tasks.generation(slot);
        let tcb = TaskControlBlock::new(name, priority, stack, stack_top, generation);
        let id = self.tasks.insert(slot, tcb);
        self.task_count += 1;
        self.add_to_ready_list(id);

        debug!("created task {} '{}' at priority {}", id, name, priority);

        if self.is_running() && self.preempt_for(id) {
            self.request_switch();
        }
        Ok(id)
    }

    /// Delete a task, `None` meaning the caller
    ///
    /// A task deleting itself keeps its slot until the idle task reclaims
    /// it, since its stack is still in use until the switch away. Any other
    /// task is freed at once. Deleting a task that holds a mutex is a caller
    /// contract violation: the mutex stays held by a dead handle.
    pub fn delete_task(&mut self, task: Option<TaskId>) -> Result<()> {
        let id = self.resolve(task)?;
        assert!(Some(id) != self.idle_task, "the idle task cannot be deleted");
        assert!(
            self.tasks[id].state != TaskState::Deleted,
            "task {} deleted twice",
            id
        );

        self.unlink_state(id);
        if let Some(list) = self.unlink_event(id) {
            self.waiter_left(list);
        }

        if Some(id) == self.current_task && self.is_running() {
            self.tasks[id].state = TaskState::Deleted;
            self.insert_state_end(ListId::Terminating, id);
            debug!("task {} '{}' deleted itself", id, self.tasks[id].name_str());
            self.reset_next_unblock();
            self.request_switch();
        } else {
            self.reclaim(id);
            self.reset_next_unblock();
        }
        Ok(())
    }

    /// Exit path for a task returning from its entry function
    pub fn exit_current(&mut self) {
        // The running task always resolves, so this cannot fail
        let _ = self.delete_task(None);
    }

    fn reclaim(&mut self, id: TaskId) {
        if let Some(tcb) = self.tasks.free(id) {
            self.task_count -= 1;
            debug!("reclaimed task {} '{}'", id, tcb.name_str());
        }
        if self.current_task == Some(id) {
            self.current_task = None;
        }
    }

    fn resolve(&self, task: Option<TaskId>) -> Result<TaskId> {
        match task.or(self.current_task) {
            Some(id) if self.tasks.get(id).is_some() => Ok(id),
            _ => Err(RtosError::TaskNotFound),
        }
    }

    /// Suspend a task, `None` meaning the caller
    ///
    /// Suspending a suspended task does nothing. A suspended task is also
    /// taken off any event it was waiting for.
    pub fn suspend_task(&mut self, task: Option<TaskId>) -> Result<()> {
        let id = self.resolve(task)?;
        if self.tasks[id].state == TaskState::Suspended {
            return Ok(());
        }
        if Some(id) == self.current_task && self.is_running() {
            assert!(
                !self.is_scheduler_suspended(),
                "running task suspended itself with the scheduler suspended"
            );
        }

        self.unlink_state(id);
        if let Some(list) = self.unlink_event(id) {
            self.waiter_left(list);
        }
        self.tasks[id].state = TaskState::Suspended;
        self.insert_state_end(ListId::Suspended, id);
        self.reset_next_unblock();
        trace!("suspend {}", id);

        if Some(id) == self.current_task && self.is_running() {
            self.request_switch();
        }
        Ok(())
    }

    /// Make a suspended task ready again. Any other task is left as it is.
    pub fn resume_task(&mut self, id: TaskId) -> Result<()> {
        let tcb = self.tasks.get(id).ok_or(RtosError::TaskNotFound)?;
        if tcb.state != TaskState::Suspended || Some(id) == self.current_task {
            return Ok(());
        }
        self.unlink_state(id);
        self.add_to_ready_list(id);
        trace!("resume {}", id);
        if self.preempt_for(id) {
            self.request_switch();
        }
        Ok(())
    }

    /// Interrupt-side resume
    ///
    /// Returns whether the resumed task outranks the interrupted one, in
    /// which case the handler should request a switch on exit.
    pub fn resume_from_isr(&mut self, id: TaskId) -> Result<bool> {
        let tcb = self.tasks.get(id).ok_or(RtosError::TaskNotFound)?;
        if tcb.state != TaskState::Suspended {
            return Ok(false);
        }
        if self.is_scheduler_suspended() {
            // Lists stay untouched until resume_all
            if !self.tasks.node(event_node(id.index())).is_in_list() {
                self.insert_event_end(ListId::PendingReady, id);
            }
            return Ok(false);
        }
        self.unlink_state(id);
        self.add_to_ready_list(id);
        Ok(self.preempt_for(id))
    }

    // ------------------------------------------------------------------
    // Event waits
    // ------------------------------------------------------------------

    /// Block the running task on an event wait list
    ///
    /// The task is queued by priority and also put on a delayed list unless
    /// `ticks` is `MAX_DELAY`.
    pub(crate) fn place_on_event_list(&mut self, list: ListId, ticks: TickType) {
        self.assert_may_block();
        let current = self.current_task.expect("blocking call with no running task");
        self.insert_event_sorted(list, current);
        self.add_current_to_delayed_list(ticks, true);
        trace!("{} blocks on {:?} for {} ticks", current, list, ticks.0);
        self.request_switch();
    }

    /// Ready the task at the head of an event wait list
    ///
    /// Returns whether it outranks the running task. Callers outside
    /// interrupts request the switch themselves.
    pub(crate) fn wake_event_waiter(&mut self, task: TaskId) -> bool {
        self.unlink_event(task);
        if self.is_scheduler_suspended() {
            self.insert_event_end(ListId::PendingReady, task);
            return false;
        }
        self.unlink_state(task);
        self.add_to_ready_list(task);
        self.reset_next_unblock();
        trace!("wake {}", task);
        self.preempt_for(task)
    }

    // ------------------------------------------------------------------
    // Priorities
    // ------------------------------------------------------------------

    /// Effective priority, including any inherited boost
    pub fn priority(&self, task: Option<TaskId>) -> Result<Priority> {
        let id = self.resolve(task)?;
        Ok(self.tasks[id].priority)
    }

    pub fn base_priority(&self, task: Option<TaskId>) -> Result<Priority> {
        let id = self.resolve(task)?;
        Ok(self.tasks[id].base_priority)
    }

    /// Change a task's assigned priority
    ///
    /// While the task holds a boost above the new value the boost stays in
    /// force until the mutex is released.
    pub fn set_priority(&mut self, task: Option<TaskId>, priority: Priority) -> Result<()> {
        assert!(
            priority < config::MAX_PRIORITIES,
            "Priority {} exceeds maximum allowed priority {}",
            priority,
            config::MAX_PRIORITIES - 1
        );
        let id = self.resolve(task)?;
        self.tasks[id].base_priority = priority;
        self.recompute_priority(id);
        self.preempt_if_outranked();
        Ok(())
    }

    /// Apply a new effective priority, moving the task between ready lists
    /// and re-sorting its event wait
    pub(crate) fn reprioritize(&mut self, id: TaskId, priority: Priority) {
        let tcb = &self.tasks[id];
        if tcb.priority == priority {
            return;
        }
        trace!("{} priority {} -> {}", id, tcb.priority, priority);

        let on_ready_list = matches!(
            self.tasks.node(state_node(id.index())).container(),
            Some(ListId::Ready(_))
        );
        let waiting_on = self.tasks.node(event_node(id.index())).container();
        let was_running = tcb.state == TaskState::Running;

        if on_ready_list {
            self.unlink_state(id);
        }
        if let Some(list @ (ListId::SendWaiters(_) | ListId::RecvWaiters(_))) = waiting_on {
            self.unlink_event(id);
            self.tasks[id].event_list_item.set_value(event_value(priority));
            self.tasks[id].priority = priority;
            self.insert_event_sorted(list, id);
        } else {
            self.tasks[id].event_list_item.set_value(event_value(priority));
            self.tasks[id].priority = priority;
        }
        if on_ready_list {
            self.add_to_ready_list(id);
            if was_running {
                self.tasks[id].state = TaskState::Running;
            }
        }
    }

    // ------------------------------------------------------------------
    // Idle
    // ------------------------------------------------------------------

    /// One pass of the idle task's loop
    pub fn idle_step(&mut self) {
        while let Some(head) = self.lists.terminating.head() {
            let id = self.tasks.owner(head);
            self.unlink_state(id);
            self.reclaim(id);
        }

        if let Some(hook) = self.hooks.idle {
            hook();
        }

        if self.port.tickless_idle() {
            let expected = self.expected_idle_time();
            if expected.0 >= config::EXPECTED_IDLE_TIME_BEFORE_SLEEP {
                let slept = self.port.suppress_ticks(expected);
                if slept != TickType::zero() {
                    self.step_tick(slept);
                }
            }
        }

        if config::IDLE_SHOULD_YIELD && self.ready_len(config::IDLE_PRIORITY) > 1 {
            self.yield_now();
        }
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub fn task_state(&self, id: TaskId) -> Result<TaskState> {
        self.tasks
            .get(id)
            .map(|t| t.state)
            .ok_or(RtosError::TaskNotFound)
    }

    pub fn task_name(&self, id: TaskId) -> Result<&str> {
        self.tasks
            .get(id)
            .map(TaskControlBlock::name_str)
            .ok_or(RtosError::TaskNotFound)
    }

    pub fn stack_high_water_mark(&self, task: Option<TaskId>) -> Result<usize> {
        let id = self.resolve(task)?;
        Ok(stack::high_water_mark(&self.tasks[id]))
    }

    /// Fill `out` with the state of every task, list by list
    ///
    /// Walks each state list with its traversal cursor. Returns the number
    /// of rows written; tasks that do not fit are left out.
    pub fn task_snapshot(&mut self, out: &mut [TaskStatus]) -> usize {
        let mut written = 0;
        for priority in (0..config::MAX_PRIORITIES).rev() {
            written += self.snapshot_list(ListId::Ready(priority as u8), &mut out[written..]);
        }
        for epoch in 0..2 {
            written += self.snapshot_list(ListId::Delayed(epoch), &mut out[written..]);
        }
        for id in [ListId::BlockedForever, ListId::Suspended, ListId::Terminating] {
            written += self.snapshot_list(id, &mut out[written..]);
        }
        written
    }

    fn snapshot_list(&mut self, id: ListId, out: &mut [TaskStatus]) -> usize {
        let Scheduler { tasks, lists, .. } = self;
        let list = match id {
            ListId::Ready(p) => &mut lists.ready[p as usize],
            ListId::Delayed(e) => &mut lists.delayed[e as usize],
            ListId::BlockedForever => &mut lists.blocked_forever,
            ListId::Suspended => &mut lists.suspended,
            _ => &mut lists.terminating,
        };

        let count = list.len().min(out.len());
        for row in out.iter_mut().take(count) {
            let Some(node) = list.next_cursor(&*tasks) else {
                break;
            };
            let id = tasks.owner(node);
            let tcb = &tasks[id];
            *row = TaskStatus {
                id,
                name: tcb.name,
                state: tcb.state,
                priority: tcb.priority,
                base_priority: tcb.base_priority,
                stack_high_water_mark: stack::high_water_mark(tcb),
            };
        }
        count
    }
}
