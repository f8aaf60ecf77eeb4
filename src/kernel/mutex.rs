// Mutexes and priority inheritance
//
// A holder's effective priority is recomputed from scratch whenever the set
// of tasks waiting on its mutexes changes: it is the larger of its base
// priority and the priority of the head waiter of every mutex it holds.
// Nothing is stacked or unwound, so nested and overlapping holds come out
// right in any release order.

use crate::kernel::list::{ListId, NodeStore};
use crate::kernel::port::Port;
use crate::kernel::queue::QueueKind;
use crate::kernel::scheduler::Scheduler;
use crate::kernel::task::event_node;
use crate::kernel::timeout::Wait;
use crate::kernel::types::*;
use core::task::Poll;
use log::trace;

impl<P: Port> Scheduler<P> {
    /// Take a recursive mutex. The holder may take it again.
    pub fn take_recursive(&mut self, id: QueueId, wait: &mut Wait) -> Result<Poll<()>> {
        self.mutex_take(id, wait, true)
    }

    /// Give a recursive mutex back once. It is released when every take has
    /// been matched.
    pub fn give_recursive(&mut self, id: QueueId) -> Result<()> {
        self.mutex_give(id, true)
    }

    /// Task currently holding a mutex
    pub fn mutex_holder(&self, id: QueueId) -> Result<Option<TaskId>> {
        let q = self.queues.get(id)?;
        if !q.kind.is_mutex() {
            return Err(RtosError::InvalidParameter);
        }
        Ok(q.holder)
    }

    pub(crate) fn mutex_take(
        &mut self,
        id: QueueId,
        wait: &mut Wait,
        recursive: bool,
    ) -> Result<Poll<()>> {
        let current = self.current_task.ok_or(RtosError::TaskNotFound)?;
        let q = self.queues.get_mut(id)?;
        if recursive != (q.kind == QueueKind::RecursiveMutex) {
            return Err(RtosError::InvalidParameter);
        }

        match q.holder {
            None => {
                q.holder = Some(current);
                q.recursion = 1;
                q.count = 0;
                self.tasks[current].push_held_mutex(id);
                trace!("{} takes {}", current, id);
                return Ok(Poll::Ready(()));
            }
            Some(holder) if holder == current => {
                assert!(recursive, "task {} takes mutex {} it already holds", current, id);
                q.recursion += 1;
                return Ok(Poll::Ready(()));
            }
            Some(_) => {}
        }

        let holder = q.holder;
        match wait.remaining(self.tick_count()) {
            None => {
                // Our wait may have been the one boosting the holder
                if let Some(holder) = holder {
                    self.recompute_priority(holder);
                }
                Err(if wait.is_immediate() {
                    RtosError::ResourceBusy
                } else {
                    RtosError::Timeout
                })
            }
            Some(ticks) => {
                self.place_on_event_list(ListId::RecvWaiters(id.index), ticks);
                if let Some(holder) = holder {
                    self.recompute_priority(holder);
                }
                Ok(Poll::Pending)
            }
        }
    }

    pub(crate) fn mutex_give(&mut self, id: QueueId, recursive: bool) -> Result<()> {
        let current = self.current_task.ok_or(RtosError::TaskNotFound)?;
        let q = self.queues.get_mut(id)?;
        if recursive != (q.kind == QueueKind::RecursiveMutex) {
            return Err(RtosError::InvalidParameter);
        }
        if q.holder != Some(current) {
            return Err(RtosError::NotOwner);
        }

        q.recursion -= 1;
        if q.recursion > 0 {
            return Ok(());
        }
        q.holder = None;
        q.count = 1;
        trace!("{} gives {}", current, id);

        self.tasks[current].drop_held_mutex(id);
        self.recompute_priority(current);
        self.wake_head(ListId::RecvWaiters(id.index));
        self.preempt_if_outranked();
        Ok(())
    }

    /// Highest priority among the head waiters of the mutexes `id` holds
    pub(crate) fn inherited_priority(&self, id: TaskId) -> Priority {
        self.tasks[id]
            .held()
            .filter_map(|m| self.queues.get(m).ok())
            .filter_map(|q| q.recv_waiters.head())
            .map(|node| self.tasks[self.tasks.owner(node)].priority)
            .max()
            .unwrap_or(config::IDLE_PRIORITY)
    }

    /// Bring a task's effective priority in line with its waiters, then
    /// follow the chain if the task itself waits on a mutex
    pub(crate) fn recompute_priority(&mut self, mut id: TaskId) {
        // A chain can't be longer than the number of tasks
        for _ in 0..config::MAX_TASKS {
            let Some(tcb) = self.tasks.get(id) else {
                return;
            };
            let effective = tcb.base_priority.max(self.inherited_priority(id));
            if effective == tcb.priority {
                return;
            }
            self.reprioritize(id, effective);

            match self.blocking_holder(id) {
                Some(next) => id = next,
                None => return,
            }
        }
    }

    /// Holder of the mutex `id` is waiting on, if it waits on one
    fn blocking_holder(&self, id: TaskId) -> Option<TaskId> {
        match self.tasks.node(event_node(id.index())).container()? {
            ListId::RecvWaiters(i) => {
                let q = self.queues.slot(i as usize)?;
                if q.kind.is_mutex() {
                    q.holder
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    /// A task stopped waiting on `list` without getting what it waited for
    pub(crate) fn waiter_left(&mut self, list: ListId) {
        if let ListId::RecvWaiters(i) = list {
            let holder = self
                .queues
                .slot(i as usize)
                .filter(|q| q.kind.is_mutex())
                .and_then(|q| q.holder);
            if let Some(holder) = holder {
                self.recompute_priority(holder);
            }
        }
    }
}
