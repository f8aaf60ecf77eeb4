// Queues, and the semaphores built on them
//
// A queue is a ring buffer of fixed-size items in caller-provided storage
// plus two priority-ordered wait lists. Semaphores are queues whose items
// are zero bytes long: only the count moves. Mutexes share the control
// block but take their own path through `mutex.rs`.

use crate::kernel::list::{List, ListId};
use crate::kernel::port::Port;
use crate::kernel::scheduler::Scheduler;
use crate::kernel::timeout::Wait;
use crate::kernel::types::*;
use core::task::Poll;
use log::debug;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum QueueKind {
    Queue,
    BinarySemaphore,
    CountingSemaphore,
    Mutex,
    RecursiveMutex,
}

impl QueueKind {
    pub fn is_mutex(self) -> bool {
        matches!(self, QueueKind::Mutex | QueueKind::RecursiveMutex)
    }
}

/// Where a sent item goes
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Position {
    Back,
    Front,
    /// Replace the single item of a length-one queue
    Overwrite,
}

pub(crate) struct QueueCb {
    pub(crate) kind: QueueKind,
    storage: &'static mut [u8],
    item_size: usize,
    capacity: usize,
    pub(crate) count: usize,
    /// Slot the next receive reads from
    read_from: usize,
    /// Tasks blocked because the queue was full, highest priority first
    pub(crate) send_waiters: List,
    /// Tasks blocked because the queue was empty (or the mutex was taken)
    pub(crate) recv_waiters: List,
    pub(crate) holder: Option<TaskId>,
    pub(crate) recursion: u32,
    generation: u16,
}

impl QueueCb {
    fn new(
        slot: usize,
        kind: QueueKind,
        storage: &'static mut [u8],
        item_size: usize,
        capacity: usize,
        count: usize,
        generation: u16,
    ) -> Self {
        QueueCb {
            kind,
            storage,
            item_size,
            capacity,
            count,
            read_from: 0,
            send_waiters: List::new(ListId::SendWaiters(slot as u16)),
            recv_waiters: List::new(ListId::RecvWaiters(slot as u16)),
            holder: None,
            recursion: 0,
            generation,
        }
    }

    fn item(&mut self, slot: usize) -> &mut [u8] {
        let start = slot * self.item_size;
        &mut self.storage[start..start + self.item_size]
    }

    fn copy_in(&mut self, item: &[u8], position: Position) {
        match position {
            Position::Back => {
                let slot = (self.read_from + self.count) % self.capacity;
                self.item(slot).copy_from_slice(item);
                self.count += 1;
            }
            Position::Front => {
                self.read_from = (self.read_from + self.capacity - 1) % self.capacity;
                let slot = self.read_from;
                self.item(slot).copy_from_slice(item);
                self.count += 1;
            }
            Position::Overwrite => {
                let slot = self.read_from;
                self.item(slot).copy_from_slice(item);
                self.count = 1;
            }
        }
    }

    fn copy_out(&mut self, out: &mut [u8], consume: bool) {
        let slot = self.read_from;
        out.copy_from_slice(self.item(slot));
        if consume {
            self.read_from = (self.read_from + 1) % self.capacity;
            self.count -= 1;
        }
    }

    fn is_full(&self) -> bool {
        self.count >= self.capacity
    }
}

/// Fixed arena of queue slots, generation-checked like the task table
pub struct QueueTable {
    slots: [Option<QueueCb>; config::MAX_QUEUES],
    generations: [u16; config::MAX_QUEUES],
}

impl QueueTable {
    pub const fn new() -> Self {
        const EMPTY: Option<QueueCb> = None;
        QueueTable {
            slots: [EMPTY; config::MAX_QUEUES],
            generations: [0; config::MAX_QUEUES],
        }
    }

    pub(crate) fn get(&self, id: QueueId) -> Result<&QueueCb> {
        self.slots
            .get(id.index())
            .and_then(Option::as_ref)
            .filter(|q| q.generation == id.generation)
            .ok_or(RtosError::QueueNotFound)
    }

    pub(crate) fn get_mut(&mut self, id: QueueId) -> Result<&mut QueueCb> {
        self.slots
            .get_mut(id.index())
            .and_then(Option::as_mut)
            .filter(|q| q.generation == id.generation)
            .ok_or(RtosError::QueueNotFound)
    }

    pub(crate) fn slot(&self, index: usize) -> Option<&QueueCb> {
        self.slots.get(index)?.as_ref()
    }

    /// The wait list a queue-side `ListId` names
    pub(crate) fn wait_list_mut(&mut self, id: ListId) -> &mut List {
        let (ListId::SendWaiters(i) | ListId::RecvWaiters(i)) = id else {
            panic!("{:?} is not a queue wait list", id);
        };
        let Some(q) = self.slots[i as usize].as_mut() else {
            panic!("task waiting on a deleted queue");
        };
        if matches!(id, ListId::SendWaiters(_)) {
            &mut q.send_waiters
        } else {
            &mut q.recv_waiters
        }
    }

    pub(crate) fn wait_list(&self, id: ListId) -> Option<&List> {
        match id {
            ListId::SendWaiters(i) => Some(&self.slot(i as usize)?.send_waiters),
            ListId::RecvWaiters(i) => Some(&self.slot(i as usize)?.recv_waiters),
            _ => None,
        }
    }

    fn insert(
        &mut self,
        kind: QueueKind,
        storage: &'static mut [u8],
        item_size: usize,
        capacity: usize,
        count: usize,
    ) -> Result<QueueId> {
        let slot = self
            .slots
            .iter()
            .position(Option::is_none)
            .ok_or(RtosError::OutOfMemory)?;
        let generation = self.generations[slot];
        self.slots[slot] = Some(QueueCb::new(
            slot, kind, storage, item_size, capacity, count, generation,
        ));
        Ok(QueueId {
            index: slot as u16,
            generation,
        })
    }

    fn free(&mut self, id: QueueId) {
        self.slots[id.index()] = None;
        self.generations[id.index()] = self.generations[id.index()].wrapping_add(1);
    }
}

impl<P: Port> Scheduler<P> {
    // ------------------------------------------------------------------
    // Creation
    // ------------------------------------------------------------------

    /// Create a queue of `capacity` items of `item_size` bytes
    ///
    /// `storage` must hold at least `capacity * item_size` bytes.
    pub fn create_queue(
        &mut self,
        capacity: usize,
        item_size: usize,
        storage: &'static mut [u8],
    ) -> Result<QueueId> {
        if capacity == 0 || item_size == 0 || storage.len() < capacity * item_size {
            return Err(RtosError::InvalidParameter);
        }
        let id = self
            .queues
            .insert(QueueKind::Queue, storage, item_size, capacity, 0)?;
        debug!("created queue {}: {} x {} bytes", id, capacity, item_size);
        Ok(id)
    }

    /// Binary semaphore, created empty
    pub fn create_binary_semaphore(&mut self) -> Result<QueueId> {
        self.queues
            .insert(QueueKind::BinarySemaphore, &mut [], 0, 1, 0)
    }

    pub fn create_counting_semaphore(&mut self, max: usize, initial: usize) -> Result<QueueId> {
        if max == 0 || initial > max {
            return Err(RtosError::InvalidParameter);
        }
        self.queues
            .insert(QueueKind::CountingSemaphore, &mut [], 0, max, initial)
    }

    /// Mutex with priority inheritance, created available
    pub fn create_mutex(&mut self) -> Result<QueueId> {
        self.queues.insert(QueueKind::Mutex, &mut [], 0, 1, 1)
    }

    pub fn create_recursive_mutex(&mut self) -> Result<QueueId> {
        self.queues
            .insert(QueueKind::RecursiveMutex, &mut [], 0, 1, 1)
    }

    /// Delete a queue, semaphore or mutex
    ///
    /// Deleting twice, or while tasks wait on it, is a contract violation.
    pub fn delete_queue(&mut self, id: QueueId) {
        let q = match self.queues.get(id) {
            Ok(q) => q,
            Err(_) => panic!("queue {} deleted twice", id),
        };
        assert!(
            q.send_waiters.is_empty() && q.recv_waiters.is_empty(),
            "queue {} deleted with tasks waiting on it",
            id
        );
        if let Some(holder) = q.holder {
            if let Some(tcb) = self.tasks.get_mut(holder) {
                tcb.drop_held_mutex(id);
            }
        }
        self.queues.free(id);
        debug!("deleted queue {}", id);
    }

    pub fn queue_kind(&self, id: QueueId) -> Result<QueueKind> {
        Ok(self.queues.get(id)?.kind)
    }

    // ------------------------------------------------------------------
    // Sending
    // ------------------------------------------------------------------

    /// Copy `item` to the back of the queue
    ///
    /// `Ready` on success. `Pending` means the caller now waits for space
    /// and must retry with the same `wait` once it runs again.
    pub fn send(&mut self, id: QueueId, item: &[u8], wait: &mut Wait) -> Result<Poll<()>> {
        self.send_at(id, item, Position::Back, wait)
    }

    /// Copy `item` to the front, so it is received next
    pub fn send_to_front(&mut self, id: QueueId, item: &[u8], wait: &mut Wait) -> Result<Poll<()>> {
        self.send_at(id, item, Position::Front, wait)
    }

    /// Mailbox write: replace the item of a length-one queue. Never blocks.
    pub fn overwrite(&mut self, id: QueueId, item: &[u8]) -> Result<()> {
        assert!(
            self.queues.get(id)?.capacity == 1,
            "overwrite on a queue longer than one item"
        );
        match self.send_at(id, item, Position::Overwrite, &mut Wait::none())? {
            Poll::Ready(()) => Ok(()),
            Poll::Pending => unreachable!("overwrite blocked"),
        }
    }

    fn send_at(
        &mut self,
        id: QueueId,
        item: &[u8],
        position: Position,
        wait: &mut Wait,
    ) -> Result<Poll<()>> {
        let q = self.queues.get_mut(id)?;
        if q.kind.is_mutex() || item.len() != q.item_size {
            return Err(RtosError::InvalidParameter);
        }

        if !q.is_full() || position == Position::Overwrite {
            q.copy_in(item, position);
            if self.wake_head(ListId::RecvWaiters(id.index)) {
                self.request_switch();
            }
            return Ok(Poll::Ready(()));
        }

        match wait.remaining(self.tick_count()) {
            None if wait.is_immediate() => Err(RtosError::QueueFull),
            None => Err(RtosError::Timeout),
            Some(ticks) => {
                self.place_on_event_list(ListId::SendWaiters(id.index), ticks);
                Ok(Poll::Pending)
            }
        }
    }

    /// Interrupt-side send. Never blocks.
    ///
    /// Returns whether a task that outranks the interrupted one was woken.
    pub fn send_from_isr(&mut self, id: QueueId, item: &[u8]) -> Result<bool> {
        let q = self.queues.get_mut(id)?;
        if q.kind.is_mutex() || item.len() != q.item_size {
            return Err(RtosError::InvalidParameter);
        }
        if q.is_full() {
            return Err(RtosError::QueueFull);
        }
        q.copy_in(item, Position::Back);
        Ok(self.wake_head(ListId::RecvWaiters(id.index)))
    }

    // ------------------------------------------------------------------
    // Receiving
    // ------------------------------------------------------------------

    /// Move the front item into `out`
    pub fn receive(&mut self, id: QueueId, out: &mut [u8], wait: &mut Wait) -> Result<Poll<()>> {
        self.receive_at(id, out, true, wait)
    }

    /// Copy the front item into `out` and leave it queued
    pub fn peek(&mut self, id: QueueId, out: &mut [u8], wait: &mut Wait) -> Result<Poll<()>> {
        self.receive_at(id, out, false, wait)
    }

    fn receive_at(
        &mut self,
        id: QueueId,
        out: &mut [u8],
        consume: bool,
        wait: &mut Wait,
    ) -> Result<Poll<()>> {
        let q = self.queues.get_mut(id)?;
        if q.kind.is_mutex() || out.len() != q.item_size {
            return Err(RtosError::InvalidParameter);
        }

        if q.count > 0 {
            q.copy_out(out, consume);
            // A consumed item frees space for a sender; a peeked one is
            // still there for the next receiver
            let woken = if consume {
                ListId::SendWaiters(id.index)
            } else {
                ListId::RecvWaiters(id.index)
            };
            if self.wake_head(woken) {
                self.request_switch();
            }
            return Ok(Poll::Ready(()));
        }

        match wait.remaining(self.tick_count()) {
            None if wait.is_immediate() => Err(RtosError::QueueEmpty),
            None => Err(RtosError::Timeout),
            Some(ticks) => {
                self.place_on_event_list(ListId::RecvWaiters(id.index), ticks);
                Ok(Poll::Pending)
            }
        }
    }

    /// Interrupt-side receive. Never blocks.
    pub fn receive_from_isr(&mut self, id: QueueId, out: &mut [u8]) -> Result<bool> {
        let q = self.queues.get_mut(id)?;
        if q.kind.is_mutex() || out.len() != q.item_size {
            return Err(RtosError::InvalidParameter);
        }
        if q.count == 0 {
            return Err(RtosError::QueueEmpty);
        }
        q.copy_out(out, true);
        Ok(self.wake_head(ListId::SendWaiters(id.index)))
    }

    /// Ready the highest-priority task waiting on `list`, if any
    ///
    /// Returns whether it outranks the running task.
    pub(crate) fn wake_head(&mut self, list: ListId) -> bool {
        let head = self.queues.wait_list(list).and_then(List::head);
        match head {
            Some(node) => {
                let task = self.tasks.owner(node);
                self.wake_event_waiter(task)
            }
            None => false,
        }
    }

    // ------------------------------------------------------------------
    // State
    // ------------------------------------------------------------------

    pub fn messages_waiting(&self, id: QueueId) -> Result<usize> {
        Ok(self.queues.get(id)?.count)
    }

    pub fn spaces_available(&self, id: QueueId) -> Result<usize> {
        let q = self.queues.get(id)?;
        Ok(q.capacity - q.count)
    }

    /// Tasks blocked until something arrives (or the mutex is free)
    pub fn waiting_receivers(&self, id: QueueId) -> Result<usize> {
        Ok(self.queues.get(id)?.recv_waiters.len())
    }

    /// Tasks blocked until there is space
    pub fn waiting_senders(&self, id: QueueId) -> Result<usize> {
        Ok(self.queues.get(id)?.send_waiters.len())
    }

    /// Empty the queue. A task waiting to send gets to retry.
    pub fn reset(&mut self, id: QueueId) -> Result<()> {
        let q = self.queues.get_mut(id)?;
        assert!(!q.kind.is_mutex(), "reset on mutex {}", id);
        q.count = 0;
        q.read_from = 0;
        if self.wake_head(ListId::SendWaiters(id.index)) {
            self.request_switch();
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Semaphores
    // ------------------------------------------------------------------

    /// Release a semaphore or mutex
    ///
    /// Giving a full semaphore fails with `QueueFull`.
    pub fn give(&mut self, id: QueueId) -> Result<()> {
        if self.queues.get(id)?.kind.is_mutex() {
            return self.mutex_give(id, false);
        }
        match self.send_at(id, &[], Position::Back, &mut Wait::none())? {
            Poll::Ready(()) => Ok(()),
            Poll::Pending => unreachable!("give blocked"),
        }
    }

    /// Acquire a semaphore or mutex
    pub fn take(&mut self, id: QueueId, wait: &mut Wait) -> Result<Poll<()>> {
        if self.queues.get(id)?.kind.is_mutex() {
            return self.mutex_take(id, wait, false);
        }
        self.receive_at(id, &mut [], true, wait)
    }

    /// Interrupt-side give. Mutexes cannot be given from an interrupt.
    pub fn give_from_isr(&mut self, id: QueueId) -> Result<bool> {
        assert!(
            !self.queues.get(id)?.kind.is_mutex(),
            "mutex {} given from an interrupt",
            id
        );
        self.send_from_isr(id, &[])
    }
}
