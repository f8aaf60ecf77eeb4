// Software timers
//
// Timer calls never change a timer directly. They post a command to the
// daemon's queue; the daemon task applies commands and hands out expired
// callbacks in task context, at `config::TIMER_TASK_PRIORITY`. A timer
// remembers the tick its period counts from rather than an absolute
// expiry, so the tick wrap needs no second list.

use crate::kernel::port::Port;
use crate::kernel::scheduler::Scheduler;
use crate::kernel::timeout::Wait;
use crate::kernel::types::*;
use core::cmp::Reverse;
use core::task::Poll;
use log::{debug, trace, warn};

/// Run by the daemon when a timer expires, with the kernel released
pub type TimerCallback = fn(TimerId);

/// Bytes of one command on the daemon's queue
const COMMAND_BYTES: usize = 9;

/// Storage the daemon's command queue needs
pub const TIMER_QUEUE_BYTES: usize = config::TIMER_QUEUE_LENGTH * COMMAND_BYTES;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
enum Command {
    /// Arm, counting from the tick carried in the message
    Start = 1,
    Stop = 2,
    /// Arm with the period carried in the message, counting from the tick
    /// the daemon applies it
    ChangePeriod = 3,
    Delete = 4,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
struct Message {
    command: Command,
    timer: TimerId,
    value: u32,
}

impl Message {
    fn encode(&self) -> [u8; COMMAND_BYTES] {
        let mut out = [0u8; COMMAND_BYTES];
        out[0] = self.command as u8;
        out[1..3].copy_from_slice(&self.timer.index.to_le_bytes());
        out[3..5].copy_from_slice(&self.timer.generation.to_le_bytes());
        out[5..9].copy_from_slice(&self.value.to_le_bytes());
        out
    }

    fn decode(raw: &[u8; COMMAND_BYTES]) -> Option<Self> {
        let command = match raw[0] {
            1 => Command::Start,
            2 => Command::Stop,
            3 => Command::ChangePeriod,
            4 => Command::Delete,
            _ => return None,
        };
        let half = |at: usize| u16::from_le_bytes([raw[at], raw[at + 1]]);
        Some(Message {
            command,
            timer: TimerId {
                index: half(1),
                generation: half(3),
            },
            value: u32::from_le_bytes([raw[5], raw[6], raw[7], raw[8]]),
        })
    }
}

pub(crate) struct TimerCb {
    name: &'static str,
    period: TickType,
    auto_reload: bool,
    callback: TimerCallback,
    /// Tick the running period counts from
    armed_at: TickType,
    active: bool,
    generation: u16,
}

impl TimerCb {
    /// Ticks past expiry, `None` before it
    fn overdue(&self, now: TickType) -> Option<u32> {
        now.elapsed_since(self.armed_at).0.checked_sub(self.period.0)
    }

    fn remaining(&self, now: TickType) -> TickType {
        let elapsed = now.elapsed_since(self.armed_at).0;
        TickType::new(self.period.0.saturating_sub(elapsed))
    }
}

/// Timer slots plus the daemon's queue and task, once started
pub struct TimerTable {
    slots: [Option<TimerCb>; config::MAX_TIMERS],
    generations: [u16; config::MAX_TIMERS],
    commands: Option<QueueId>,
    daemon: Option<TaskId>,
}

impl TimerTable {
    pub const fn new() -> Self {
        const EMPTY: Option<TimerCb> = None;
        TimerTable {
            slots: [EMPTY; config::MAX_TIMERS],
            generations: [0; config::MAX_TIMERS],
            commands: None,
            daemon: None,
        }
    }

    fn get(&self, id: TimerId) -> Result<&TimerCb> {
        self.slots
            .get(id.index())
            .and_then(Option::as_ref)
            .filter(|t| t.generation == id.generation)
            .ok_or(RtosError::TimerNotFound)
    }

    fn get_mut(&mut self, id: TimerId) -> Result<&mut TimerCb> {
        self.slots
            .get_mut(id.index())
            .and_then(Option::as_mut)
            .filter(|t| t.generation == id.generation)
            .ok_or(RtosError::TimerNotFound)
    }

    fn insert(
        &mut self,
        name: &'static str,
        period: TickType,
        auto_reload: bool,
        callback: TimerCallback,
    ) -> Result<TimerId> {
        let slot = self
            .slots
            .iter()
            .position(Option::is_none)
            .ok_or(RtosError::OutOfMemory)?;
        let generation = self.generations[slot];
        self.slots[slot] = Some(TimerCb {
            name,
            period,
            auto_reload,
            callback,
            armed_at: TickType::zero(),
            active: false,
            generation,
        });
        Ok(TimerId {
            index: slot as u16,
            generation,
        })
    }

    fn free(&mut self, id: TimerId) {
        self.slots[id.index()] = None;
        self.generations[id.index()] = self.generations[id.index()].wrapping_add(1);
    }

    /// Take the most overdue active timer, rearming or stopping it
    ///
    /// Ties go to the lower slot. An auto-reload timer's next period counts
    /// from its expiry, not from `now`, so it does not drift.
    fn expire_next(&mut self, now: TickType) -> Option<(TimerCallback, TimerId)> {
        let (index, _) = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| {
                let timer = slot.as_ref().filter(|t| t.active)?;
                Some((i, timer.overdue(now)?))
            })
            .max_by_key(|&(i, overdue)| (overdue, Reverse(i)))?;

        let timer = self.slots[index].as_mut()?;
        if timer.auto_reload {
            timer.armed_at = timer.armed_at.wrapping_add(timer.period);
        } else {
            timer.active = false;
        }
        let id = TimerId {
            index: index as u16,
            generation: timer.generation,
        };
        trace!("tick {}: timer {} '{}' expired", now.0, id, timer.name);
        Some((timer.callback, id))
    }

    /// Ticks until the next active timer is due
    fn next_expiry(&self, now: TickType) -> Option<TickType> {
        self.slots
            .iter()
            .flatten()
            .filter(|t| t.active)
            .map(|t| t.remaining(now))
            .min()
    }
}

impl<P: Port> Scheduler<P> {
    /// Create the timer daemon and its command queue
    ///
    /// `queue_storage` must hold [`TIMER_QUEUE_BYTES`]. The daemon's entry
    /// loops on [`timer_service_step`](Self::timer_service_step) and runs
    /// every callback it hands back.
    pub fn start_timer_service(
        &mut self,
        entry: TaskEntry,
        stack: &'static mut [usize],
        queue_storage: &'static mut [u8],
    ) -> Result<TaskId> {
        if self.timers.commands.is_some() {
            return Err(RtosError::InvalidParameter);
        }
        let commands =
            self.create_queue(config::TIMER_QUEUE_LENGTH, COMMAND_BYTES, queue_storage)?;
        let daemon = match self.create_task("TIMER", config::TIMER_TASK_PRIORITY, entry, 0, stack) {
            Ok(daemon) => daemon,
            Err(e) => {
                self.delete_queue(commands);
                return Err(e);
            }
        };
        self.timers.commands = Some(commands);
        self.timers.daemon = Some(daemon);
        debug!("timer service {} on queue {}", daemon, commands);
        Ok(daemon)
    }

    pub fn timer_service_task(&self) -> Option<TaskId> {
        self.timers.daemon
    }

    /// Create a dormant timer that expires `period` ticks after each start
    pub fn create_timer(
        &mut self,
        name: &'static str,
        period: TickType,
        auto_reload: bool,
        callback: TimerCallback,
    ) -> Result<TimerId> {
        if period == TickType::zero() {
            return Err(RtosError::InvalidParameter);
        }
        let id = self.timers.insert(name, period, auto_reload, callback)?;
        debug!("created timer {} '{}', period {}", id, name, period.0);
        Ok(id)
    }

    /// Arm a timer, counting from the tick the command is queued at
    ///
    /// Starting an active timer restarts its period. Like every timer
    /// command this only queues the request: `Pending` means the command
    /// queue is full and the caller waits for space.
    pub fn start_timer(&mut self, id: TimerId, wait: &mut Wait) -> Result<Poll<()>> {
        let now = self.tick_count();
        self.post(Command::Start, id, now.0, wait)
    }

    /// Restart a timer's period from now, starting it if dormant
    pub fn reset_timer(&mut self, id: TimerId, wait: &mut Wait) -> Result<Poll<()>> {
        self.start_timer(id, wait)
    }

    pub fn stop_timer(&mut self, id: TimerId, wait: &mut Wait) -> Result<Poll<()>> {
        self.post(Command::Stop, id, 0, wait)
    }

    /// Give a timer a new period counted from when the daemon applies it.
    /// A dormant timer is started.
    pub fn change_timer_period(
        &mut self,
        id: TimerId,
        period: TickType,
        wait: &mut Wait,
    ) -> Result<Poll<()>> {
        if period == TickType::zero() {
            return Err(RtosError::InvalidParameter);
        }
        self.post(Command::ChangePeriod, id, period.0, wait)
    }

    /// Free a timer once the daemon gets to the command
    pub fn delete_timer(&mut self, id: TimerId, wait: &mut Wait) -> Result<Poll<()>> {
        self.post(Command::Delete, id, 0, wait)
    }

    fn post(
        &mut self,
        command: Command,
        timer: TimerId,
        value: u32,
        wait: &mut Wait,
    ) -> Result<Poll<()>> {
        self.timers.get(timer)?;
        let commands = self.timers.commands.ok_or(RtosError::InvalidParameter)?;
        let message = Message {
            command,
            timer,
            value,
        };
        self.send(commands, &message.encode(), wait)
    }

    // Interrupt-side variants. Each returns whether the daemon was woken
    // and outranks the interrupted task.

    pub fn start_timer_from_isr(&mut self, id: TimerId) -> Result<bool> {
        let now = self.tick_count_from_isr();
        self.post_from_isr(Command::Start, id, now.0)
    }

    pub fn reset_timer_from_isr(&mut self, id: TimerId) -> Result<bool> {
        self.start_timer_from_isr(id)
    }

    pub fn stop_timer_from_isr(&mut self, id: TimerId) -> Result<bool> {
        self.post_from_isr(Command::Stop, id, 0)
    }

    pub fn change_timer_period_from_isr(&mut self, id: TimerId, period: TickType) -> Result<bool> {
        if period == TickType::zero() {
            return Err(RtosError::InvalidParameter);
        }
        self.post_from_isr(Command::ChangePeriod, id, period.0)
    }

    fn post_from_isr(&mut self, command: Command, timer: TimerId, value: u32) -> Result<bool> {
        self.timers.get(timer)?;
        let commands = self.timers.commands.ok_or(RtosError::InvalidParameter)?;
        let message = Message {
            command,
            timer,
            value,
        };
        self.send_from_isr(commands, &message.encode())
    }

    pub fn timer_is_active(&self, id: TimerId) -> Result<bool> {
        Ok(self.timers.get(id)?.active)
    }

    pub fn timer_period(&self, id: TimerId) -> Result<TickType> {
        Ok(self.timers.get(id)?.period)
    }

    /// Tick the timer next expires at. Only meaningful while it is active.
    pub fn timer_expiry(&self, id: TimerId) -> Result<TickType> {
        let timer = self.timers.get(id)?;
        Ok(timer.armed_at.wrapping_add(timer.period))
    }

    pub fn timer_name(&self, id: TimerId) -> Result<&'static str> {
        Ok(self.timers.get(id)?.name)
    }

    /// One pass of the timer daemon
    ///
    /// Applies queued commands until a timer has expired, and hands back
    /// that timer's callback for the caller to run outside the kernel.
    /// `Pending` means the daemon now waits on its queue until a command
    /// arrives or the next timer is due; call again once it runs.
    pub fn timer_service_step(&mut self) -> Poll<(TimerCallback, TimerId)> {
        let Some(commands) = self.timers.commands else {
            panic!("timer service not started");
        };
        let mut raw = [0u8; COMMAND_BYTES];
        loop {
            let now = self.tick_count();
            if let Some(expired) = self.timers.expire_next(now) {
                return Poll::Ready(expired);
            }
            let mut wait = match self.timers.next_expiry(now) {
                Some(ticks) => Wait::new(ticks),
                None => Wait::forever(),
            };
            match self.receive(commands, &mut raw, &mut wait) {
                Ok(Poll::Ready(())) => match Message::decode(&raw) {
                    Some(message) => self.apply(message, now),
                    None => warn!("timer service: bad command {:?}", raw),
                },
                Ok(Poll::Pending) => return Poll::Pending,
                Err(e) => panic!("timer command queue: {}", e),
            }
        }
    }

    fn apply(&mut self, message: Message, now: TickType) {
        let Ok(timer) = self.timers.get_mut(message.timer) else {
            trace!("timer {} gone before {:?}", message.timer, message.command);
            return;
        };
        trace!("timer {} '{}': {:?}", message.timer, timer.name, message.command);
        match message.command {
            Command::Start => {
                timer.armed_at = TickType::new(message.value);
                timer.active = true;
            }
            Command::Stop => timer.active = false,
            Command::ChangePeriod => {
                timer.period = TickType::new(message.value);
                timer.armed_at = now;
                timer.active = true;
            }
            Command::Delete => {
                self.timers.free(message.timer);
                debug!("deleted timer {}", message.timer);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nop(_: TimerId) {}

    fn armed(table: &mut TimerTable, period: u32, auto_reload: bool, at: u32) -> TimerId {
        let id = table
            .insert("t", TickType::new(period), auto_reload, nop)
            .unwrap();
        let timer = table.get_mut(id).unwrap();
        timer.armed_at = TickType::new(at);
        timer.active = true;
        id
    }

    #[test]
    fn commands_survive_the_queue_encoding() {
        let message = Message {
            command: Command::ChangePeriod,
            timer: TimerId {
                index: 3,
                generation: 0x1234,
            },
            value: 0xdead_beef,
        };
        assert_eq!(Message::decode(&message.encode()), Some(message));
        assert_eq!(Message::decode(&[0; COMMAND_BYTES]), None);
    }

    #[test]
    fn most_overdue_timer_expires_first() {
        let mut table = TimerTable::new();
        let late = armed(&mut table, 5, false, 0);
        let later = armed(&mut table, 2, false, 0);
        let tied = armed(&mut table, 5, false, 0);
        let now = TickType::new(6);
        let order: Vec<_> = core::iter::from_fn(|| table.expire_next(now).map(|(_, id)| id)).collect();
        assert_eq!(order, vec![later, late, tied]);
        assert!(!table.get(late).unwrap().active);
    }

    #[test]
    fn auto_reload_counts_from_the_expiry_across_the_wrap() {
        let mut table = TimerTable::new();
        let id = armed(&mut table, 4, true, u32::MAX - 1);
        assert_eq!(table.next_expiry(TickType::new(u32::MAX)), Some(TickType::new(3)));

        // Served two ticks late; the next expiry is still four after the missed one
        let now = TickType::new(4);
        assert_eq!(table.expire_next(now).map(|(_, t)| t), Some(id));
        assert_eq!(table.expire_next(now), None);
        assert_eq!(table.next_expiry(now), Some(TickType::new(2)));
    }

    #[test]
    fn freed_slots_do_not_resolve_old_handles() {
        let mut table = TimerTable::new();
        let id = armed(&mut table, 1, false, 0);
        table.free(id);
        assert!(table.get(id).is_err());
        let again = armed(&mut table, 1, false, 0);
        assert_eq!(again.index(), id.index());
        assert!(table.get(id).is_err());
        assert_eq!(table.next_expiry(TickType::zero()), Some(TickType::new(1)));
    }
}
