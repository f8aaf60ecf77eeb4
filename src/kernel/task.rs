use crate::kernel::list::{ListNode, NodeRef, NodeStore};
use crate::kernel::types::*;
use core::ptr::NonNull;

pub struct TaskControlBlock {
    /// Saved stack pointer, valid while the task is not running
    pub stack_top: usize,
    /// Node for state list (ready/delayed/suspended/blocked-forever)
    pub state_list_item: ListNode,
    /// Node for event list (when blocked on a queue)
    pub event_list_item: ListNode,
    /// Current (possibly inherited) priority
    pub priority: Priority,
    /// Priority assigned by the application
    pub base_priority: Priority,
    /// Task name (for debugging)
    pub name: [u8; config::MAX_TASK_NAME_LEN],
    /// Lowest word of the stack region
    pub stack_base: NonNull<usize>,
    /// Stack size in words
    pub stack_size: StackSize,
    pub state: TaskState,
    /// Ticks left in the current time slice
    pub slice_remaining: u32,
    /// Mutexes held, most recently taken last
    pub held_mutexes: [Option<QueueId>; config::MAX_HELD_MUTEXES],
    pub mutexes_held: usize,
    pub generation: u16,
}

impl TaskControlBlock {
    /// Create a new TCB
    ///
    /// `stack_top` is the pointer produced by the port's initial frame.
    pub fn new(
        name: &str,
        priority: Priority,
        stack: &mut [usize],
        stack_top: usize,
        generation: u16,
    ) -> Self {
        // Validate priority to prevent array out-of-bounds
        assert!(
            priority < config::MAX_PRIORITIES,
            "Priority {} exceeds maximum allowed priority {}",
            priority,
            config::MAX_PRIORITIES - 1
        );

        // Validate stack size
        assert!(
            stack.len() >= config::MIN_STACK_SIZE,
            "Stack size {} is below minimum required size {}",
            stack.len(),
            config::MIN_STACK_SIZE
        );

        // Copy name with null termination
        let mut name_buf = [0u8; config::MAX_TASK_NAME_LEN];
        let name_bytes = name.as_bytes();
        let mut copy_len = core::cmp::min(name_bytes.len(), config::MAX_TASK_NAME_LEN - 1);
        while !name.is_char_boundary(copy_len) {
            copy_len -= 1;
        }
        name_buf[..copy_len].copy_from_slice(&name_bytes[..copy_len]);

        let mut tcb = TaskControlBlock {
            stack_top,
            state_list_item: ListNode::new(),
            event_list_item: ListNode::new(),
            priority,
            base_priority: priority,
            name: name_buf,
            stack_base: NonNull::from(&mut stack[0]),
            stack_size: stack.len(),
            state: TaskState::Ready,
            slice_remaining: config::TIME_SLICE_TICKS,
            held_mutexes: [None; config::MAX_HELD_MUTEXES],
            mutexes_held: 0,
            generation,
        };
        tcb.event_list_item.set_value(event_value(priority));
        tcb
    }

    /// Get task name as string
    pub fn name_str(&self) -> &str {
        // Find null terminator
        let len = self
            .name
            .iter()
            .position(|&c| c == 0)
            .unwrap_or(config::MAX_TASK_NAME_LEN);

        core::str::from_utf8(&self.name[..len]).unwrap_or("<invalid>")
    }

    /// Address one past the highest stack word
    pub fn stack_end(&self) -> usize {
        self.stack_base.as_ptr() as usize + self.stack_size * core::mem::size_of::<usize>()
    }

    pub(crate) fn push_held_mutex(&mut self, queue: QueueId) {
        assert!(
            self.mutexes_held < config::MAX_HELD_MUTEXES,
            "task {} holds too many mutexes",
            self.name_str()
        );
        self.held_mutexes[self.mutexes_held] = Some(queue);
        self.mutexes_held += 1;
    }

    pub(crate) fn drop_held_mutex(&mut self, queue: QueueId) {
        let held = &mut self.held_mutexes[..self.mutexes_held];
        if let Some(pos) = held.iter().position(|&m| m == Some(queue)) {
            // Keep acquisition order for the remaining entries
            held[pos..].rotate_left(1);
            self.mutexes_held -= 1;
            self.held_mutexes[self.mutexes_held] = None;
        }
    }

    pub(crate) fn held(&self) -> impl Iterator<Item = QueueId> + '_ {
        self.held_mutexes[..self.mutexes_held].iter().flatten().copied()
    }
}

/// Event-list sort key: higher priorities sort first
pub(crate) fn event_value(priority: Priority) -> u32 {
    (config::MAX_PRIORITIES - priority) as u32
}

/// Node references for a task slot. Each slot owns two nodes.
pub(crate) fn state_node(slot: usize) -> NodeRef {
    NodeRef::new(slot * 2)
}

pub(crate) fn event_node(slot: usize) -> NodeRef {
    NodeRef::new(slot * 2 + 1)
}

pub(crate) fn node_slot(node: NodeRef) -> usize {
    node.raw() / 2
}

/// Fixed arena of task slots
pub struct TaskTable {
    slots: [Option<TaskControlBlock>; config::MAX_TASKS],
    /// Bumped whenever a slot is freed so stale handles stop resolving
    generations: [u16; config::MAX_TASKS],
}

impl TaskTable {
    pub const fn new() -> Self {
        const EMPTY: Option<TaskControlBlock> = None;
        TaskTable {
            slots: [EMPTY; config::MAX_TASKS],
            generations: [0; config::MAX_TASKS],
        }
    }

    pub fn free_slot(&self) -> Option<usize> {
        self.slots.iter().position(Option::is_none)
    }

    pub fn generation(&self, slot: usize) -> u16 {
        self.generations[slot]
    }

    pub fn insert(&mut self, slot: usize, tcb: TaskControlBlock) -> TaskId {
        debug_assert!(self.slots[slot].is_none());
        let id = TaskId {
            index: slot as u16,
            generation: tcb.generation,
        };
        self.slots[slot] = Some(tcb);
        id
    }

    pub fn free(&mut self, id: TaskId) -> Option<TaskControlBlock> {
        let slot = id.index();
        let tcb = self.slots[slot].take()?;
        self.generations[slot] = self.generations[slot].wrapping_add(1);
        Some(tcb)
    }

    pub fn get(&self, id: TaskId) -> Option<&TaskControlBlock> {
        self.slots
            .get(id.index())?
            .as_ref()
            .filter(|t| t.generation == id.generation)
    }

    pub fn get_mut(&mut self, id: TaskId) -> Option<&mut TaskControlBlock> {
        self.slots
            .get_mut(id.index())?
            .as_mut()
            .filter(|t| t.generation == id.generation)
    }

    /// Handle for whatever task currently owns `slot`
    pub fn id_at(&self, slot: usize) -> Option<TaskId> {
        self.slots[slot].as_ref().map(|t| TaskId {
            index: slot as u16,
            generation: t.generation,
        })
    }

    pub fn owner(&self, node: NodeRef) -> TaskId {
        self.id_at(node_slot(node))
            .expect("list node owned by an empty task slot")
    }
}

impl core::ops::Index<TaskId> for TaskTable {
    type Output = TaskControlBlock;

    fn index(&self, id: TaskId) -> &TaskControlBlock {
        self.get(id).expect("stale task handle")
    }
}

impl core::ops::IndexMut<TaskId> for TaskTable {
    fn index_mut(&mut self, id: TaskId) -> &mut TaskControlBlock {
        self.get_mut(id).expect("stale task handle")
    }
}

impl NodeStore for TaskTable {
    fn node(&self, r: NodeRef) -> &ListNode {
        let tcb = self.slots[node_slot(r)]
            .as_ref()
            .expect("list node in empty task slot");
        if r.raw() % 2 == 0 {
            &tcb.state_list_item
        } else {
            &tcb.event_list_item
        }
    }

    fn node_mut(&mut self, r: NodeRef) -> &mut ListNode {
        let tcb = self.slots[node_slot(r)]
            .as_mut()
            .expect("list node in empty task slot");
        if r.raw() % 2 == 0 {
            &mut tcb.state_list_item
        } else {
            &mut tcb.event_list_item
        }
    }
}
