// Nested critical sections
//
// Only the outermost enter samples the interrupt mask and only the matching
// outermost exit restores it.

use crate::kernel::port::InterruptMask;

#[derive(Debug, Default)]
pub struct CriticalNesting {
    depth: usize,
    was_enabled: bool,
}

impl CriticalNesting {
    pub const fn new() -> Self {
        CriticalNesting {
            depth: 0,
            was_enabled: false,
        }
    }

    pub fn enter<M: InterruptMask + ?Sized>(&mut self, mask: &mut M) {
        // Mask first: the counter itself is shared with interrupt handlers
        let was_enabled = mask.mask();
        if self.depth == 0 {
            self.was_enabled = was_enabled;
        }
        self.depth += 1;
    }

    pub fn exit<M: InterruptMask + ?Sized>(&mut self, mask: &mut M) {
        assert!(self.depth > 0, "critical section exit without enter");
        self.depth -= 1;
        if self.depth == 0 {
            mask.restore(self.was_enabled);
        }
    }

    pub fn depth(&self) -> usize {
        self.depth
    }
}
