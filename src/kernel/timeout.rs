//! Bookkeeping for blocking calls that may be retried after a wakeup.

use crate::kernel::types::{config, TickType};

/// The timeout state of one blocking call
///
/// A blocked call is retried every time its task is woken, whether by the
/// event or by the tick. The clock starts on the first attempt that has to
/// wait, so the remaining budget shrinks across retries instead of restarting.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Wait {
    timeout: TickType,
    entered: Option<TickType>,
}

impl Wait {
    pub const fn new(timeout: TickType) -> Self {
        Wait {
            timeout,
            entered: None,
        }
    }

    pub const fn ticks(ticks: u32) -> Self {
        Wait::new(TickType::new(ticks))
    }

    /// Fail at once instead of blocking
    pub const fn none() -> Self {
        Wait::new(TickType::zero())
    }

    pub const fn forever() -> Self {
        Wait::new(config::MAX_DELAY)
    }

    pub fn is_forever(&self) -> bool {
        self.timeout == config::MAX_DELAY
    }

    pub fn is_immediate(&self) -> bool {
        self.timeout == TickType::zero()
    }

    /// Ticks the caller may still block for, `None` once the budget is spent
    pub(crate) fn remaining(&mut self, now: TickType) -> Option<TickType> {
        if self.is_forever() {
            return Some(config::MAX_DELAY);
        }
        let entered = *self.entered.get_or_insert(now);
        let elapsed = now.elapsed_since(entered);
        if elapsed >= self.timeout {
            None
        } else {
            Some(TickType::new(self.timeout.0 - elapsed.0))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;

    #[test]
    fn zero_timeout_never_waits() {
        let mut w = Wait::none();
        assert_eq!(w.remaining(TickType::new(7)), None);
    }

    #[test]
    fn forever_never_expires() {
        let mut w = Wait::forever();
        assert_eq!(w.remaining(TickType::new(0)), Some(config::MAX_DELAY));
        assert_eq!(w.remaining(TickType::new(u32::MAX - 1)), Some(config::MAX_DELAY));
    }

    #[quickcheck]
    fn budget_shrinks_across_retries_and_wraps(start: u32, timeout: u16, step: u16) -> bool {
        let timeout = timeout as u32 + 1;
        let step = step as u32 % timeout;
        let start = TickType::new(start);
        let mut w = Wait::ticks(timeout);
        let first = w.remaining(start) == Some(TickType::new(timeout));
        let later = start.wrapping_add(TickType::new(step));
        let second = w.remaining(later) == Some(TickType::new(timeout - step));
        let expired = start.wrapping_add(TickType::new(timeout));
        first && second && w.remaining(expired).is_none()
    }
}
