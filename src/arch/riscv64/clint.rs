// Core-local interruptor (QEMU `virt` layout): machine timer and software
// interrupt for hart 0.

use crate::kernel::types::config;

const MSIP: usize = 0x0200_0000;
const MTIMECMP: usize = 0x0200_4000;
const MTIME: usize = 0x0200_BFF8;

/// mtime frequency on QEMU `virt`
pub const MTIME_HZ: u64 = 10_000_000;

/// mtime increments per kernel tick
pub const TICK_INTERVAL: u64 = MTIME_HZ / config::TICK_RATE_HZ as u64;

pub fn mtime() -> u64 {
    // Safety: MMIO register of the CLINT, always mapped
    unsafe { core::ptr::read_volatile(MTIME as *const u64) }
}

fn set_mtimecmp(value: u64) {
    // Safety: as above
    unsafe { core::ptr::write_volatile(MTIMECMP as *mut u64, value) }
}

fn mtimecmp() -> u64 {
    // Safety: as above
    unsafe { core::ptr::read_volatile(MTIMECMP as *const u64) }
}

/// Arm the first tick
pub fn start_tick() {
    set_mtimecmp(mtime() + TICK_INTERVAL);
}

/// Arm the next tick relative to the last deadline, so handler latency
/// doesn't accumulate as drift
pub fn rearm_tick() {
    set_mtimecmp(mtimecmp() + TICK_INTERVAL);
}

/// Pend a machine software interrupt; this is how a switch is requested
pub fn pend_switch() {
    // Safety: as above
    unsafe { core::ptr::write_volatile(MSIP as *mut u32, 1) }
}

pub fn clear_switch() {
    // Safety: as above
    unsafe { core::ptr::write_volatile(MSIP as *mut u32, 0) }
}
