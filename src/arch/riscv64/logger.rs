// `log` backend writing to the 16550 UART of QEMU `virt`

use core::fmt::{self, Write};

const UART_BASE: usize = 0x1000_0000;

fn uart_putc(c: u8) {
    unsafe {
        core::ptr::write_volatile(UART_BASE as *mut u8, c);
    }
}

/// Raw UART output, usable from the panic handler
pub struct UartWriter;

impl Write for UartWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for b in s.bytes() {
            if b == b'\n' {
                uart_putc(b'\r');
            }
            uart_putc(b);
        }
        Ok(())
    }
}

struct Logger;

impl log::Log for Logger {
    fn enabled(&self, _: &log::Metadata) -> bool {
        true
    }

    fn log(&self, record: &log::Record) {
        // Keep lines from different tasks apart
        super::critical(|| {
            let _ = writeln!(
                UartWriter,
                "[{:5} {}] {}",
                record.level(),
                record.target(),
                record.args()
            );
        });
    }

    fn flush(&self) {}
}

pub fn init(level: log::LevelFilter) {
    // Only fails if a logger is already installed, which is fine
    let _ = log::set_logger(&Logger);
    log::set_max_level(level);
}
