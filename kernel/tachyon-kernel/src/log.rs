//! Serial log sink.
//!
//! A 16550 on COM1 is the kernel's output from the first instruction
//! after the stub hands over. The levelled sink remembers the last line
//! so a panic can replay it; the panic path itself writes through the raw
//! sink without taking any lock.

use core::fmt::{self, Write};

use tachyon_core::log::LogLevel;
use tachyon_core::sync::IrqLock;

use crate::arch::x86_64::instructions::{inb, outb};

const COM1: u16 = 0x3F8;

/// Last levelled log line, replayed by the panic handler.
static LAST_LINE: IrqLock<LastLine> = IrqLock::new(LastLine {
    buf: [0; 256],
    len: 0,
});

struct LastLine {
    buf: [u8; 256],
    len: usize,
}

fn serial_put(byte: u8) {
    // SAFETY: COM1 is the kernel's own debug port.
    unsafe {
        while inb(COM1 + 5) & 0x20 == 0 {
            core::hint::spin_loop();
        }
        outb(COM1, byte);
    }
}

struct SerialWriter;

impl Write for SerialWriter {
    fn write_str(&mut self, text: &str) -> fmt::Result {
        for byte in text.bytes() {
            if byte == b'\n' {
                serial_put(b'\r');
            }
            serial_put(byte);
        }
        Ok(())
    }
}

fn print_sink(args: fmt::Arguments<'_>) {
    let _ = SerialWriter.write_fmt(args);
}

fn log_sink(level: LogLevel, args: fmt::Arguments<'_>) {
    let _ = SerialWriter.write_fmt(format_args!("[{}] {}\n", level.name(), args));

    // Remember the line for the panic banner.
    let mut last = LAST_LINE.lock();
    struct LineWriter<'a>(&'a mut LastLine);
    impl Write for LineWriter<'_> {
        fn write_str(&mut self, text: &str) -> fmt::Result {
            for &byte in text.as_bytes() {
                if self.0.len < self.0.buf.len() {
                    self.0.buf[self.0.len] = byte;
                    self.0.len += 1;
                }
            }
            Ok(())
        }
    }
    last.len = 0;
    let _ = LineWriter(&mut last).write_fmt(args);
}

/// Programs COM1 (115200 8N1, FIFOs on) and registers the log sinks.
pub fn init_serial() {
    // SAFETY: Standard 16550 initialisation on the kernel's own port.
    unsafe {
        outb(COM1 + 1, 0x00); // mask interrupts
        outb(COM1 + 3, 0x80); // DLAB
        outb(COM1, 0x01); // divisor 1: 115200 baud
        outb(COM1 + 1, 0x00);
        outb(COM1 + 3, 0x03); // 8N1
        outb(COM1 + 2, 0xC7); // FIFOs enabled and cleared
        outb(COM1 + 4, 0x0B); // DTR | RTS | OUT2
    }

    tachyon_core::log::set_print_fn(print_sink);
    tachyon_core::log::set_log_fn(log_sink);
}

/// Prints the panic banner and the last logged line, then halts forever.
///
/// Called from the boot stub's panic handler; writes straight to the
/// serial port and only try-locks the last-line buffer.
pub fn panic_print(info: &core::panic::PanicInfo<'_>) -> ! {
    let _ = SerialWriter.write_fmt(format_args!("\n*** KERNEL PANIC ***\n{info}\n"));

    if let Some(last) = LAST_LINE.try_lock() {
        if last.len > 0 {
            if let Ok(line) = core::str::from_utf8(&last.buf[..last.len]) {
                let _ = SerialWriter.write_fmt(format_args!("last log: {line}\n"));
            }
        }
    }

    crate::arch::x86_64::instructions::disable_interrupts();
    loop {
        crate::arch::x86_64::instructions::halt();
    }
}
