//! Boot console: port E9 and the COM1 UART, wired up as the `log` backend.
//!
//! Port E9 is the Bochs/QEMU debug console; writes show up on the emulator
//! side with zero setup, which is what you want when a bad VMCS field kills
//! the machine before the UART is programmed. The lock is best effort: a
//! panic while the lock is held falls back to the raw ports.

use crate::x86_64::pio::Pio;
use core::fmt::Write;
use spin::Mutex;

const COM1: u16 = 0x3f8;
const PORT_E9: u16 = 0xe9;

/// Byte sink over port E9 plus COM1.
pub struct Console {
    _p: (),
}

impl Console {
    /// Create a new console interface.
    pub const fn new() -> Self {
        Console { _p: () }
    }

    /// Program the UART: 115200 8N1, FIFO off, interrupts off.
    pub fn init(&self) {
        Pio::new(COM1 + 1).write_u8(0); // no interrupts
        Pio::new(COM1 + 3).write_u8(0x80); // DLAB
        Pio::new(COM1).write_u8(1); // divisor lo: 115200
        Pio::new(COM1 + 1).write_u8(0); // divisor hi
        Pio::new(COM1 + 3).write_u8(0x03); // 8N1, DLAB off
        Pio::new(COM1 + 2).write_u8(0); // FIFO off
        Pio::new(COM1 + 4).write_u8(0x03); // DTR | RTS
    }

    fn put(&self, b: u8) {
        Pio::new(PORT_E9).write_u8(b);
        // Bounded wait for the transmitter; dropping bytes beats hanging.
        for _ in 0..12800 {
            if Pio::new(COM1 + 5).read_u8() & 0x20 != 0 {
                break;
            }
        }
        Pio::new(COM1).write_u8(b);
    }
}

impl Write for Console {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        for b in s.as_bytes() {
            if *b == b'\n' {
                self.put(b'\r');
            }
            self.put(*b);
        }
        Ok(())
    }
}

static CONSOLE: Mutex<Console> = Mutex::new(Console::new());

struct ConsoleLogger;

impl log::Log for ConsoleLogger {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true
    }

    fn log(&self, record: &log::Record) {
        if let Some(mut console) = CONSOLE.try_lock() {
            let _ = writeln!(console, "[{:>5}] {}", record.level(), record.args());
        } else {
            // Contended or poisoned by a panic mid-print. Emit unlocked.
            let _ = writeln!(
                Console::new(),
                "[{:>5}] {}",
                record.level(),
                record.args()
            );
        }
    }

    fn flush(&self) {}
}

static LOGGER: ConsoleLogger = ConsoleLogger;

/// Program the UART and install the console as the `log` sink.
pub fn init() {
    CONSOLE.lock().init();
    let _ = log::set_logger(&LOGGER).map(|_| log::set_max_level(log::LevelFilter::Trace));
}
