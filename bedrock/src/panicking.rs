//! Panic support for the bare-metal images.
//!
//! Panics are terminal by design: the message goes out over the console
//! ports and the machine parks. Host-side test builds use std's handler
//! instead.

#[cfg(target_os = "none")]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    use crate::x86_64::pio::Pio;
    use core::fmt::Write;

    // Bypass the logger and its lock; this path must work from anywhere,
    // including a panic inside the logger itself.
    struct RawConsole;
    impl Write for RawConsole {
        fn write_str(&mut self, s: &str) -> core::fmt::Result {
            for b in s.as_bytes() {
                Pio::new(0xe9).write_u8(*b);
            }
            Ok(())
        }
    }

    let _ = writeln!(RawConsole, "\npanic: {}", info);
    crate::x86_64::intrinsics::halt();
}
