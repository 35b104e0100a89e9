//! Guest firmware: the payload the guest executes out of reset.
//!
//! The VMM places this image at guest physical 0x1000 behind the guest
//! parameters blob and points the reset vector at it. The entry stub
//! ([`entry`]) takes the CPU from real mode to long mode; [`fw_main`]
//! then relocates the guest kernel with the multiboot loader, falling
//! back to the Linux boot protocol, and hands over control.
//!
//! The firmware image's linker script places the `.guest_params` section
//! first (at 0x1000), `.text.fw_entry` immediately after it, and keeps
//! the whole image below 2 MiB.
#![cfg_attr(not(test), no_std)]

pub mod elf;
pub mod entry;
pub mod linux;
pub mod multiboot;
pub mod params;

use params::GuestParams;

/// Why a loader declined the kernel image.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum LoadError {
    /// No multiboot1 header in the search window.
    NoMultibootHeader,
    /// A multiboot header was found but the image is not loadable ELF.
    BadElf,
    /// The image does not carry the Linux 16-bit boot protocol signature.
    NotLinux,
    /// The Linux boot protocol version is too old to take a zeropage.
    LinuxTooOld,
}

/// Load the guest kernel and transfer control to it. Runs in long mode on
/// the identity mapping the entry stub built.
///
/// # Safety
/// `params` must point at the blob the VMM installed at `FIRMWARE_START`.
pub unsafe fn fw_main(params: &GuestParams) -> ! {
    bedrock::console::init();
    log::info!("firmware: starting");

    match multiboot::load(params) {
        Ok(handoff) => {
            log::info!(
                "firmware: multiboot kernel, entry {:#x}",
                handoff.entry
            );
            multiboot::start(handoff);
        }
        Err(err) => log::info!("firmware: multiboot loader declined: {:?}", err),
    }

    match linux::load(params) {
        Ok(handoff) => {
            log::info!("firmware: linux kernel, entry {:#x}", handoff.entry);
            linux::start(handoff);
        }
        Err(err) => log::info!("firmware: linux loader declined: {:?}", err),
    }

    log::error!("firmware: unknown kernel image format");
    bedrock::x86_64::intrinsics::halt();
}
