//! Linux 16-bit boot-protocol loader, attempted when the image carries no
//! multiboot header: recognize the "HdrS" signature, build a zeropage,
//! place the protected-mode kernel at 1 MiB, and enter it.

use crate::params::{GuestParams, FIRMWARE_START, KERNEL_START};
use crate::LoadError;
use core::ptr::addr_of_mut;

/// "HdrS", at offset 0x202 of the setup code.
const HDRS_SIGNATURE: u32 = 0x5372_6448;
/// Earliest protocol version with cmd_line_ptr and loadflags as used here.
const MIN_PROTOCOL: u16 = 0x0202;

const LOADED_HIGH: u8 = 1 << 0;
const TYPE_OF_LOADER_UNKNOWN: u8 = 0xff;
const CAN_USE_HEAP: u8 = 1 << 7;

/// The setup header as the kernel image carries it from offset 0x1f1.
#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct SetupHeader {
    pub setup_sects: u8,
    pub root_flags: u16,
    pub syssize: u32,
    pub ram_size: u16,
    pub vid_mode: u16,
    pub root_dev: u16,
    pub boot_flag: u16,
    pub jump: u16,
    pub header: u32,
    pub version: u16,
    pub realmode_swtch: u32,
    pub start_sys_seg: u16,
    pub kernel_version: u16,
    pub type_of_loader: u8,
    pub loadflags: u8,
    pub setup_move_size: u16,
    pub code32_start: u32,
    pub ramdisk_image: u32,
    pub ramdisk_size: u32,
    pub bootsect_kludge: u32,
    pub heap_end_ptr: u16,
    pub ext_loader_ver: u8,
    pub ext_loader_type: u8,
    pub cmd_line_ptr: u32,
    pub initrd_addr_max: u32,
    pub kernel_alignment: u32,
    pub relocatable_kernel: u8,
    pub min_alignment: u8,
    pub xloadflags: u16,
    pub cmdline_size: u32,
    pub hardware_subarch: u32,
    pub hardware_subarch_data: u64,
    pub payload_offset: u32,
    pub payload_length: u32,
    pub setup_data: u64,
    pub pref_address: u64,
    pub init_size: u32,
    pub handover_offset: u32,
}

const SETUP_HEADER_OFFSET: usize = 0x1f1;

/// Zeropage E820 record: 20 bytes, unlike the 24-byte guest-params form.
#[repr(C, packed)]
#[derive(Clone, Copy)]
struct BootE820Entry {
    addr: u64,
    size: u64,
    ty: u32,
}

const EMPTY_BOOT_E820: BootE820Entry = BootE820Entry {
    addr: 0,
    size: 0,
    ty: 0,
};

/// The zeropage (struct boot_params): only the pieces this loader fills
/// are named, the rest stays zero.
#[repr(C, packed)]
pub struct BootParams {
    _pad1: [u8; 0x1e8],
    e820_entries: u8,
    _pad2: [u8; SETUP_HEADER_OFFSET - 0x1e9],
    hdr: SetupHeader,
    _pad3: [u8; 0x2d0 - SETUP_HEADER_OFFSET - core::mem::size_of::<SetupHeader>()],
    e820_table: [BootE820Entry; 128],
    _pad4: [u8; 0x1000 - 0x2d0 - 128 * core::mem::size_of::<BootE820Entry>()],
}

static mut ZEROPAGE: BootParams = BootParams {
    _pad1: [0; 0x1e8],
    e820_entries: 0,
    _pad2: [0; SETUP_HEADER_OFFSET - 0x1e9],
    hdr: unsafe { core::mem::transmute([0u8; core::mem::size_of::<SetupHeader>()]) },
    _pad3: [0; 0x2d0 - SETUP_HEADER_OFFSET - core::mem::size_of::<SetupHeader>()],
    e820_table: [EMPTY_BOOT_E820; 128],
    _pad4: [0; 0x1000 - 0x2d0 - 128 * core::mem::size_of::<BootE820Entry>()],
};

/// A staged Linux kernel: enter at `entry` with the zeropage in ESI.
#[derive(Debug)]
pub struct Handoff {
    pub entry: u32,
    pub zeropage: u32,
}

/// Recognize and stage a bzImage-style kernel.
pub fn load(params: &GuestParams) -> Result<Handoff, LoadError> {
    let (kernel_start, kernel_end) = (params.kernel_start, params.kernel_end);
    let image = unsafe {
        core::slice::from_raw_parts(
            kernel_start as usize as *const u8,
            (kernel_end - kernel_start) as usize,
        )
    };
    if image.len() < SETUP_HEADER_OFFSET + core::mem::size_of::<SetupHeader>() {
        return Err(LoadError::NotLinux);
    }

    let mut hdr: SetupHeader = unsafe {
        core::ptr::read_unaligned(image[SETUP_HEADER_OFFSET..].as_ptr() as *const SetupHeader)
    };
    if hdr.header != HDRS_SIGNATURE {
        return Err(LoadError::NotLinux);
    }
    if hdr.version < MIN_PROTOCOL || hdr.loadflags & LOADED_HIGH == 0 {
        return Err(LoadError::LinuxTooOld);
    }
    log::info!("firmware: linux boot protocol {:#06x}", { hdr.version });

    // The protected-mode kernel follows the real-mode setup code.
    let setup_sects = if hdr.setup_sects == 0 { 4 } else { hdr.setup_sects };
    let pm_offset = (setup_sects as usize + 1) * 512;
    if pm_offset >= image.len() {
        return Err(LoadError::NotLinux);
    }
    unsafe {
        core::ptr::copy_nonoverlapping(
            image[pm_offset..].as_ptr(),
            KERNEL_START as usize as *mut u8,
            image.len() - pm_offset,
        );
    }

    hdr.type_of_loader = TYPE_OF_LOADER_UNKNOWN;
    hdr.loadflags |= CAN_USE_HEAP;
    hdr.cmd_line_ptr =
        FIRMWARE_START as u32 + core::mem::offset_of!(GuestParams, cmdline) as u32;
    let (initrd_start, initrd_end) = (params.initrd_start, params.initrd_end);
    if initrd_start < initrd_end {
        hdr.ramdisk_image = initrd_start as u32;
        hdr.ramdisk_size = (initrd_end - initrd_start) as u32;
    }

    let zeropage = unsafe { &mut *addr_of_mut!(ZEROPAGE) };
    zeropage.hdr = hdr;

    let entries = (params.e820_entries as usize).min(zeropage.e820_table.len());
    for (out, e) in zeropage.e820_table[..entries]
        .iter_mut()
        .zip(params.e820_table[..entries].iter())
    {
        out.addr = e.addr;
        out.size = e.size;
        out.ty = e.ty;
    }
    zeropage.e820_entries = entries as u8;

    Ok(Handoff {
        entry: KERNEL_START as u32,
        zeropage: zeropage as *const BootParams as u32,
    })
}

/// Enter the protected-mode kernel: 32-bit, paging off, ESI = zeropage.
pub fn start(handoff: Handoff) -> ! {
    unsafe {
        core::arch::asm!(
            r#"
            cli
            movl %edi, %ebp
            pushq $0x08
            leaq 1f(%rip), %rax
            pushq %rax
            lretq
            .code32
            1:
            movw $0x10, %ax
            movw %ax, %ds
            movw %ax, %es
            movw %ax, %ss
            movl %cr0, %eax
            andl $0x7fffffff, %eax
            movl %eax, %cr0
            movl $0xc0000080, %ecx
            xorl %eax, %eax
            xorl %edx, %edx
            wrmsr
            jmpl *%ebp
            .code64
            "#,
            in("rdi") handoff.entry as u64,
            in("rsi") handoff.zeropage as u64,
            options(att_syntax, noreturn)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::offset_of;

    #[test]
    fn zeropage_layout() {
        assert_eq!(offset_of!(BootParams, e820_entries), 0x1e8);
        assert_eq!(offset_of!(BootParams, hdr), 0x1f1);
        assert_eq!(offset_of!(BootParams, e820_table), 0x2d0);
        assert_eq!(core::mem::size_of::<BootParams>(), 0x1000);
        assert_eq!(core::mem::size_of::<BootE820Entry>(), 20);
    }

    #[test]
    fn setup_header_field_offsets() {
        assert_eq!(offset_of!(SetupHeader, boot_flag), 0x1fe - SETUP_HEADER_OFFSET);
        assert_eq!(offset_of!(SetupHeader, header), 0x202 - SETUP_HEADER_OFFSET);
        assert_eq!(offset_of!(SetupHeader, version), 0x206 - SETUP_HEADER_OFFSET);
        assert_eq!(offset_of!(SetupHeader, type_of_loader), 0x210 - SETUP_HEADER_OFFSET);
        assert_eq!(offset_of!(SetupHeader, code32_start), 0x214 - SETUP_HEADER_OFFSET);
        assert_eq!(offset_of!(SetupHeader, ramdisk_image), 0x218 - SETUP_HEADER_OFFSET);
        assert_eq!(offset_of!(SetupHeader, cmd_line_ptr), 0x228 - SETUP_HEADER_OFFSET);
    }

    #[test]
    fn rejects_images_without_signature() {
        // An image too short to carry the setup header must be declined,
        // not crash the loader.
        let buf = [0u8; 64];
        let mut params = GuestParams::zeroed();
        params.kernel_start = buf.as_ptr() as u64;
        params.kernel_end = params.kernel_start + buf.len() as u64;
        assert_eq!(load(&params).unwrap_err(), LoadError::NotLinux);
    }
}
