//! Multiboot1 kernel loader: find the header, place the image (a.out
//! kludge or ELF), build the boot information block, and hand over.

use crate::elf::Elf;
use crate::params::{GuestParams, E820_MAX_ENTRIES_GUEST, FIRMWARE_START, VMM_START};
use crate::LoadError;
use bedrock::boot::{MULTIBOOT_BOOTLOADER_MAGIC, MULTIBOOT_HEADER_MAGIC};
use core::ptr::addr_of_mut;

/// The header must sit in the first 8 KiB of the image.
pub const MULTIBOOT_SEARCH: usize = 8192;

bitflags::bitflags! {
    /// Multiboot header flags the loader honors.
    pub struct HeaderFlags: u32 {
        /// Modules must be page aligned.
        const PAGE_ALIGN = 1 << 0;
        /// The kernel wants a memory map.
        const MEMORY_INFO = 1 << 1;
        /// The address fields of the header are valid; load the raw image.
        const AOUT_KLUDGE = 1 << 16;
    }
}

/// The multiboot1 header embedded in a kernel image.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct Header {
    pub magic: u32,
    pub flags: u32,
    pub checksum: u32,
    pub header_addr: u32,
    pub load_addr: u32,
    pub load_end_addr: u32,
    pub bss_end_addr: u32,
    pub entry_addr: u32,
}

/// Scan the search window for the header magic on 4-byte alignment.
pub fn find_header(image: &[u8]) -> Option<(usize, Header)> {
    let window = image.len().min(MULTIBOOT_SEARCH);
    let mut at = 0;
    while at + core::mem::size_of::<Header>() <= window {
        if u32::from_le_bytes(image[at..at + 4].try_into().unwrap()) == MULTIBOOT_HEADER_MAGIC {
            let header = unsafe {
                core::ptr::read_unaligned(image[at..].as_ptr() as *const Header)
            };
            return Some((at, header));
        }
        at += 4;
    }
    None
}

/// The boot information block handed to the kernel in EBX.
#[repr(C)]
pub struct BootInfo {
    pub flags: u32,
    pub mem_lower: u32,
    pub mem_upper: u32,
    pub boot_device: u32,
    pub cmdline: u32,
    pub mods_count: u32,
    pub mods_addr: u32,
    syms: [u32; 4],
    pub mmap_length: u32,
    pub mmap_addr: u32,
}

const INFO_MEMORY: u32 = 1 << 0;
const INFO_CMDLINE: u32 = 1 << 2;
const INFO_MODS: u32 = 1 << 3;
const INFO_MEM_MAP: u32 = 1 << 6;

#[repr(C)]
struct ModList {
    mod_start: u32,
    mod_end: u32,
    cmdline: u32,
    _pad: u32,
}

/// Memory-map record in the multiboot wire format: `size` counts the
/// bytes after itself.
#[repr(C, packed)]
#[derive(Clone, Copy)]
struct MmapEntry {
    size: u32,
    addr: u64,
    len: u64,
    ty: u32,
}

const EMPTY_MMAP_ENTRY: MmapEntry = MmapEntry {
    size: 0,
    addr: 0,
    len: 0,
    ty: 0,
};

const MMAP_ENTRY_SIZE: u32 = (core::mem::size_of::<MmapEntry>() - 4) as u32;

static mut BOOT_INFO: BootInfo = BootInfo {
    flags: 0,
    mem_lower: 0,
    mem_upper: 0,
    boot_device: 0,
    cmdline: 0,
    mods_count: 0,
    mods_addr: 0,
    syms: [0; 4],
    mmap_length: 0,
    mmap_addr: 0,
};
static mut MOD_LIST: ModList = ModList {
    mod_start: 0,
    mod_end: 0,
    cmdline: 0,
    _pad: 0,
};
static mut MMAP: [MmapEntry; E820_MAX_ENTRIES_GUEST] = [EMPTY_MMAP_ENTRY; E820_MAX_ENTRIES_GUEST];
static INITRD_NAME: &[u8] = b"initrd\0";

/// A staged multiboot kernel: jump to `entry` with the info block in EBX.
pub struct Handoff {
    pub entry: u32,
    pub info: u32,
}

/// Place the kernel image and build the boot information.
pub fn load(params: &GuestParams) -> Result<Handoff, LoadError> {
    let (kernel_start, kernel_end) = (params.kernel_start, params.kernel_end);
    let image = unsafe {
        core::slice::from_raw_parts(
            kernel_start as usize as *const u8,
            (kernel_end - kernel_start) as usize,
        )
    };

    let (_, header) = find_header(image).ok_or(LoadError::NoMultibootHeader)?;
    log::info!("firmware: multiboot header found");

    let entry = if HeaderFlags::from_bits_truncate(header.flags).contains(HeaderFlags::AOUT_KLUDGE)
    {
        unsafe {
            core::ptr::copy_nonoverlapping(
                image.as_ptr(),
                header.load_addr as usize as *mut u8,
                (header.load_end_addr - header.load_addr) as usize,
            );
            core::ptr::write_bytes(
                header.load_end_addr as usize as *mut u8,
                0,
                (header.bss_end_addr - header.load_end_addr) as usize,
            );
        }
        header.entry_addr
    } else {
        unsafe { Elf::parse(image)?.load()? }
    };

    let info = unsafe { &mut *addr_of_mut!(BOOT_INFO) };
    info.flags = INFO_MEMORY | INFO_CMDLINE | INFO_MODS | INFO_MEM_MAP;
    info.mem_lower = 0;
    info.mem_upper = mem_upper_kib();
    info.cmdline = FIRMWARE_START as u32 + core::mem::offset_of!(GuestParams, cmdline) as u32;

    let (initrd_start, initrd_end) = (params.initrd_start, params.initrd_end);
    if initrd_start < initrd_end {
        let mods = unsafe { &mut *addr_of_mut!(MOD_LIST) };
        mods.mod_start = initrd_start as u32;
        mods.mod_end = initrd_end as u32;
        mods.cmdline = INITRD_NAME.as_ptr() as u32;
        info.mods_count = 1;
        info.mods_addr = mods as *const ModList as u32;
    }

    let entries = params.e820_entries as usize;
    let mmap = unsafe { &mut *addr_of_mut!(MMAP) };
    for (out, e) in mmap.iter_mut().zip(params.e820_table[..entries].iter()) {
        out.size = MMAP_ENTRY_SIZE;
        out.addr = e.addr;
        out.len = e.size;
        out.ty = e.ty;
    }
    info.mmap_addr = mmap.as_ptr() as u32;
    info.mmap_length = (entries * core::mem::size_of::<MmapEntry>()) as u32;

    Ok(Handoff {
        entry,
        info: info as *const BootInfo as u32,
    })
}

/// Upper memory reported to the kernel: everything between 1 MiB and the
/// VMM, in KiB.
const fn mem_upper_kib() -> u32 {
    ((VMM_START - 0x10_0000) / 1024) as u32
}

/// Drop back to 32-bit protected mode with paging off and jump to the
/// kernel with the register state multiboot requires (EAX = magic,
/// EBX = info).
pub fn start(handoff: Handoff) -> ! {
    unsafe {
        core::arch::asm!(
            r#"
            cli
            movl %edi, %ebp
            movl %esi, %ebx
            # Far-return into the 32-bit code segment of the firmware GDT.
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
            # Paging off (traps to the VMM, which drops IA-32e state)...
            movl %cr0, %eax
            andl $0x7fffffff, %eax
            movl %eax, %cr0
            # ...then long mode off.
            movl $0xc0000080, %ecx
            xorl %eax, %eax
            xorl %edx, %edx
            wrmsr
            movl ${magic}, %eax
            jmpl *%ebp
            .code64
            "#,
            magic = const MULTIBOOT_BOOTLOADER_MAGIC,
            in("rdi") handoff.entry as u64,
            in("rsi") handoff.info as u64,
            options(att_syntax, noreturn)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_search_is_aligned_and_windowed() {
        let mut image = vec![0u8; 0x4000];
        // A magic at an unaligned offset must not match.
        image[0x102..0x106].copy_from_slice(&MULTIBOOT_HEADER_MAGIC.to_le_bytes());
        assert!(find_header(&image).is_none());

        // One at an aligned offset inside the window does.
        image[0x102..0x106].copy_from_slice(&[0; 4]);
        image[0x180..0x184].copy_from_slice(&MULTIBOOT_HEADER_MAGIC.to_le_bytes());
        image[0x184..0x188].copy_from_slice(&0x10000u32.to_le_bytes()); // flags
        image[0x19c..0x1a0].copy_from_slice(&0x10_0000u32.to_le_bytes()); // entry_addr
        let (at, header) = find_header(&image).unwrap();
        assert_eq!(at, 0x180);
        assert!(HeaderFlags::from_bits_truncate(header.flags)
            .contains(HeaderFlags::AOUT_KLUDGE));
        assert_eq!(header.entry_addr, 0x10_0000);

        // Beyond the 8 KiB window the magic is ignored.
        let mut far = vec![0u8; 0x4000];
        far[0x2100..0x2104].copy_from_slice(&MULTIBOOT_HEADER_MAGIC.to_le_bytes());
        assert!(find_header(&far).is_none());
    }

    #[test]
    fn mem_upper_ends_below_the_vmm() {
        // [1 MiB, VMM_START) in KiB.
        assert_eq!(mem_upper_kib(), 0x3fc00);
    }

    #[test]
    fn mmap_entry_wire_size() {
        assert_eq!(core::mem::size_of::<MmapEntry>(), 24);
        assert_eq!(MMAP_ENTRY_SIZE, 20);
    }
}
