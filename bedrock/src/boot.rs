//! Multiboot (v1) boot information reader.
//!
//! The VMM is loaded as a multiboot1 image; the loader hands over a magic
//! word and a physical pointer to this structure. Only the fields the VMM
//! consumes are modeled: the module list (guest kernel + optional initrd)
//! and the BIOS memory map.

use crate::addressing::Pa;

/// The magic the bootloader leaves in EAX.
pub const MULTIBOOT_BOOTLOADER_MAGIC: u32 = 0x2bad_b002;
/// The magic a multiboot1 kernel image carries in its header.
pub const MULTIBOOT_HEADER_MAGIC: u32 = 0x1bad_b002;

bitflags::bitflags! {
    /// `multiboot_info.flags`.
    pub struct InfoFlags: u32 {
        /// mem_lower/mem_upper are valid.
        const MEMORY = 1 << 0;
        /// boot_device is valid.
        const BOOTDEV = 1 << 1;
        /// cmdline is valid.
        const CMDLINE = 1 << 2;
        /// mods_count/mods_addr are valid.
        const MODS = 1 << 3;
        /// mmap_length/mmap_addr are valid.
        const MEM_MAP = 1 << 6;
    }
}

/// The multiboot1 information structure, as laid down by the loader.
#[repr(C)]
pub struct MultibootInfo {
    flags: u32,
    mem_lower: u32,
    mem_upper: u32,
    boot_device: u32,
    cmdline: u32,
    mods_count: u32,
    mods_addr: u32,
    syms: [u32; 4],
    mmap_length: u32,
    mmap_addr: u32,
}

/// One entry of the module list.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct Module {
    /// First byte of the module image (physical).
    pub start: u32,
    /// One past the last byte of the module image (physical).
    pub end: u32,
    cmdline: u32,
    _pad: u32,
}

impl Module {
    /// The module command line as a NUL-terminated byte string, if any.
    pub fn cmdline(&self) -> Option<&'static [u8]> {
        cstr_at(self.cmdline)
    }
}

/// One entry of the loader's memory map. The on-wire form is
/// `{size, addr, len, type}` where `size` covers the bytes after itself.
#[repr(C, packed)]
pub struct MmapEntry {
    size: u32,
    /// Range start.
    pub addr: u64,
    /// Range length.
    pub len: u64,
    /// BIOS type code (1 = usable RAM).
    pub ty: u32,
}

impl MultibootInfo {
    /// Interpret the pointer the loader passed, verifying the magic.
    ///
    /// # Safety
    /// `info` must be the physical address of a live multiboot1 info
    /// structure (identity mapping assumed).
    pub unsafe fn from_loader(magic: u32, info: Pa) -> &'static Self {
        assert_eq!(
            magic, MULTIBOOT_BOOTLOADER_MAGIC,
            "not started by a multiboot loader"
        );
        info.into_va().as_ref::<Self>().expect("null multiboot info")
    }

    /// The flags word.
    pub fn flags(&self) -> InfoFlags {
        InfoFlags::from_bits_truncate(self.flags)
    }

    /// The module list.
    pub fn modules(&self) -> &'static [Module] {
        if !self.flags().contains(InfoFlags::MODS) || self.mods_count == 0 {
            return &[];
        }
        unsafe {
            core::slice::from_raw_parts(
                self.mods_addr as usize as *const Module,
                self.mods_count as usize,
            )
        }
    }

    /// Iterate the loader memory map.
    pub fn memory_map(&self) -> MmapIter {
        assert!(
            self.flags().contains(InfoFlags::MEM_MAP),
            "no memory map from the loader"
        );
        MmapIter {
            pos: self.mmap_addr as usize,
            end: self.mmap_addr as usize + self.mmap_length as usize,
        }
    }
}

/// Iterator over [`MmapEntry`] records with loader-defined stride.
pub struct MmapIter {
    pos: usize,
    end: usize,
}

impl Iterator for MmapIter {
    type Item = &'static MmapEntry;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos + core::mem::size_of::<MmapEntry>() > self.end {
            return None;
        }
        let entry = unsafe { &*(self.pos as *const MmapEntry) };
        self.pos += entry.size as usize + 4;
        Some(entry)
    }
}

fn cstr_at(pa: u32) -> Option<&'static [u8]> {
    if pa == 0 {
        return None;
    }
    let base = pa as usize as *const u8;
    let mut len = 0;
    unsafe {
        while base.add(len).read() != 0 {
            len += 1;
        }
        Some(core::slice::from_raw_parts(base, len))
    }
}
