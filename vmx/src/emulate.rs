//! Instruction-emulation helpers: segment get/set, guest register file
//! access, the guest-virtual to host-virtual walker, and instruction fetch.

use crate::vcpu::VCpu;
use crate::vmcs::{ActiveVmcs, Field};
use crate::{ept, Gpa, Gva};
use bedrock::addressing::Va;
use bedrock::x86_64::{Cr0, Efer};
use iced_x86::{Decoder, DecoderOptions, Instruction};

/// A logical segment-register value, the shape the VMCS access-rights
/// encoding packs and unpacks.
#[derive(Clone, Copy, Debug, Default)]
pub struct Segment {
    pub base: u64,
    pub limit: u32,
    pub selector: u16,
    /// Segment type field (bits 3:0 of the access rights).
    pub ty: u8,
    /// Descriptor type: code/data (true) or system (false).
    pub s: bool,
    pub dpl: u8,
    pub present: bool,
    pub avl: bool,
    /// 64-bit code segment.
    pub l: bool,
    /// Default operation size.
    pub db: bool,
    /// Granularity.
    pub g: bool,
    pub unusable: bool,
}

/// The eight segment-register field groups.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SegReg {
    Cs,
    Ds,
    Es,
    Fs,
    Gs,
    Ss,
    Tr,
    Ldtr,
}

impl SegReg {
    fn fields(self) -> (Field, Field, Field, Field) {
        // (selector, base, limit, access rights)
        match self {
            Self::Cs => (Field::GuestCsSelector, Field::GuestCsBase, Field::GuestCsLimit, Field::GuestCsArBytes),
            Self::Ds => (Field::GuestDsSelector, Field::GuestDsBase, Field::GuestDsLimit, Field::GuestDsArBytes),
            Self::Es => (Field::GuestEsSelector, Field::GuestEsBase, Field::GuestEsLimit, Field::GuestEsArBytes),
            Self::Fs => (Field::GuestFsSelector, Field::GuestFsBase, Field::GuestFsLimit, Field::GuestFsArBytes),
            Self::Gs => (Field::GuestGsSelector, Field::GuestGsBase, Field::GuestGsLimit, Field::GuestGsArBytes),
            Self::Ss => (Field::GuestSsSelector, Field::GuestSsBase, Field::GuestSsLimit, Field::GuestSsArBytes),
            Self::Tr => (Field::GuestTrSelector, Field::GuestTrBase, Field::GuestTrLimit, Field::GuestTrArBytes),
            Self::Ldtr => (Field::GuestLdtrSelector, Field::GuestLdtrBase, Field::GuestLdtrLimit, Field::GuestLdtrArBytes),
        }
    }
}

/// Pack a [`Segment`] into the VMCS access-rights format.
pub fn segment_access_rights(seg: &Segment) -> u32 {
    if seg.unusable || !seg.present {
        1 << 16
    } else {
        (seg.ty as u32 & 15)
            | (seg.s as u32) << 4
            | (seg.dpl as u32 & 3) << 5
            | (seg.present as u32) << 7
            | (seg.avl as u32) << 12
            | (seg.l as u32) << 13
            | (seg.db as u32) << 14
            | (seg.g as u32) << 15
    }
}

/// Read a segment register out of the VMCS.
pub fn get_segment(vmcs: &ActiveVmcs, reg: SegReg) -> Segment {
    let (selector, base, limit, ar_bytes) = reg.fields();
    let ar = vmcs.read_any(ar_bytes) as u32;
    let unusable = (ar >> 16) & 1 != 0;
    Segment {
        base: vmcs.read_any(base),
        limit: vmcs.read_any(limit) as u32,
        selector: vmcs.read_any(selector) as u16,
        ty: (ar & 15) as u8,
        s: (ar >> 4) & 1 != 0,
        dpl: ((ar >> 5) & 3) as u8,
        present: !unusable,
        avl: (ar >> 12) & 1 != 0,
        l: (ar >> 13) & 1 != 0,
        db: (ar >> 14) & 1 != 0,
        g: (ar >> 15) & 1 != 0,
        unusable,
    }
}

/// Write a segment register into the VMCS.
pub fn set_segment(vmcs: &ActiveVmcs, reg: SegReg, seg: &Segment) {
    let (selector, base, limit, ar_bytes) = reg.fields();
    vmcs.write_any(base, seg.base);
    vmcs.write_any(limit, seg.limit as u64);
    vmcs.write_any(selector, seg.selector as u64);
    vmcs.write_any(ar_bytes, segment_access_rights(seg) as u64);
}

/// Current privilege level of the guest: 0 in real mode, SS.DPL otherwise.
pub fn cpl(vmcs: &ActiveVmcs) -> u8 {
    if vmcs.readl(Field::GuestCr0) & Cr0::PE.bits() == 0 {
        return 0;
    }
    ((vmcs.read32(Field::GuestSsArBytes) >> 5) & 3) as u8
}

/// Read a guest register by canonical index (RAX=0 .. R15=15). RSP lives
/// in the VMCS, not the record.
pub fn register_read(vcpu: &VCpu, vmcs: &ActiveVmcs, index: usize) -> u64 {
    let r = &vcpu.regs;
    match index {
        0 => r.rax,
        1 => r.rcx,
        2 => r.rdx,
        3 => r.rbx,
        4 => vmcs.readl(Field::GuestRsp),
        5 => r.rbp,
        6 => r.rsi,
        7 => r.rdi,
        8 => r.r8,
        9 => r.r9,
        10 => r.r10,
        11 => r.r11,
        12 => r.r12,
        13 => r.r13,
        14 => r.r14,
        15 => r.r15,
        _ => panic!("bad register index {}", index),
    }
}

/// Write a guest register by canonical index.
pub fn register_write(vcpu: &mut VCpu, vmcs: &ActiveVmcs, index: usize, value: u64) {
    let r = &mut vcpu.regs;
    match index {
        0 => r.rax = value,
        1 => r.rcx = value,
        2 => r.rdx = value,
        3 => r.rbx = value,
        4 => vmcs.writel(Field::GuestRsp, value),
        5 => r.rbp = value,
        6 => r.rsi = value,
        7 => r.rdi = value,
        8 => r.r8 = value,
        9 => r.r9 = value,
        10 => r.r10 = value,
        11 => r.r11 = value,
        12 => r.r12 = value,
        13 => r.r13 = value,
        14 => r.r14 = value,
        15 => r.r15 = value,
        _ => panic!("bad register index {}", index),
    }
}

/// EDX:EAX as a single value, the RDMSR/RDTSC result convention.
pub fn read_edx_eax(vcpu: &VCpu) -> u64 {
    (vcpu.regs.rdx & 0xffff_ffff) << 32 | (vcpu.regs.rax & 0xffff_ffff)
}

/// Split a value into EDX:EAX, zero-extending both halves.
pub fn write_edx_eax(vcpu: &mut VCpu, value: u64) {
    vcpu.regs.rax = value & 0xffff_ffff;
    vcpu.regs.rdx = value >> 32;
}

const PTE_PRESENT: u64 = 1 << 0;
const PTE_PSE: u64 = 1 << 7;

const LEVEL_MASKS: [u64; 4] = [
    0xffff_ff80_0000_0000,
    0xffff_ffff_c000_0000,
    0xffff_ffff_ffe0_0000,
    0xffff_ffff_ffff_f000,
];
const LEVEL_SHIFTS: [u64; 4] = [39, 30, 21, 12];

/// Translate a guest virtual address to a host virtual address by walking
/// the guest's own page tables.
///
/// The guest walks its tables with guest physical addresses, so every
/// table pointer, and the final leaf, goes through the EPT before the host
/// may dereference it. Large-page leaves at the PDPT and PD levels mix in
/// the low address bits accordingly. A non-present entry is fatal: callers
/// only translate addresses the guest just executed or touched.
pub fn gva_to_hva(vmcs: &ActiveVmcs, gva: Gva) -> Va {
    let gva = gva.into_u64();
    let eptp = vmcs.read64(Field::EptPointer);
    let cr3 = vmcs.readl(Field::GuestCr3);

    let mut table = ept::gpa_to_hpa(eptp, Gpa::new(cr3 & !0xfff));
    let mut entry = 0u64;
    for (i, (mask, shift)) in LEVEL_MASKS.iter().zip(LEVEL_SHIFTS.iter()).enumerate() {
        let index = ((gva >> shift) & 0x1ff) as usize;
        entry = unsafe { table.into_va().as_ref::<[u64; 512]>().unwrap()[index] };
        assert!(
            entry & PTE_PRESENT != 0,
            "guest page walk of {:#x} hit a non-present entry at level {}",
            gva,
            i
        );
        if entry & PTE_PSE != 0 {
            assert!(i == 1 || i == 2);
            // Strip NX and the upper attribute bits before using the frame.
            let frame = entry & mask & 0x000f_ffff_ffff_ffff;
            return ept::gpa_to_hpa(eptp, Gpa::new(frame | (gva & !mask))).into_va();
        }
        if i < 3 {
            table = ept::gpa_to_hpa(eptp, Gpa::new(entry & 0x000f_ffff_ffff_f000));
        }
    }
    ept::gpa_to_hpa(eptp, Gpa::new((entry & 0x000f_ffff_ffff_f000) | (gva & 0xfff))).into_va()
}

/// Fetch and decode the instruction the guest trapped on.
///
/// Uses the exit instruction length the hardware reports, so at most one
/// translation is needed as long as the instruction does not cross a page
/// boundary into a separately mapped frame (2 MiB frames make that rare).
pub fn get_instruction(vmcs: &ActiveVmcs) -> Instruction {
    let rip = vmcs.readl(Field::GuestRip);
    let len = vmcs.read32(Field::VmExitInstructionLen) as usize;
    assert!(len <= 15, "impossible instruction length {}", len);

    let mut bytes = [0u8; 15];
    let hva = gva_to_hva(vmcs, Gva::new(rip));
    bytes[..len].copy_from_slice(unsafe {
        core::slice::from_raw_parts(hva.into_usize() as *const u8, len)
    });

    let cs_l = vmcs.read32(Field::GuestCsArBytes) & (1 << 13) != 0;
    let cs_db = vmcs.read32(Field::GuestCsArBytes) & (1 << 14) != 0;
    let lma = vmcs.read64(Field::GuestIa32Efer) & Efer::LMA.bits() != 0;
    let bitness = if lma && cs_l {
        64
    } else if cs_db {
        32
    } else {
        16
    };

    let mut decoder = Decoder::with_ip(bitness, &bytes[..len], rip, DecoderOptions::NONE);
    let mut insn = Instruction::default();
    assert!(decoder.can_decode(), "undecodable guest instruction");
    decoder.decode_out(&mut insn);
    insn
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn access_rights_pack_unpack() {
        let seg = Segment {
            base: 0,
            limit: 0xfffff,
            selector: 0x10,
            ty: 11,
            s: true,
            dpl: 0,
            present: true,
            avl: false,
            l: true,
            db: false,
            g: true,
            unusable: false,
        };
        // 64-bit code: type 11, S, P, L, G.
        assert_eq!(segment_access_rights(&seg), 0xa09b);

        let ss = Segment {
            ty: 3,
            s: true,
            dpl: 3,
            present: true,
            db: true,
            g: true,
            ..Segment::default()
        };
        assert_eq!(segment_access_rights(&ss), 0xc0f3);

        let unusable = Segment {
            unusable: true,
            ..Segment::default()
        };
        assert_eq!(segment_access_rights(&unusable), 0x10000);
    }

    #[test]
    fn edx_eax_split() {
        let mut vcpu = VCpu::new();
        vcpu.regs.rdx = 0xffff_ffff_1111_2222;
        vcpu.regs.rax = 0xffff_ffff_3333_4444;
        assert_eq!(read_edx_eax(&vcpu), 0x1111_2222_3333_4444);

        write_edx_eax(&mut vcpu, 0xdead_beef_cafe_f00d);
        assert_eq!(vcpu.regs.rdx, 0xdead_beef);
        assert_eq!(vcpu.regs.rax, 0xcafe_f00d);
    }

    #[test]
    fn decoder_recognizes_syscall_and_sysret() {
        use iced_x86::Code;

        let mut decoder = Decoder::with_ip(64, &[0x0f, 0x05], 0x1000, DecoderOptions::NONE);
        let insn = decoder.decode();
        assert_eq!(insn.code(), Code::Syscall);

        let mut decoder = Decoder::with_ip(64, &[0x48, 0x0f, 0x07], 0x1000, DecoderOptions::NONE);
        let insn = decoder.decode();
        assert_eq!(insn.code(), Code::Sysretq);
    }
}
