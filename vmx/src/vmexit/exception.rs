//! Exception/NMI exits. The only exception this VMM expects is the `#UD`
//! raised by SYSCALL and SYSRET, which are dead in the guest because EFER
//! writes are intercepted and SCE stripped; both get emulated here from
//! the guest's auto-saved LSTAR/STAR/FMASK.

use super::{dump_vmcs, skip_emulated_instruction};
use crate::emulate::{self, SegReg, Segment};
use crate::vcpu::{SavedMsr, VCpu};
use crate::vmcs::{ActiveVmcs, Field};
use iced_x86::Code;

const INTR_TYPE_HARDWARE_EXCEPTION: u32 = 3;
const UD_VECTOR: u32 = 6;

pub fn handle_exception_nmi(vcpu: &mut VCpu, vmcs: &ActiveVmcs) {
    let intr_info = vmcs.read32(Field::VmExitInterruptionInfo);
    let ty = (intr_info >> 8) & 0x7;
    let vector = intr_info & 0xff;

    if vector == UD_VECTOR && ty == INTR_TYPE_HARDWARE_EXCEPTION {
        match emulate::get_instruction(vmcs).code() {
            Code::Syscall => return handle_syscall(vcpu, vmcs),
            Code::Sysretq | Code::Sysretd => return handle_sysret(vcpu, vmcs),
            _ => {}
        }
    }

    dump_vmcs(vcpu, vmcs);
    panic!(
        "vmx: cannot handle exception/nmi (vector {}, type {})",
        vector, ty
    );
}

fn handle_syscall(vcpu: &mut VCpu, vmcs: &ActiveVmcs) {
    log::info!("vmx: emulating syscall");

    // RCX gets the return address, which is the instruction after the
    // faulting SYSCALL.
    skip_emulated_instruction(vmcs);
    vcpu.regs.rcx = vmcs.readl(Field::GuestRip);
    vmcs.writel(Field::GuestRip, vcpu.saved_msr(SavedMsr::Lstar));

    let rflags = vmcs.readl(Field::GuestRflags);
    vcpu.regs.r11 = rflags;
    vmcs.writel(
        Field::GuestRflags,
        rflags & !vcpu.saved_msr(SavedMsr::SyscallMask),
    );

    let star = vcpu.saved_msr(SavedMsr::Star);
    let cs = Segment {
        selector: (star >> 32) as u16 & 0xfffc,
        base: 0,
        limit: 0xfffff,
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
    let ss = Segment {
        selector: ((star >> 32) as u16).wrapping_add(8),
        base: 0,
        limit: 0xfffff,
        ty: 3,
        s: true,
        dpl: 0,
        present: true,
        avl: false,
        l: false,
        db: true,
        g: true,
        unusable: false,
    };
    emulate::set_segment(vmcs, SegReg::Cs, &cs);
    emulate::set_segment(vmcs, SegReg::Ss, &ss);
}

/// RFLAGS bits SYSRET may restore from R11; bit 1 is then forced.
const SYSRET_RFLAGS_MASK: u64 = 0x3c7fd7;

fn handle_sysret(vcpu: &mut VCpu, vmcs: &ActiveVmcs) {
    log::info!("vmx: emulating sysret");

    vmcs.writel(Field::GuestRip, vcpu.regs.rcx);
    vmcs.writel(
        Field::GuestRflags,
        (vcpu.regs.r11 & SYSRET_RFLAGS_MASK) | 2,
    );

    let star = vcpu.saved_msr(SavedMsr::Star);
    let cs = Segment {
        selector: ((star >> 48) as u16).wrapping_add(16) | 3,
        base: 0,
        limit: 0xfffff,
        ty: 11,
        s: true,
        dpl: 3,
        present: true,
        avl: false,
        l: true,
        db: false,
        g: true,
        unusable: false,
    };
    let ss = Segment {
        selector: ((star >> 48) as u16).wrapping_add(8) | 3,
        base: 0,
        limit: 0xfffff,
        ty: 3,
        s: true,
        dpl: 3,
        present: true,
        avl: false,
        l: false,
        db: true,
        g: true,
        unusable: false,
    };
    emulate::set_segment(vmcs, SegReg::Cs, &cs);
    emulate::set_segment(vmcs, SegReg::Ss, &ss);
}

#[cfg(test)]
mod tests {
    use super::*;

    // The selector algebra from the SDM, checked against the values the
    // syscall round-trip scenario uses: STAR high dword 0x00100008 puts
    // user CS at 0x10+16 and user SS at 0x10+8, low dword 0x00080000 puts
    // kernel CS at 0x8 and kernel SS at 0x10.
    #[test]
    fn star_selector_algebra() {
        let star: u64 = 0x0010_0008_0008_0000;

        let kernel_cs = (star >> 32) as u16 & 0xfffc;
        let kernel_ss = ((star >> 32) as u16).wrapping_add(8);
        assert_eq!(kernel_cs, 0x8);
        assert_eq!(kernel_ss, 0x10);

        let user_cs = ((star >> 48) as u16).wrapping_add(16) | 3;
        let user_ss = ((star >> 48) as u16).wrapping_add(8) | 3;
        assert_eq!(user_cs, 0x20 | 3);
        assert_eq!(user_ss, 0x18 | 3);
        assert_eq!(user_cs & 3, 3, "SYSRET must return to RPL 3");
    }

    #[test]
    fn sysret_rflags_mask_forces_bit_1_and_drops_rf_vm() {
        let r11: u64 = 0xffff_ffff_ffff_ffff;
        let rflags = (r11 & SYSRET_RFLAGS_MASK) | 2;
        assert_ne!(rflags & 2, 0);
        assert_eq!(rflags & (1 << 16), 0, "RF must not survive sysret");
        assert_eq!(rflags & (1 << 17), 0, "VM must not survive sysret");
        assert_eq!(rflags >> 22, 0, "reserved bits stay clear");
    }
}
