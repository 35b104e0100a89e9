//! RDMSR/WRMSR exits. The bitmap passes almost everything through; what
//! lands here is either filtered (APIC base, ICR, EFER) or a guest bug.

use super::{dump_vmcs, skip_emulated_instruction};
use crate::emulate;
use crate::vcpu::VCpu;
use crate::vmcs::{ActiveVmcs, Field};
use bedrock::x86_64::msr::{
    self, APIC_BASE_ENABLE, APIC_BASE_EXTD, IA32_APIC_BASE, IA32_EFER, X2APIC_ICR,
};
use bedrock::x86_64::Efer;

/// ICR delivery mode field.
const ICR_DELIVERY_MODE: u64 = 0x700;
const ICR_DM_INIT: u64 = 0x500;
const ICR_DM_STARTUP: u64 = 0x600;

pub fn handle_rdmsr(vcpu: &mut VCpu, vmcs: &ActiveVmcs) {
    let index = vcpu.regs.rcx as u32;

    // Only the VMX capability family is read-intercepted, and CPUID hides
    // VMX, so a well-behaved guest can never get here.
    dump_vmcs(vcpu, vmcs);
    panic!("vmx: unknown rdmsr {:#010x}", index);
}

pub fn handle_wrmsr(vcpu: &mut VCpu, vmcs: &ActiveVmcs) {
    let index = vcpu.regs.rcx as u32;
    let val = emulate::read_edx_eax(vcpu);

    match index {
        IA32_APIC_BASE => {
            // The VMM needs a working LAPIC for its own IPIs; refuse any
            // attempt to disable it. The write is passed through so the
            // physical LAPIC mode follows the guest's choice.
            assert!(
                val & APIC_BASE_ENABLE != 0,
                "vmx: guest tried to disable the LAPIC"
            );
            if val & APIC_BASE_EXTD != 0 {
                log::info!("vmx: x2apic enabled by guest");
            }
            unsafe { msr::wrmsr(index, val) };
        }
        X2APIC_ICR => match val & ICR_DELIVERY_MODE {
            // INIT and STARTUP would yank physical CPUs out from under the
            // VMM; drop them silently. The startup protocol is the VMM's
            // business, not the guest's.
            ICR_DM_INIT => {}
            ICR_DM_STARTUP => {}
            _ => unsafe { msr::wrmsr(index, val) },
        },
        IA32_EFER => {
            // Strip SCE so SYSCALL/SYSRET keep #UD-ing into the emulation
            // in the exception handler.
            log::info!("vmx: guest writes EFER = {:#018x}", val);
            vmcs.write64(Field::GuestIa32Efer, val & !Efer::SCE.bits());
        }
        _ => {
            dump_vmcs(vcpu, vmcs);
            panic!("vmx: unknown wrmsr {:#010x} = {:#018x}", index, val);
        }
    }

    skip_emulated_instruction(vmcs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn icr_delivery_mode_field() {
        // Fixed-vector IPI passes, INIT and STARTUP are swallowed.
        assert_eq!(0x0000_4086u64 & ICR_DELIVERY_MODE, 0);
        assert_eq!(0x0000_c500u64 & ICR_DELIVERY_MODE, ICR_DM_INIT);
        assert_eq!(0x0000_c608u64 & ICR_DELIVERY_MODE, ICR_DM_STARTUP);
    }

    #[test]
    fn efer_sce_is_stripped() {
        let requested = Efer::SCE.bits() | Efer::LME.bits();
        let written = requested & !Efer::SCE.bits();
        assert_eq!(written, Efer::LME.bits());
    }
}
