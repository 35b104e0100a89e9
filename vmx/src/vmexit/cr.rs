//! Control-register access exits.

use super::{dump_vmcs, skip_emulated_instruction};
use crate::emulate;
use crate::vcpu::{self, VCpu};
use crate::vmcs::{ActiveVmcs, Field};

pub fn handle_cr(vcpu: &mut VCpu, vmcs: &ActiveVmcs) {
    let qualification = vmcs.readl(Field::ExitQualification);
    let cr = qualification & 15;
    let op = (qualification >> 4) & 3;
    let reg = ((qualification >> 8) & 15) as usize;

    // op: 0 = mov to cr, 1 = mov from cr, 2 = clts, 3 = lmsw.
    if op == 0 {
        let val = emulate::register_read(vcpu, vmcs, reg);
        match cr {
            0 => {
                vcpu::set_cr0(vmcs, val);
                return skip_emulated_instruction(vmcs);
            }
            3 => {
                log::info!("vmx: guest cr3 load: {:#x}", val);
                vcpu::set_cr3(vmcs, val);
                return skip_emulated_instruction(vmcs);
            }
            4 => {
                // A faithful VMM would raise #GP when the guest sets
                // CR4.VMXE; this one just keeps the bit on.
                vcpu::set_cr4(vmcs, val);
                return skip_emulated_instruction(vmcs);
            }
            _ => {
                dump_vmcs(vcpu, vmcs);
                panic!("vmx: unknown control register {}", cr);
            }
        }
    }

    dump_vmcs(vcpu, vmcs);
    panic!("vmx: unhandled control register access: op {} cr {}", op, cr);
}
